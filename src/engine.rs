use crate::config::{ConfigError, EngineConfig};
use crate::context::{AppContext, ScopeKind};
use crate::entry::{CompactionMode, Entry, EntryPayload};
use crate::error::EngineError;
use crate::event::{EventSink, NullEventSink, PublishRequest};
use crate::storage::{Log, LogCursor};
use crate::machine::{Commit, CommitKind, StateMachine};
use crate::metrics::{EngineMetrics, InMemoryEngineMetrics};
use crate::session::{Session, SessionListener, SessionRegistry, SessionResult, SessionState};
use crate::snapshot::{PendingSnapshot, SnapshotStore};
use log::{debug, info, warn};
use std::collections::VecDeque;

/// Result of applying one committed entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A register entry created this session.
    SessionRegistered(u64),
    /// A command produced (or replayed) this result.
    Command(SessionResult),
    /// The entry mutated internal state only.
    Applied,
    /// The position was compacted; nothing ran.
    Skipped,
}

/// A read-only operation tagged with the index the client last observed.
/// Queries never traverse the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub session: u64,
    pub sequence: u64,
    pub min_index: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum QuerySubmission {
    /// The applied index already covered `min_index`; the query ran.
    Ready(SessionResult),
    /// The query parked until the applied index catches up. The id keys
    /// the eventual entry in `take_completed_queries`.
    Parked(u64),
}

#[derive(Debug)]
pub struct CompletedQuery {
    pub id: u64,
    pub result: Result<SessionResult, EngineError>,
}

#[derive(Debug)]
struct ParkedQuery {
    id: u64,
    session: u64,
    min_index: u64,
    payload: Vec<u8>,
}

/// Applies committed log entries to the user state machine, in index
/// order, deterministically on every replica.
///
/// The engine is the sole owner of all session state, the applied and
/// completed indices, and the at-most-one pending snapshot. Handlers run
/// synchronously: each one advances the deterministic clock, opens a
/// scope on the application context, runs user code, and flushes the
/// events the scope published.
pub struct Engine<M: StateMachine> {
    machine: M,
    log: Log,
    cursor: LogCursor,
    snapshots: SnapshotStore,
    context: AppContext,
    registry: SessionRegistry,
    listeners: Vec<Box<dyn SessionListener>>,
    sink: Box<dyn EventSink>,
    config: EngineConfig,
    metrics: Box<dyn EngineMetrics>,
    last_applied: u64,
    last_completed: u64,
    pending_snapshot: Option<PendingSnapshot>,
    parked_queries: Vec<ParkedQuery>,
    completed_queries: VecDeque<CompletedQuery>,
    next_query_id: u64,
}

/// Assembles an engine. Listeners are invoked in the order they were
/// added; the set is fixed once the engine is built.
pub struct EngineBuilder {
    config: EngineConfig,
    listeners: Vec<Box<dyn SessionListener>>,
    sink: Box<dyn EventSink>,
    metrics: Box<dyn EngineMetrics>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            listeners: Vec::new(),
            sink: Box::new(NullEventSink),
            metrics: Box::new(InMemoryEngineMetrics::default()),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn listener(mut self, listener: Box<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn metrics(mut self, metrics: Box<dyn EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build<M: StateMachine>(
        self,
        machine: M,
        log: Log,
        snapshots: SnapshotStore,
    ) -> Result<Engine<M>, ConfigError> {
        self.config.validate()?;
        let cursor = log.reader_from(1);
        let mut engine = Engine {
            machine,
            log,
            cursor,
            snapshots,
            context: AppContext::new(),
            registry: SessionRegistry::new(),
            listeners: self.listeners,
            sink: self.sink,
            config: self.config,
            metrics: self.metrics,
            last_applied: 0,
            last_completed: 0,
            pending_snapshot: None,
            parked_queries: Vec::new(),
            completed_queries: VecDeque::new(),
            next_query_id: 0,
        };
        engine.machine.init(&mut engine.context);
        Ok(engine)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: StateMachine> Engine<M> {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// The highest index whose events every client has acknowledged.
    /// Falls back to the applied index until the first acknowledgement
    /// is recorded, so early snapshots do not stall.
    pub fn last_completed(&self) -> u64 {
        if self.last_completed > 0 {
            self.last_completed
        } else {
            self.last_applied
        }
    }

    pub fn session(&self, id: u64) -> Option<&Session> {
        self.registry.get(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.registry.iter()
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut Log {
        &mut self.log
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn pending_snapshot_index(&self) -> Option<u64> {
        self.pending_snapshot.as_ref().map(|snap| snap.index())
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn close(&mut self) {
        self.log.close();
    }

    /// Applies every committed entry up to `index`, best effort: session
    /// errors are logged and skipped, structural errors propagate.
    pub fn apply_all(&mut self, index: u64) -> Result<(), EngineError> {
        if !self.log.is_open() || index == 0 || index <= self.last_applied {
            return Ok(());
        }
        let target = index.min(self.log.last_index());
        while self.cursor.next_index() <= target {
            let position = self.cursor.next_index();
            let entry = self.cursor.next(&self.log).cloned();
            match entry {
                Some(entry) => {
                    if let Err(err) = self.apply_entry_inner(&entry) {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        debug!(
                            "event=apply_session_error index={} error={}",
                            position, err
                        );
                    }
                }
                None => self.metrics.record_entry_skipped(),
            }
            self.set_last_applied(position)?;
        }
        Ok(())
    }

    /// Applies entries through `index` and returns the outcome of the
    /// entry at exactly that position.
    pub fn apply(&mut self, index: u64) -> Result<ApplyOutcome, EngineError> {
        if !self.log.is_open() {
            return Err(EngineError::LogClosed);
        }

        // Apply everything before the target, swallowing session errors.
        while self.cursor.next_index() < index && self.cursor.next_index() <= self.log.last_index()
        {
            let position = self.cursor.next_index();
            let entry = self.cursor.next(&self.log).cloned();
            match entry {
                Some(entry) => {
                    if let Err(err) = self.apply_entry_inner(&entry) {
                        if err.is_fatal() {
                            return Err(err);
                        }
                        debug!(
                            "event=apply_session_error index={} error={}",
                            position, err
                        );
                    }
                }
                None => self.metrics.record_entry_skipped(),
            }
            self.set_last_applied(position)?;
        }

        if self.cursor.next_index() != index || !self.log.contains(index) {
            return Err(EngineError::InconsistentIndex {
                requested: index,
                observed: None,
            });
        }

        let result = match self.cursor.next(&self.log).cloned() {
            Some(entry) => {
                if entry.index != index {
                    return Err(EngineError::InconsistentIndex {
                        requested: index,
                        observed: Some(entry.index),
                    });
                }
                self.apply_entry_inner(&entry)
            }
            None => {
                self.metrics.record_entry_skipped();
                Ok(ApplyOutcome::Skipped)
            }
        };
        // The applied index advances even when the entry was compacted
        // or the handler surfaced a session error.
        self.set_last_applied(index)?;
        result
    }

    /// Applies an already-read entry directly.
    pub fn apply_entry(&mut self, entry: &Entry) -> Result<ApplyOutcome, EngineError> {
        if !self.log.is_open() {
            return Err(EngineError::LogClosed);
        }
        let result = self.apply_entry_inner(entry);
        if let Err(err) = &result {
            if err.is_fatal() {
                return result;
            }
        }
        self.set_last_applied(entry.index)?;
        result
    }

    fn apply_entry_inner(&mut self, entry: &Entry) -> Result<ApplyOutcome, EngineError> {
        debug!(
            "event=apply_entry index={} term={} kind={:?}",
            entry.index,
            entry.term,
            entry.kind()
        );
        let outcome = match &entry.payload {
            EntryPayload::Register {
                client_id,
                timeout_ms,
            } => self.apply_register(entry.index, entry.timestamp_ms, client_id, *timeout_ms),
            EntryPayload::KeepAlive {
                session,
                command_sequence,
                event_index,
            } => self.apply_keep_alive(
                entry.index,
                entry.timestamp_ms,
                *session,
                *command_sequence,
                *event_index,
            ),
            EntryPayload::Unregister { session, expired } => {
                self.apply_unregister(entry.index, entry.timestamp_ms, *session, *expired)
            }
            EntryPayload::Connect { client_id } => {
                self.apply_connect(entry.index, entry.timestamp_ms, client_id)
            }
            EntryPayload::Command {
                session,
                sequence,
                payload,
            } => self.apply_command(entry.index, entry.timestamp_ms, *session, *sequence, payload),
            EntryPayload::Initialize => self.apply_initialize(entry.index, entry.timestamp_ms),
            EntryPayload::Configuration { members } => {
                self.apply_configuration(entry.index, members)
            }
        };
        if outcome.is_ok() {
            self.metrics.record_entry_applied(entry.kind());
        }
        outcome
    }

    fn apply_register(
        &mut self,
        index: u64,
        timestamp_ms: u64,
        client_id: &str,
        timeout_ms: u64,
    ) -> Result<ApplyOutcome, EngineError> {
        let time = self.context.advance(timestamp_ms);

        let mut session = Session::new(index, client_id, timeout_ms);
        // The executor clock is monotone; the entry timestamp may lag it
        // after a leadership change, so the session starts at the clock.
        session.set_timestamp_ms(time);
        self.registry.register(session);

        self.suspect_sessions(0, time);

        if !self.log.is_open() {
            return Err(EngineError::LogClosed);
        }

        self.context.tick(index, time);
        self.context.init(index, time, ScopeKind::Command);
        {
            let session = self
                .registry
                .get(index)
                .ok_or_else(|| EngineError::Internal(format!("registered session {index} lost")))?;
            for listener in &mut self.listeners {
                listener.register(session);
            }
        }
        // Open only after listeners ran, so nothing publishes to the
        // session before the client has learned its id.
        if let Some(session) = self.registry.get_mut(index) {
            session.open();
        }

        let last_completed = self.calculate_last_completed(index);
        self.flush_scope();
        self.set_last_completed(last_completed);

        self.metrics.record_session_registered();
        info!(
            "event=session_register session={} client={} timeout_ms={}",
            index, client_id, timeout_ms
        );
        Ok(ApplyOutcome::SessionRegistered(index))
    }

    fn apply_keep_alive(
        &mut self,
        index: u64,
        timestamp_ms: u64,
        session_id: u64,
        command_sequence: u64,
        event_index: u64,
    ) -> Result<ApplyOutcome, EngineError> {
        let time = self.context.advance(timestamp_ms);
        // Time still progresses deterministically even when the session
        // is unknown; the leader committed the entry with its timestamp.
        self.suspect_sessions(session_id, time);

        let state = self.registry.get(session_id).map(|s| s.state());
        match state {
            None => {
                self.log.release(index, CompactionMode::Quorum);
                Err(EngineError::UnknownSession(session_id))
            }
            Some(state) if !state.active() => {
                self.log.release(index, CompactionMode::Quorum);
                Err(EngineError::UnknownSession(session_id))
            }
            Some(_) => {
                if !self.log.is_open() {
                    return Err(EngineError::LogClosed);
                }
                let previous_keep_alive = {
                    let session = self
                        .registry
                        .get_mut(session_id)
                        .ok_or(EngineError::UnknownSession(session_id))?;
                    session.trust();
                    session.set_timestamp_ms(time);
                    session.set_request_sequence(command_sequence);
                    session.set_keep_alive_index(index)
                };
                if let Some(previous) = previous_keep_alive {
                    self.log.release(previous, CompactionMode::Sequential);
                }

                self.context.tick(index, time);
                self.context.init(index, time, ScopeKind::Command);

                let resend: Vec<PublishRequest> = {
                    let session = self
                        .registry
                        .get_mut(session_id)
                        .ok_or(EngineError::UnknownSession(session_id))?;
                    session.clear_results(command_sequence);
                    session.ack_events(event_index);
                    session
                        .pending_batches()
                        .map(|batch| PublishRequest::from_batch(session_id, batch))
                        .collect()
                };
                let resent = resend.len();
                for request in resend {
                    self.sink.publish(request);
                }
                if resent > 0 {
                    self.metrics.record_event_batches_resent(resent);
                }

                let last_completed = self.calculate_last_completed(index);
                self.flush_scope();
                self.set_last_completed(last_completed);
                debug!(
                    "event=session_keep_alive session={} command_sequence={} event_index={}",
                    session_id, command_sequence, event_index
                );
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    fn apply_unregister(
        &mut self,
        index: u64,
        timestamp_ms: u64,
        session_id: u64,
        expired: bool,
    ) -> Result<ApplyOutcome, EngineError> {
        let time = self.context.advance(timestamp_ms);
        self.suspect_sessions(session_id, time);

        let active = self.registry.get(session_id).map(|s| s.state().active());
        match active {
            None | Some(false) => {
                self.log.release(index, CompactionMode::Quorum);
                Err(EngineError::UnknownSession(session_id))
            }
            Some(true) => {
                if !self.log.is_open() {
                    return Err(EngineError::LogClosed);
                }
                self.context.tick(index, time);
                self.context.init(index, time, ScopeKind::Command);

                let mut session = self
                    .registry
                    .remove(session_id)
                    .ok_or(EngineError::UnknownSession(session_id))?;
                if expired {
                    session.expire();
                    for listener in &mut self.listeners {
                        listener.expire(&session);
                        listener.close(&session);
                    }
                } else {
                    for listener in &mut self.listeners {
                        listener.unregister(&session);
                        listener.close(&session);
                    }
                }
                session.close();

                // The session no longer pins its keep-alive or connect
                // entries in the log.
                if let Some(keep_alive) = session.keep_alive_index() {
                    self.log.release(keep_alive, CompactionMode::Sequential);
                }
                if let Some(connect) = session.connect_index() {
                    self.log.release(connect, CompactionMode::Sequential);
                }

                let last_completed = self.calculate_last_completed(index);
                self.flush_scope();
                self.set_last_completed(last_completed);

                self.metrics.record_session_unregistered(expired);
                info!(
                    "event=session_unregister session={} expired={}",
                    session_id, expired
                );
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    fn apply_connect(
        &mut self,
        index: u64,
        timestamp_ms: u64,
        client_id: &str,
    ) -> Result<ApplyOutcome, EngineError> {
        let replaced: Vec<u64> = match self.registry.get_by_client_mut(client_id) {
            Some(session) => {
                session.trust();
                session.set_timestamp_ms(timestamp_ms);
                // A connection is also a keep-alive for the session.
                let previous_connect = session.set_connect_index(index);
                let previous_keep_alive = session.set_keep_alive_index(index);
                previous_connect
                    .into_iter()
                    .chain(previous_keep_alive)
                    .collect()
            }
            None => {
                debug!("event=connect_unknown_client client={}", client_id);
                Vec::new()
            }
        };
        for previous in replaced {
            if previous != index {
                self.log.release(previous, CompactionMode::Sequential);
            }
        }
        Ok(ApplyOutcome::Applied)
    }

    fn apply_initialize(
        &mut self,
        index: u64,
        timestamp_ms: u64,
    ) -> Result<ApplyOutcome, EngineError> {
        let time = self.context.advance(timestamp_ms);
        // Leadership changes must not starve sessions: every timestamp is
        // bumped so the gap the change produced does not count against
        // any timeout.
        for session in self.registry.iter_mut() {
            session.set_timestamp_ms(time);
        }
        self.log.release(index, CompactionMode::Sequential);
        debug!("event=initialize_applied index={} time_ms={}", index, time);
        Ok(ApplyOutcome::Applied)
    }

    fn apply_configuration(
        &mut self,
        index: u64,
        members: &[String],
    ) -> Result<ApplyOutcome, EngineError> {
        // Configuration changes act on server state when written, not
        // when applied; the entry only needs releasing here.
        self.log.release(index, CompactionMode::Sequential);
        debug!(
            "event=configuration_applied index={} members={}",
            index,
            members.len()
        );
        Ok(ApplyOutcome::Applied)
    }

    fn apply_command(
        &mut self,
        index: u64,
        timestamp_ms: u64,
        session_id: u64,
        sequence: u64,
        payload: &[u8],
    ) -> Result<ApplyOutcome, EngineError> {
        let state = self
            .registry
            .get(session_id)
            .map(|s| (s.state(), s.next_command_sequence()));
        match state {
            None => {
                // Commands for dead sessions are proactively released;
                // they are retained until replicated to a quorum.
                self.log.release(index, CompactionMode::Quorum);
                Err(EngineError::UnknownSession(session_id))
            }
            Some((state, _)) if !state.active() => {
                self.log.release(index, CompactionMode::Quorum);
                Err(EngineError::UnknownSession(session_id))
            }
            Some((_, next_sequence)) if sequence > 0 && sequence < next_sequence => {
                if !self.log.is_open() {
                    return Err(EngineError::LogClosed);
                }
                // A sequence below the next expected one is a retry of a
                // command already applied; linearizability requires the
                // original response, verbatim.
                let cached = self
                    .registry
                    .get(session_id)
                    .and_then(|s| s.result(sequence))
                    .cloned();
                match cached {
                    Some(result) => {
                        self.metrics.record_command_replayed();
                        debug!(
                            "event=command_replayed session={} sequence={}",
                            session_id, sequence
                        );
                        Ok(ApplyOutcome::Command(result))
                    }
                    None => Err(EngineError::Internal(format!(
                        "missing cached result for session {session_id} sequence {sequence}"
                    ))),
                }
            }
            Some(_) => {
                if !self.log.is_open() {
                    return Err(EngineError::LogClosed);
                }
                let time = self.context.advance(timestamp_ms);
                self.context.tick(index, time);
                self.context.init(index, time, ScopeKind::Command);

                let (event_index, output) = {
                    let session = self
                        .registry
                        .get(session_id)
                        .ok_or(EngineError::UnknownSession(session_id))?;
                    let event_index = session.event_index();
                    let commit = Commit::new(
                        CommitKind::Command,
                        index,
                        time,
                        session,
                        payload,
                        &mut self.context,
                    );
                    (event_index, self.machine.apply(commit))
                };
                self.flush_scope();

                // A state-machine error is a deterministic outcome, not a
                // replica failure; it is cached and returned like output.
                let result = SessionResult {
                    index,
                    event_index,
                    output: output.map_err(|err| err.to_string()),
                };
                {
                    let session = self
                        .registry
                        .get_mut(session_id)
                        .ok_or(EngineError::UnknownSession(session_id))?;
                    session.register_result(sequence, result.clone());
                    session.set_timestamp_ms(time);
                    session.set_command_sequence(sequence);
                }
                Ok(ApplyOutcome::Command(result))
            }
        }
    }

    /// Submits a read-only query. Runs immediately when the applied
    /// index already covers `min_index`, otherwise parks until it does.
    pub fn submit_query(
        &mut self,
        request: QueryRequest,
    ) -> Result<QuerySubmission, EngineError> {
        if !self.log.is_open() {
            return Err(EngineError::LogClosed);
        }
        match self.registry.get(request.session) {
            None => return Err(EngineError::UnknownSession(request.session)),
            Some(session) if !session.state().active() => {
                return Err(EngineError::UnknownSession(request.session))
            }
            Some(_) => {}
        }
        if self.last_applied >= request.min_index {
            let result = self.execute_query(request.session, &request.payload)?;
            return Ok(QuerySubmission::Ready(result));
        }
        if self.parked_queries.len() >= self.config.max_pending_queries {
            warn!(
                "event=query_backlog_full session={} min_index={}",
                request.session, request.min_index
            );
            return Err(EngineError::QueryBacklogFull);
        }
        let id = self.next_query_id;
        self.next_query_id += 1;
        debug!(
            "event=query_parked id={} session={} min_index={} last_applied={}",
            id, request.session, request.min_index, self.last_applied
        );
        self.parked_queries.push(ParkedQuery {
            id,
            session: request.session,
            min_index: request.min_index,
            payload: request.payload,
        });
        self.metrics.record_query_parked();
        Ok(QuerySubmission::Parked(id))
    }

    /// Results of parked queries that have since run, in completion
    /// order.
    pub fn take_completed_queries(&mut self) -> Vec<CompletedQuery> {
        self.completed_queries.drain(..).collect()
    }

    pub fn parked_query_count(&self) -> usize {
        self.parked_queries.len()
    }

    fn execute_query(
        &mut self,
        session_id: u64,
        payload: &[u8],
    ) -> Result<SessionResult, EngineError> {
        if !self.log.is_open() {
            return Err(EngineError::LogClosed);
        }
        match self.registry.get(session_id) {
            None => return Err(EngineError::UnknownSession(session_id)),
            Some(session) if !session.state().active() => {
                return Err(EngineError::UnknownSession(session_id))
            }
            Some(_) => {}
        }
        // Queries run against the live applied state, not the index the
        // client named.
        let index = self.last_applied;
        let time = self.context.time_ms();
        self.context.init(index, time, ScopeKind::Query);
        let (event_index, output) = {
            let session = self
                .registry
                .get(session_id)
                .ok_or(EngineError::UnknownSession(session_id))?;
            let event_index = session.event_index();
            let commit = Commit::new(
                CommitKind::Query,
                index,
                time,
                session,
                payload,
                &mut self.context,
            );
            (event_index, self.machine.apply(commit))
        };
        // Query scopes cannot publish; anything attempted was already
        // discarded at publication time.
        let _ = self.context.commit();
        self.metrics.record_query_executed();
        Ok(SessionResult {
            index,
            event_index,
            output: output.map_err(|err| err.to_string()),
        })
    }

    /// Records a client acknowledgement of published events, advancing
    /// the completion watermark that gates snapshot finalization.
    pub fn acknowledge_events(
        &mut self,
        session_id: u64,
        event_index: u64,
    ) -> Result<(), EngineError> {
        let session = self
            .registry
            .get_mut(session_id)
            .ok_or(EngineError::UnknownSession(session_id))?;
        session.ack_events(event_index);
        let last_completed = self.calculate_last_completed(self.last_applied);
        self.set_last_completed(last_completed);
        Ok(())
    }

    fn set_last_applied(&mut self, target: u64) -> Result<(), EngineError> {
        // Walk every intermediate index: compaction can leave positions
        // with no entry, but queries may still be waiting on them.
        while self.last_applied < target {
            let next = self.last_applied + 1;
            self.last_applied = next;
            self.admit_parked_queries(next);
            self.take_snapshot();
            self.install_snapshot()?;
        }
        Ok(())
    }

    fn admit_parked_queries(&mut self, index: u64) {
        if self.parked_queries.is_empty() {
            return;
        }
        let mut due = Vec::new();
        let mut position = 0;
        while position < self.parked_queries.len() {
            if self.parked_queries[position].min_index <= index {
                due.push(self.parked_queries.remove(position));
            } else {
                position += 1;
            }
        }
        for query in due {
            let result = self.execute_query(query.session, &query.payload);
            self.completed_queries.push_back(CompletedQuery {
                id: query.id,
                result,
            });
        }
    }

    fn take_snapshot(&mut self) {
        if self.pending_snapshot.is_some() || !self.machine.is_snapshottable() {
            return;
        }
        let eligible = match self.snapshots.current_snapshot() {
            None => true,
            Some(current) => {
                self.log.compactor().compact_index() > current.index()
                    && self.last_applied > current.index()
            }
        };
        if !eligible {
            return;
        }
        let mut pending = self.snapshots.create_snapshot(self.last_applied);
        info!("event=snapshot_take index={}", pending.index());
        self.machine.snapshot(&mut pending.writer());
        self.metrics.record_snapshot_taken(pending.index());
        // Written but not finalized: events up to this index must reach
        // clients before the snapshot may be exposed.
        self.pending_snapshot = Some(pending);
    }

    fn install_snapshot(&mut self) -> Result<(), EngineError> {
        if !self.machine.is_snapshottable() {
            return Ok(());
        }
        let Some(current) = self.snapshots.current_snapshot() else {
            return Ok(());
        };
        // Strict index equality: the state machine must observe exactly
        // the prefix the snapshot represents.
        if current.index() <= self.log.compactor().snapshot_index()
            || current.index() != self.last_applied
        {
            return Ok(());
        }
        let index = current.index();
        info!("event=snapshot_install index={}", index);
        let reader = current.verified_reader()?;
        self.machine.install(reader);
        self.log.compactor_mut().set_snapshot_index(index);
        self.metrics.record_snapshot_installed(index);
        Ok(())
    }

    fn complete_snapshot(&mut self) {
        let ready = self
            .pending_snapshot
            .as_ref()
            .map(|pending| self.last_completed >= pending.index())
            .unwrap_or(false);
        if !ready {
            return;
        }
        let pending = self
            .pending_snapshot
            .take()
            .expect("pending snapshot checked above");
        let index = pending.index();
        match self.snapshots.complete(pending) {
            Ok(_) => {
                info!("event=snapshot_finalize index={}", index);
                self.metrics.record_snapshot_completed(index);
            }
            Err(err) => {
                debug!("event=snapshot_discard index={} reason={}", index, err);
            }
        }
        self.log.compactor_mut().set_snapshot_index(index);
        self.log.compact();
    }

    fn set_last_completed(&mut self, value: u64) {
        if !self.log.is_open() {
            return;
        }
        self.last_completed = self.last_completed.max(value);
        self.log.compactor_mut().set_minor_index(self.last_completed);
        self.complete_snapshot();
    }

    fn calculate_last_completed(&self, index: u64) -> u64 {
        let mut last_completed = index;
        for session in self.registry.iter() {
            last_completed = last_completed.min(session.completed_index_for(index));
        }
        last_completed
    }

    /// Marks timed-out sessions suspicious. Never removes them: elided
    /// keep-alives are indistinguishable from lost clients here, so only
    /// a leader-committed unregister may kill a session.
    fn suspect_sessions(&mut self, exclude: u64, timestamp_ms: u64) {
        for session in self.registry.iter_mut() {
            if session.id() != exclude
                && session.state() == SessionState::Open
                && timestamp_ms.saturating_sub(session.timestamp_ms()) > session.timeout_ms()
            {
                session.suspect();
                self.metrics.record_session_suspected();
                warn!(
                    "event=session_suspected session={} timestamp_ms={} timeout_ms={}",
                    session.id(),
                    session.timestamp_ms(),
                    session.timeout_ms()
                );
            }
        }
    }

    /// Closes the open scope and delivers the event batches it produced.
    fn flush_scope(&mut self) {
        let commit = self.context.commit();
        let index = commit.index;
        for (session_id, events) in commit.publications {
            let count = events.len();
            match self.registry.get_mut(session_id) {
                Some(session) if session.state().active() => {
                    let batch = session.record_batch(index, events);
                    if session.pending_batch_count() >= self.config.event_queue_warn_depth {
                        warn!(
                            "event=session_event_queue_deep session={} depth={}",
                            session_id,
                            session.pending_batch_count()
                        );
                    }
                    let request = PublishRequest::from_batch(session_id, &batch);
                    self.sink.publish(request);
                    self.metrics.record_events_published(count);
                }
                _ => {
                    warn!(
                        "event=events_dropped_no_session session={} count={}",
                        session_id, count
                    );
                }
            }
        }
    }
}
