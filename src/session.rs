use crate::event::EventBatch;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Server-side session lifecycle.
///
/// `Open` and `Suspicious` are the active states. A session becomes
/// `Suspicious` when the deterministic clock outruns its timeout, and
/// returns to `Open` on the next keep-alive or connect. Only a committed
/// unregister entry moves a session to `Expired` or `Closed`; local
/// timeouts never do, since compaction can elide the keep-alives that
/// would have proven liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Open,
    Suspicious,
    Inactive,
    Expired,
    Closed,
}

impl SessionState {
    pub fn active(self) -> bool {
        matches!(self, SessionState::Open | SessionState::Suspicious)
    }
}

/// Cached outcome of one applied command. `output` carries either the
/// state machine's bytes or the deterministic message of the error it
/// raised; both replay bit-identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub index: u64,
    pub event_index: u64,
    pub output: Result<Vec<u8>, String>,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    client_id: String,
    timeout_ms: u64,
    timestamp_ms: u64,
    state: SessionState,
    command_sequence: u64,
    request_sequence: u64,
    event_index: u64,
    complete_index: u64,
    results: BTreeMap<u64, SessionResult>,
    events: VecDeque<EventBatch>,
    last_keep_alive_index: Option<u64>,
    last_connect_index: Option<u64>,
}

impl Session {
    /// Creates a session for a register entry. The session id is the
    /// index of that entry; the session stays `Inactive` until opened.
    pub fn new(id: u64, client_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            timeout_ms,
            timestamp_ms: 0,
            state: SessionState::Inactive,
            command_sequence: 0,
            request_sequence: 0,
            event_index: 0,
            complete_index: 0,
            results: BTreeMap::new(),
            events: VecDeque::new(),
            last_keep_alive_index: None,
            last_connect_index: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn set_timestamp_ms(&mut self, timestamp_ms: u64) {
        self.timestamp_ms = timestamp_ms;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn open(&mut self) {
        self.state = SessionState::Open;
    }

    pub fn suspect(&mut self) {
        if self.state == SessionState::Open {
            self.state = SessionState::Suspicious;
        }
    }

    pub fn trust(&mut self) {
        if self.state == SessionState::Suspicious {
            self.state = SessionState::Open;
        }
    }

    pub fn expire(&mut self) {
        self.state = SessionState::Expired;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn command_sequence(&self) -> u64 {
        self.command_sequence
    }

    pub fn next_command_sequence(&self) -> u64 {
        self.command_sequence + 1
    }

    pub fn set_command_sequence(&mut self, sequence: u64) {
        self.command_sequence = self.command_sequence.max(sequence);
    }

    pub fn request_sequence(&self) -> u64 {
        self.request_sequence
    }

    pub fn set_request_sequence(&mut self, sequence: u64) {
        self.request_sequence = self.request_sequence.max(sequence);
    }

    pub fn event_index(&self) -> u64 {
        self.event_index
    }

    pub fn complete_index(&self) -> u64 {
        self.complete_index
    }

    pub fn register_result(&mut self, sequence: u64, result: SessionResult) {
        self.results.insert(sequence, result);
    }

    pub fn result(&self, sequence: u64) -> Option<&SessionResult> {
        self.results.get(&sequence)
    }

    /// Evicts cached results up to and including the acknowledged
    /// sequence. Driven by the `command_sequence` field of keep-alives.
    pub fn clear_results(&mut self, up_to_sequence: u64) {
        let retained = self.results.split_off(&(up_to_sequence + 1));
        let evicted = self.results.len();
        self.results = retained;
        if evicted > 0 {
            debug!(
                "event=session_results_cleared session={} up_to={} evicted={}",
                self.id, up_to_sequence, evicted
            );
        }
    }

    pub fn cached_results(&self) -> usize {
        self.results.len()
    }

    /// Stamps a batch of events published at `index`, queues it for
    /// acknowledgement tracking, and advances the session event index.
    pub fn record_batch(&mut self, index: u64, events: Vec<Vec<u8>>) -> EventBatch {
        let batch = EventBatch {
            previous_index: self.event_index,
            event_index: index,
            events,
        };
        self.events.push_back(batch.clone());
        self.event_index = index;
        batch
    }

    /// Applies a client acknowledgement: drops batches at or below the
    /// acknowledged index and advances the completion watermark.
    pub fn ack_events(&mut self, event_index: u64) -> usize {
        let before = self.events.len();
        while let Some(front) = self.events.front() {
            if front.event_index <= event_index {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.complete_index = self.complete_index.max(event_index);
        before - self.events.len()
    }

    /// Batches the client has not acknowledged, oldest first.
    pub fn pending_batches(&self) -> impl Iterator<Item = &EventBatch> {
        self.events.iter()
    }

    pub fn pending_batch_count(&self) -> usize {
        self.events.len()
    }

    /// The completion index this session contributes to the engine-wide
    /// minimum. A session with nothing outstanding does not hold the
    /// watermark back.
    pub fn completed_index_for(&self, fallback: u64) -> u64 {
        if self.events.is_empty() {
            fallback
        } else {
            self.complete_index
        }
    }

    /// Records the latest keep-alive entry index, returning the one it
    /// replaces so the caller can release it.
    pub fn set_keep_alive_index(&mut self, index: u64) -> Option<u64> {
        self.last_keep_alive_index.replace(index)
    }

    pub fn keep_alive_index(&self) -> Option<u64> {
        self.last_keep_alive_index
    }

    pub fn set_connect_index(&mut self, index: u64) -> Option<u64> {
        self.last_connect_index.replace(index)
    }

    pub fn connect_index(&self) -> Option<u64> {
        self.last_connect_index
    }
}

/// Callbacks observing session lifecycle transitions. The set is fixed at
/// engine construction; invocation order is construction order.
pub trait SessionListener {
    fn register(&mut self, _session: &Session) {}
    fn unregister(&mut self, _session: &Session) {}
    fn expire(&mut self, _session: &Session) {}
    fn close(&mut self, _session: &Session) {}
}

/// Owns every live session, indexed by session id and by client id.
/// Iteration order is session-id order so replicas suspect and survey
/// sessions identically.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<u64, Session>,
    clients: HashMap<String, u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session) {
        self.clients.insert(session.client_id.clone(), session.id);
        self.sessions.insert(session.id, session);
    }

    pub fn get(&self, id: u64) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn get_by_client(&self, client_id: &str) -> Option<&Session> {
        self.clients
            .get(client_id)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn get_by_client_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        match self.clients.get(client_id) {
            Some(id) => self.sessions.get_mut(id),
            None => None,
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        if self.clients.get(session.client_id()) == Some(&id) {
            self.clients.remove(session.client_id());
        }
        Some(session)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_session(id: u64) -> Session {
        let mut session = Session::new(id, format!("client-{id}"), 5_000);
        session.open();
        session
    }

    #[test]
    fn suspect_and_trust_round_trip() {
        let mut session = open_session(1);
        session.suspect();
        assert_eq!(session.state(), SessionState::Suspicious);
        assert!(session.state().active());
        session.trust();
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn suspect_does_not_resurrect_closed_sessions() {
        let mut session = open_session(1);
        session.close();
        session.suspect();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.state().active());
    }

    #[test]
    fn clear_results_evicts_up_to_sequence_inclusive() {
        let mut session = open_session(1);
        for sequence in 1..=3 {
            session.register_result(
                sequence,
                SessionResult {
                    index: sequence + 10,
                    event_index: 0,
                    output: Ok(vec![sequence as u8]),
                },
            );
        }
        session.clear_results(2);
        assert!(session.result(1).is_none());
        assert!(session.result(2).is_none());
        assert!(session.result(3).is_some());
    }

    #[test]
    fn record_batch_chains_previous_index() {
        let mut session = open_session(1);
        let first = session.record_batch(2, vec![b"a".to_vec()]);
        let second = session.record_batch(3, vec![b"b".to_vec()]);
        assert_eq!(first.previous_index, 0);
        assert_eq!(first.event_index, 2);
        assert_eq!(second.previous_index, 2);
        assert_eq!(second.event_index, 3);
        assert_eq!(session.event_index(), 3);
    }

    #[test]
    fn ack_drops_acknowledged_batches_and_advances_completion() {
        let mut session = open_session(1);
        session.record_batch(2, vec![b"a".to_vec()]);
        session.record_batch(3, vec![b"b".to_vec()]);
        let dropped = session.ack_events(2);
        assert_eq!(dropped, 1);
        assert_eq!(session.complete_index(), 2);
        let remaining: Vec<u64> = session.pending_batches().map(|b| b.event_index).collect();
        assert_eq!(remaining, vec![3]);
    }

    #[test]
    fn completed_index_falls_back_when_queue_empty() {
        let mut session = open_session(1);
        assert_eq!(session.completed_index_for(9), 9);
        session.record_batch(4, vec![b"a".to_vec()]);
        assert_eq!(session.completed_index_for(9), 0);
        session.ack_events(4);
        assert_eq!(session.completed_index_for(9), 9);
    }

    #[test]
    fn registry_indexes_by_id_and_client() {
        let mut registry = SessionRegistry::new();
        registry.register(open_session(1));
        registry.register(open_session(2));
        assert_eq!(registry.get(1).map(Session::id), Some(1));
        assert_eq!(registry.get_by_client("client-2").map(Session::id), Some(2));
        let removed = registry.remove(1).unwrap();
        assert_eq!(removed.id(), 1);
        assert!(registry.get_by_client("client-1").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_reregistration_takes_over_client_index() {
        let mut registry = SessionRegistry::new();
        let mut first = Session::new(1, "c", 1_000);
        first.open();
        registry.register(first);
        let mut second = Session::new(5, "c", 1_000);
        second.open();
        registry.register(second);
        assert_eq!(registry.get_by_client("c").map(Session::id), Some(5));
        // Removing the stale session leaves the new mapping intact.
        registry.remove(1);
        assert_eq!(registry.get_by_client("c").map(Session::id), Some(5));
    }

    #[test]
    fn keep_alive_index_replacement_returns_previous() {
        let mut session = open_session(1);
        assert_eq!(session.set_keep_alive_index(3), None);
        assert_eq!(session.set_keep_alive_index(7), Some(3));
        assert_eq!(session.keep_alive_index(), Some(7));
    }
}
