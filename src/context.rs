use log::warn;
use std::collections::BTreeMap;

/// Whether the open scope may publish session events. Command scopes are
/// replicated through the log, so their publications are deterministic;
/// query scopes run on a single replica and must stay silent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Command,
    Query,
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    index: u64,
    time_ms: u64,
    kind: ScopeKind,
}

/// Events gathered by a closed scope, grouped per session in publication
/// order, along with the index they will be stamped with.
#[derive(Debug)]
pub struct ScopeCommit {
    pub index: u64,
    pub publications: Vec<(u64, Vec<Vec<u8>>)>,
}

type TimerCallback = Box<dyn FnMut(&mut TimerContext<'_>)>;

struct Task {
    callback: TimerCallback,
    interval_ms: Option<u64>,
}

struct TaskSpec {
    delay_ms: u64,
    interval_ms: Option<u64>,
    callback: TimerCallback,
}

/// Execution context for user state-machine calls.
///
/// Carries the deterministic clock, the deadline scheduler, and the
/// current callback scope. All state-machine-observable time flows
/// through `advance`, which never moves backwards, so every replica sees
/// the same clock regardless of leader wall-clock skew.
pub struct AppContext {
    time_ms: u64,
    scope: Option<Scope>,
    pending: Vec<(u64, Vec<u8>)>,
    tasks: BTreeMap<(u64, u64), Task>,
    next_task_seq: u64,
}

impl AppContext {
    pub fn new() -> Self {
        Self {
            time_ms: 0,
            scope: None,
            pending: Vec::new(),
            tasks: BTreeMap::new(),
            next_task_seq: 0,
        }
    }

    /// Folds a leader-supplied timestamp into the deterministic clock and
    /// returns the resulting state-machine time.
    pub fn advance(&mut self, timestamp_ms: u64) -> u64 {
        self.time_ms = self.time_ms.max(timestamp_ms);
        self.time_ms
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    /// Schedules a one-shot callback `delay_ms` after the current
    /// deterministic time.
    pub fn schedule_after(&mut self, delay_ms: u64, callback: TimerCallback) {
        self.insert_task(self.time_ms + delay_ms, None, callback);
    }

    /// Schedules a callback that re-arms itself every `interval_ms` after
    /// first firing `delay_ms` from now.
    pub fn schedule_repeated(&mut self, delay_ms: u64, interval_ms: u64, callback: TimerCallback) {
        self.insert_task(self.time_ms + delay_ms, Some(interval_ms), callback);
    }

    fn insert_task(&mut self, deadline_ms: u64, interval_ms: Option<u64>, callback: TimerCallback) {
        let seq = self.next_task_seq;
        self.next_task_seq += 1;
        self.tasks.insert(
            (deadline_ms, seq),
            Task {
                callback,
                interval_ms,
            },
        );
    }

    /// Runs every scheduled callback whose deadline has passed, in
    /// deadline order with insertion order breaking ties. Callbacks may
    /// publish events (stamped with the entry about to be applied) and
    /// schedule further work; newly scheduled work waits for a later tick
    /// even if already due.
    pub fn tick(&mut self, index: u64, now_ms: u64) {
        let due: Vec<(u64, u64)> = self
            .tasks
            .range(..=(now_ms, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            let Some(mut task) = self.tasks.remove(&key) else {
                continue;
            };
            let mut scheduled = Vec::new();
            {
                let mut timer = TimerContext {
                    index,
                    time_ms: now_ms,
                    publications: &mut self.pending,
                    scheduled: &mut scheduled,
                };
                (task.callback)(&mut timer);
            }
            for spec in scheduled {
                self.insert_task(now_ms + spec.delay_ms, spec.interval_ms, spec.callback);
            }
            if let Some(interval) = task.interval_ms {
                self.insert_task(key.0 + interval, Some(interval), task.callback);
            }
        }
    }

    pub fn scheduled_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Opens a callback scope. Scopes never nest; a leftover scope is a
    /// bug in the engine's handler sequencing, reported and replaced.
    pub fn init(&mut self, index: u64, time_ms: u64, kind: ScopeKind) {
        if self.scope.is_some() {
            warn!("event=scope_replaced index={} kind={:?}", index, kind);
        }
        self.scope = Some(Scope {
            index,
            time_ms,
            kind,
        });
    }

    pub fn scope_index(&self) -> Option<u64> {
        self.scope.map(|scope| scope.index)
    }

    pub fn scope_time_ms(&self) -> Option<u64> {
        self.scope.map(|scope| scope.time_ms)
    }

    /// Publishes an event to a session from within the open scope.
    /// Query scopes discard publications: queries are not replicated, so
    /// anything they published would differ between replicas.
    pub fn publish(&mut self, session_id: u64, event: Vec<u8>) {
        match self.scope {
            Some(scope) if scope.kind == ScopeKind::Command => {
                self.pending.push((session_id, event));
            }
            Some(_) => {
                warn!(
                    "event=query_publication_discarded session={} len={}",
                    session_id,
                    event.len()
                );
            }
            None => {
                warn!(
                    "event=publication_outside_scope session={} len={}",
                    session_id,
                    event.len()
                );
            }
        }
    }

    /// Closes the scope and hands back everything it published, grouped
    /// per session in first-publication order.
    pub fn commit(&mut self) -> ScopeCommit {
        let scope = match self.scope.take() {
            Some(scope) => scope,
            None => {
                warn!("event=commit_without_scope");
                return ScopeCommit {
                    index: 0,
                    publications: Vec::new(),
                };
            }
        };
        let mut publications: Vec<(u64, Vec<Vec<u8>>)> = Vec::new();
        for (session_id, event) in self.pending.drain(..) {
            match publications.iter_mut().find(|(id, _)| *id == session_id) {
                Some((_, events)) => events.push(event),
                None => publications.push((session_id, vec![event])),
            }
        }
        ScopeCommit {
            index: scope.index,
            publications,
        }
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability passed to scheduled callbacks while they run.
pub struct TimerContext<'a> {
    index: u64,
    time_ms: u64,
    publications: &'a mut Vec<(u64, Vec<u8>)>,
    scheduled: &'a mut Vec<TaskSpec>,
}

impl TimerContext<'_> {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn publish(&mut self, session_id: u64, event: Vec<u8>) {
        self.publications.push((session_id, event));
    }

    pub fn schedule_after(&mut self, delay_ms: u64, callback: TimerCallback) {
        self.scheduled.push(TaskSpec {
            delay_ms,
            interval_ms: None,
            callback,
        });
    }
}
