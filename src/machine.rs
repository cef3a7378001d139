use crate::context::AppContext;
use crate::session::Session;
use crate::snapshot::{SnapshotReader, SnapshotWriter};
use std::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Command,
    Query,
}

/// A single state-machine invocation: one committed command or one
/// admitted query. Borrows the owning session read-only and carries the
/// capabilities user code may exercise during the call (publishing
/// events, scheduling deterministic callbacks).
pub struct Commit<'a> {
    kind: CommitKind,
    index: u64,
    time_ms: u64,
    session: &'a Session,
    payload: &'a [u8],
    context: &'a mut AppContext,
}

impl<'a> Commit<'a> {
    pub fn new(
        kind: CommitKind,
        index: u64,
        time_ms: u64,
        session: &'a Session,
        payload: &'a [u8],
        context: &'a mut AppContext,
    ) -> Self {
        Self {
            kind,
            index,
            time_ms,
            session,
            payload,
            context,
        }
    }

    pub fn kind(&self) -> CommitKind {
        self.kind
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// Publishes an event to the session that issued this commit.
    pub fn publish(&mut self, event: Vec<u8>) {
        self.context.publish(self.session.id(), event);
    }

    /// Publishes an event to an arbitrary session.
    pub fn publish_to(&mut self, session_id: u64, event: Vec<u8>) {
        self.context.publish(session_id, event);
    }

    pub fn schedule_after(
        &mut self,
        delay_ms: u64,
        callback: Box<dyn FnMut(&mut crate::context::TimerContext<'_>)>,
    ) {
        self.context.schedule_after(delay_ms, callback);
    }
}

/// The user-supplied state machine.
///
/// `apply` may fail; the error is captured into the cached result for
/// the issuing session and never fails the replica. Deterministic inputs
/// must produce deterministic outputs, errors included, since every
/// replica replays the same commits.
pub trait StateMachine {
    fn init(&mut self, _context: &mut AppContext) {}

    fn apply(&mut self, commit: Commit<'_>) -> Result<Vec<u8>, Box<dyn Error>>;

    /// Opt-in for snapshot support. When false, the engine never calls
    /// `snapshot` or `install`.
    fn is_snapshottable(&self) -> bool {
        false
    }

    fn snapshot(&self, _writer: &mut SnapshotWriter<'_>) {}

    fn install(&mut self, _reader: SnapshotReader<'_>) {}
}
