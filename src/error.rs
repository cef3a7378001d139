use crate::snapshot::SnapshotError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine-level error taxonomy.
///
/// `UnknownSession`, `LogClosed`, and `QueryBacklogFull` are surfaced to
/// callers and leave the replica healthy. `InconsistentIndex` and
/// `Internal` indicate divergence between the log and the state machine
/// and must halt application.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown session: {0}")]
    UnknownSession(u64),
    #[error("inconsistent index applying entry {requested}: read {observed:?}")]
    InconsistentIndex {
        requested: u64,
        observed: Option<u64>,
    },
    #[error("log closed")]
    LogClosed,
    #[error("pending query backlog full")]
    QueryBacklogFull,
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

impl EngineError {
    /// Structural errors indicate replica divergence and must stop the
    /// apply loop; session errors are returned to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InconsistentIndex { .. }
                | EngineError::Internal(_)
                | EngineError::Snapshot(_)
                | EngineError::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(SerializationError::from(err))
    }
}
