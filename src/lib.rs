//! Core library entrypoint for the replicore state-machine engine.
//!
//! The engine consumes committed Raft log entries in index order and
//! applies them deterministically to a user-supplied state machine,
//! managing client sessions, linearizable command semantics, read-only
//! query admission, snapshotting coupled to log compaction, and the
//! event-publication pipeline between server-side state changes and
//! client-visible notifications.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod client;
pub mod config;
pub mod context;
pub mod engine;
pub mod entry;
pub mod error;
pub mod event;
pub mod machine;
pub mod metrics;
pub mod session;
pub mod snapshot;
pub mod storage;

pub use client::{ClientSessionListener, EventSequencer};
pub use config::{ConfigError, EngineConfig};
pub use context::{AppContext, ScopeKind, TimerContext};
pub use engine::{
    ApplyOutcome, CompletedQuery, Engine, EngineBuilder, QueryRequest, QuerySubmission,
};
pub use entry::{CompactionMode, Entry, EntryFrame, EntryFrameError, EntryKind, EntryPayload};
pub use error::{EngineError, SerializationError};
pub use event::{
    EventBatch, EventSink, NullEventSink, PublishRequest, PublishResponse, PublishStatus,
    RecordingEventSink,
};
pub use machine::{Commit, CommitKind, StateMachine};
pub use metrics::{EngineMetrics, EngineMetricsSnapshot, InMemoryEngineMetrics};
pub use session::{
    Session, SessionListener, SessionRegistry, SessionResult, SessionState,
};
pub use snapshot::{
    PendingSnapshot, SnapshotError, SnapshotManifest, SnapshotReader, SnapshotStore,
    SnapshotWriter, StoredSnapshot,
};
pub use storage::{Compactor, Log, LogCursor, LogError};
