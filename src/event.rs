use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Events published by a single command scope, stamped with the chain
/// pair `(previous_index, event_index)`. For any session, batches form a
/// chain where each batch's `previous_index` equals the prior batch's
/// `event_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatch {
    pub previous_index: u64,
    pub event_index: u64,
    pub events: Vec<Vec<u8>>,
}

/// One server-to-client publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub session_id: u64,
    pub previous_index: u64,
    pub event_index: u64,
    pub events: Vec<Vec<u8>>,
}

impl PublishRequest {
    pub fn from_batch(session_id: u64, batch: &EventBatch) -> Self {
        Self {
            session_id,
            previous_index: batch.previous_index,
            event_index: batch.event_index,
            events: batch.events.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishStatus {
    Ok,
    Error,
}

/// Client acknowledgement of a publication. `index` reports the highest
/// event index the client holds; on error it tells the server where to
/// resend from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub status: PublishStatus,
    pub index: u64,
}

impl PublishResponse {
    pub fn ok(index: u64) -> Self {
        Self {
            status: PublishStatus::Ok,
            index,
        }
    }

    pub fn error(index: u64) -> Self {
        Self {
            status: PublishStatus::Error,
            index,
        }
    }
}

/// Outbound capability handed to the engine at construction. The engine
/// pushes every flushed batch here; the host transport forwards them to
/// the owning client.
pub trait EventSink {
    fn publish(&mut self, request: PublishRequest);
}

/// Sink for hosts that consume publications elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn publish(&mut self, _request: PublishRequest) {}
}

/// Sink that records every publication. Clones share the same buffer, so
/// a test can keep a handle while the engine owns the sink.
#[derive(Debug, Default, Clone)]
pub struct RecordingEventSink {
    inner: Arc<Mutex<Vec<PublishRequest>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.lock_inner().clone()
    }

    pub fn drain(&self) -> Vec<PublishRequest> {
        std::mem::take(&mut *self.lock_inner())
    }

    fn lock_inner(&self) -> MutexGuard<'_, Vec<PublishRequest>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("event=recording_event_sink_poisoned; recovering state");
                poisoned.into_inner()
            }
        }
    }
}

impl EventSink for RecordingEventSink {
    fn publish(&mut self, request: PublishRequest) {
        self.lock_inner().push(request);
    }
}
