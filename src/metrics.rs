use crate::entry::EntryKind;
use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Counters the engine reports as it applies entries. Hosts bridge these
/// into their telemetry pipeline; tests read the in-memory
/// implementation directly.
pub trait EngineMetrics {
    fn record_entry_applied(&self, kind: EntryKind);
    fn record_entry_skipped(&self);
    fn record_command_replayed(&self);
    fn record_query_executed(&self);
    fn record_query_parked(&self);
    fn record_session_registered(&self);
    fn record_session_unregistered(&self, expired: bool);
    fn record_session_suspected(&self);
    fn record_snapshot_taken(&self, index: u64);
    fn record_snapshot_installed(&self, index: u64);
    fn record_snapshot_completed(&self, index: u64);
    fn record_events_published(&self, count: usize);
    fn record_event_batches_resent(&self, count: usize);
}

#[derive(Default, Clone)]
pub struct InMemoryEngineMetrics {
    inner: Arc<Mutex<EngineMetricsSnapshot>>,
}

#[derive(Default, Clone)]
pub struct EngineMetricsSnapshot {
    pub entries_applied: HashMap<EntryKind, u64>,
    pub entries_skipped: u64,
    pub commands_replayed: u64,
    pub queries_executed: u64,
    pub queries_parked: u64,
    pub sessions_registered: u64,
    pub sessions_unregistered: u64,
    pub sessions_expired: u64,
    pub sessions_suspected: u64,
    pub snapshots_taken: u64,
    pub snapshots_installed: u64,
    pub snapshots_completed: u64,
    pub last_snapshot_index: u64,
    pub events_published: u64,
    pub event_batches_resent: u64,
}

impl InMemoryEngineMetrics {
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        self.lock_inner().clone()
    }

    fn lock_inner(&self) -> MutexGuard<'_, EngineMetricsSnapshot> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("event=in_memory_engine_metrics_poisoned; recovering state");
                poisoned.into_inner()
            }
        }
    }
}

impl EngineMetrics for InMemoryEngineMetrics {
    fn record_entry_applied(&self, kind: EntryKind) {
        let mut guard = self.lock_inner();
        *guard.entries_applied.entry(kind).or_insert(0) += 1;
    }

    fn record_entry_skipped(&self) {
        self.lock_inner().entries_skipped += 1;
    }

    fn record_command_replayed(&self) {
        self.lock_inner().commands_replayed += 1;
    }

    fn record_query_executed(&self) {
        self.lock_inner().queries_executed += 1;
    }

    fn record_query_parked(&self) {
        self.lock_inner().queries_parked += 1;
    }

    fn record_session_registered(&self) {
        self.lock_inner().sessions_registered += 1;
    }

    fn record_session_unregistered(&self, expired: bool) {
        let mut guard = self.lock_inner();
        guard.sessions_unregistered += 1;
        if expired {
            guard.sessions_expired += 1;
        }
    }

    fn record_session_suspected(&self) {
        self.lock_inner().sessions_suspected += 1;
    }

    fn record_snapshot_taken(&self, index: u64) {
        let mut guard = self.lock_inner();
        guard.snapshots_taken += 1;
        guard.last_snapshot_index = guard.last_snapshot_index.max(index);
    }

    fn record_snapshot_installed(&self, _index: u64) {
        self.lock_inner().snapshots_installed += 1;
    }

    fn record_snapshot_completed(&self, index: u64) {
        let mut guard = self.lock_inner();
        guard.snapshots_completed += 1;
        guard.last_snapshot_index = guard.last_snapshot_index.max(index);
    }

    fn record_events_published(&self, count: usize) {
        self.lock_inner().events_published += count as u64;
    }

    fn record_event_batches_resent(&self, count: usize) {
        self.lock_inner().event_batches_resent += count as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = InMemoryEngineMetrics::default();
        metrics.record_entry_applied(EntryKind::Command);
        metrics.record_entry_applied(EntryKind::Command);
        metrics.record_entry_applied(EntryKind::Register);
        metrics.record_command_replayed();
        metrics.record_session_unregistered(true);
        metrics.record_snapshot_taken(12);
        metrics.record_events_published(3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.entries_applied.get(&EntryKind::Command), Some(&2));
        assert_eq!(snapshot.entries_applied.get(&EntryKind::Register), Some(&1));
        assert_eq!(snapshot.commands_replayed, 1);
        assert_eq!(snapshot.sessions_unregistered, 1);
        assert_eq!(snapshot.sessions_expired, 1);
        assert_eq!(snapshot.last_snapshot_index, 12);
        assert_eq!(snapshot.events_published, 3);
    }
}
