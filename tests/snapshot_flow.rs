mod common;

use common::*;
use replicore::{EngineBuilder, InMemoryEngineMetrics, Log, SnapshotStore};

#[test]
fn snapshot_stays_pending_until_events_are_acknowledged() {
    let mut harness = harness();
    let engine = &mut harness.engine;

    engine.log_mut().append(register(1, "c1", 5_000, 100)).unwrap();
    engine
        .log_mut()
        .append(command(2, 1, 1, "publish:e2", 200))
        .unwrap();
    for index in 3..=9 {
        engine
            .log_mut()
            .append(command(index, 1, index - 1, "x", index * 100))
            .unwrap();
    }
    engine.apply_all(9).unwrap();
    assert_eq!(engine.pending_snapshot_index(), None);

    // Snapshot support switches on; the next applied index takes one.
    harness.snapshottable.set(true);
    engine.log_mut().append(command(10, 1, 9, "x", 1_000)).unwrap();
    engine.apply(10).unwrap();
    assert_eq!(engine.pending_snapshot_index(), Some(10));
    assert!(engine.snapshot_store().current_snapshot().is_none());

    // The event batch at index 2 is still unacknowledged, so the
    // snapshot must not finalize no matter how far application runs.
    assert!(engine.session(1).unwrap().pending_batch_count() > 0);

    // The keep-alive acknowledges the batch; completion catches up and
    // the snapshot finalizes, advancing the compactor and compacting.
    engine.log_mut().append(keep_alive(11, 1, 9, 2, 1_100)).unwrap();
    engine.apply(11).unwrap();
    assert_eq!(engine.pending_snapshot_index(), None);
    let current = engine.snapshot_store().current_snapshot().unwrap();
    assert_eq!(current.index(), 10);
    assert_eq!(current.manifest().digest_hex.len(), 64);
    assert_eq!(engine.log().compactor().snapshot_index(), 10);
    assert!(engine.log().is_tombstone(5));

    let metrics = harness.metrics.snapshot();
    assert_eq!(metrics.snapshots_taken, 1);
    assert_eq!(metrics.snapshots_completed, 1);
    assert_eq!(metrics.last_snapshot_index, 10);

    // With a current snapshot in place, the next snapshot waits for the
    // storage compactor to pass it.
    engine.log_mut().append(command(12, 1, 10, "x", 1_200)).unwrap();
    engine.apply(12).unwrap();
    assert_eq!(engine.pending_snapshot_index(), None);

    engine.log_mut().compactor_mut().set_compact_index(13);
    engine.log_mut().append(command(13, 1, 11, "x", 1_300)).unwrap();
    engine.apply(13).unwrap();
    assert_eq!(engine.pending_snapshot_index(), Some(13));
}

#[test]
fn stored_snapshot_installs_at_exactly_its_index() {
    let (machine, snapshottable) = TestMachine::new();
    snapshottable.set(true);

    let mut snapshots = SnapshotStore::new();
    let history = vec![(2u64, "x".to_string())];
    snapshots
        .restore(3, serde_json::to_vec(&history).unwrap())
        .unwrap();

    // The log below the snapshot was compacted away on this replica.
    let mut log = Log::new();
    for index in 1..=3 {
        log.append(initialize(index, index * 100)).unwrap();
    }
    log.append(register(4, "c1", 5_000, 400)).unwrap();
    for index in 1..=3 {
        log.release(index, replicore::CompactionMode::Sequential);
    }
    log.compactor_mut().set_minor_index(3);
    log.compact();

    let metrics = InMemoryEngineMetrics::default();
    let mut engine = EngineBuilder::new()
        .metrics(Box::new(metrics.clone()))
        .build(machine, log, snapshots)
        .unwrap();

    engine.apply(4).unwrap();
    // The walk through the tombstoned prefix installed the snapshot the
    // moment the applied index equalled its index.
    assert_eq!(engine.machine().applied, history);
    assert_eq!(engine.log().compactor().snapshot_index(), 3);
    assert_eq!(engine.last_applied(), 4);
    assert_eq!(metrics.snapshot().snapshots_installed, 1);
    assert!(engine.session(4).is_some());
}
