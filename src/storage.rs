use crate::entry::{CompactionMode, Entry, EntryFrameError};
use log::debug;
use std::collections::BTreeMap;
use thiserror::Error;

/// One position in the committed log: either a live entry or a tombstone
/// left behind by compaction. Tombstones keep the index space contiguous
/// so the dispatcher can advance past them deterministically.
#[derive(Debug, Clone)]
enum Slot {
    Present(Entry),
    Tombstone,
}

/// In-memory committed-entry store standing in for the storage subsystem.
///
/// The physical segment format and its compactor are out of scope; this
/// store carries exactly the surface the engine contracts on: an append
/// path for committed entries, a read cursor, per-entry retention
/// releases, and the compaction indices the engine advances.
#[derive(Debug)]
pub struct Log {
    slots: BTreeMap<u64, Slot>,
    last_index: u64,
    open: bool,
    compactor: Compactor,
}

impl Log {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            last_index: 0,
            open: true,
            compactor: Compactor::default(),
        }
    }

    pub fn append(&mut self, entry: Entry) -> Result<u64, LogError> {
        if !self.open {
            return Err(LogError::Closed);
        }
        let expected = self.last_index + 1;
        if entry.index != expected {
            return Err(LogError::NonContiguous {
                expected,
                observed: entry.index,
            });
        }
        let index = entry.index;
        self.slots.insert(index, Slot::Present(entry));
        self.last_index = index;
        Ok(index)
    }

    /// Ingests an entry from its wire frame. This is the path a
    /// replication layer uses when handing committed frames to the store.
    pub fn append_encoded(&mut self, bytes: &[u8]) -> Result<u64, LogError> {
        let entry = Entry::decode(bytes)?;
        self.append(entry)
    }

    /// Opens a read cursor positioned at `from_index`.
    pub fn reader_from(&self, from_index: u64) -> LogCursor {
        LogCursor::from_index(from_index)
    }

    pub fn entry(&self, index: u64) -> Option<&Entry> {
        match self.slots.get(&index) {
            Some(Slot::Present(entry)) => Some(entry),
            _ => None,
        }
    }

    /// True when the position exists but its entry was compacted away.
    pub fn is_tombstone(&self, index: u64) -> bool {
        matches!(self.slots.get(&index), Some(Slot::Tombstone))
    }

    pub fn contains(&self, index: u64) -> bool {
        self.slots.contains_key(&index)
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    /// Attaches a retention hint to an applied entry. The entry stays
    /// readable until a compaction pass removes it.
    pub fn release(&mut self, index: u64, mode: CompactionMode) {
        self.compactor.releases.insert(index, mode);
    }

    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    pub fn compactor_mut(&mut self) -> &mut Compactor {
        &mut self.compactor
    }

    /// Removes entries that are safe to drop: everything at or below the
    /// snapshot index, plus sequentially-released entries at or below the
    /// minor index. Quorum and stricter releases are retained; replication
    /// progress is not tracked here.
    pub fn compact(&mut self) {
        let snapshot_index = self.compactor.snapshot_index;
        let minor_index = self.compactor.minor_index;
        let mut removed = 0u64;
        for (index, slot) in self.slots.iter_mut() {
            if matches!(slot, Slot::Tombstone) {
                continue;
            }
            let sequential = matches!(
                self.compactor.releases.get(index),
                Some(CompactionMode::Sequential)
            );
            if *index <= snapshot_index || (sequential && *index <= minor_index) {
                *slot = Slot::Tombstone;
                removed += 1;
            }
        }
        debug!(
            "event=log_compact snapshot_index={} minor_index={} removed={}",
            snapshot_index, minor_index, removed
        );
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

/// Compaction bookkeeping the engine drives. `compact_index` is advanced
/// by the storage host when the log becomes compactable; `snapshot_index`
/// and `minor_index` are advanced by the engine as snapshots finalize and
/// clients acknowledge events.
#[derive(Debug, Default)]
pub struct Compactor {
    compact_index: u64,
    snapshot_index: u64,
    minor_index: u64,
    releases: BTreeMap<u64, CompactionMode>,
}

impl Compactor {
    pub fn compact_index(&self) -> u64 {
        self.compact_index
    }

    pub fn set_compact_index(&mut self, index: u64) {
        self.compact_index = self.compact_index.max(index);
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_index
    }

    pub fn set_snapshot_index(&mut self, index: u64) {
        self.snapshot_index = self.snapshot_index.max(index);
    }

    pub fn minor_index(&self) -> u64 {
        self.minor_index
    }

    pub fn set_minor_index(&mut self, index: u64) {
        self.minor_index = self.minor_index.max(index);
    }

    pub fn release_mode(&self, index: u64) -> Option<CompactionMode> {
        self.releases.get(&index).copied()
    }
}

/// Read cursor over the committed log. The engine holds exactly one and
/// treats it as exclusive for the duration of an apply call.
#[derive(Debug, Clone)]
pub struct LogCursor {
    next_index: u64,
}

impl LogCursor {
    pub fn from_index(index: u64) -> Self {
        Self { next_index: index }
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn has_next(&self, log: &Log) -> bool {
        self.next_index <= log.last_index() && log.contains(self.next_index)
    }

    /// Reads the slot at the cursor and advances. Returns `None` for a
    /// tombstone so callers can skip compacted positions.
    pub fn next<'a>(&mut self, log: &'a Log) -> Option<&'a Entry> {
        let index = self.next_index;
        self.next_index += 1;
        log.entry(index)
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log closed")]
    Closed,
    #[error("non-contiguous append: expected {expected}, observed {observed}")]
    NonContiguous { expected: u64, observed: u64 },
    #[error(transparent)]
    Frame(#[from] EntryFrameError),
}
