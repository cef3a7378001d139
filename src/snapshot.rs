use log::{debug, info};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A snapshot that has been written but not finalized. It stays pending
/// until every event produced at or below its index has been
/// acknowledged by clients; finalizing earlier would let a replay from
/// the snapshot lose those events.
#[derive(Debug)]
pub struct PendingSnapshot {
    index: u64,
    buffer: Vec<u8>,
}

impl PendingSnapshot {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn writer(&mut self) -> SnapshotWriter<'_> {
        SnapshotWriter {
            buffer: &mut self.buffer,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// A finalized snapshot with its content digest.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    index: u64,
    bytes: Vec<u8>,
    digest: [u8; 32],
}

impl StoredSnapshot {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Opens a reader after re-verifying the content digest. A mismatch
    /// means the stored bytes no longer match the manifest and must not
    /// reach the state machine.
    pub fn verified_reader(&self) -> Result<SnapshotReader<'_>, SnapshotError> {
        let computed = content_digest(&self.bytes);
        if computed != self.digest {
            return Err(SnapshotError::DigestMismatch { index: self.index });
        }
        Ok(SnapshotReader { bytes: &self.bytes })
    }

    pub fn manifest(&self) -> SnapshotManifest {
        SnapshotManifest {
            index: self.index,
            size_bytes: self.bytes.len() as u64,
            digest_hex: hex_digest(&self.digest),
        }
    }
}

/// Manifest describing a finalized snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub index: u64,
    pub size_bytes: u64,
    pub digest_hex: String,
}

/// In-memory snapshot store. Holds at most the newest finalized
/// snapshot; the byte format written by the state machine is opaque.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: Option<StoredSnapshot>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_snapshot(&self) -> Option<&StoredSnapshot> {
        self.current.as_ref()
    }

    pub fn create_snapshot(&self, index: u64) -> PendingSnapshot {
        debug!("event=snapshot_create index={}", index);
        PendingSnapshot {
            index,
            buffer: Vec::new(),
        }
    }

    /// Finalizes a pending snapshot, making it the current one. Fails if
    /// a snapshot at the same or a newer index is already current.
    pub fn complete(&mut self, pending: PendingSnapshot) -> Result<u64, SnapshotError> {
        if let Some(current) = &self.current {
            if current.index >= pending.index {
                return Err(SnapshotError::Stale {
                    index: pending.index,
                    current: current.index,
                });
            }
        }
        let digest = content_digest(&pending.buffer);
        let stored = StoredSnapshot {
            index: pending.index,
            bytes: pending.buffer,
            digest,
        };
        info!(
            "event=snapshot_complete index={} size_bytes={}",
            stored.index,
            stored.bytes.len()
        );
        let index = stored.index;
        self.current = Some(stored);
        Ok(index)
    }

    /// Adopts a snapshot received from elsewhere, e.g. shipped by a
    /// leader to a lagging follower.
    pub fn restore(&mut self, index: u64, bytes: Vec<u8>) -> Result<(), SnapshotError> {
        if let Some(current) = &self.current {
            if current.index >= index {
                return Err(SnapshotError::Stale {
                    index,
                    current: current.index,
                });
            }
        }
        let digest = content_digest(&bytes);
        self.current = Some(StoredSnapshot {
            index,
            bytes,
            digest,
        });
        Ok(())
    }
}

pub struct SnapshotWriter<'a> {
    buffer: &'a mut Vec<u8>,
}

impl SnapshotWriter<'_> {
    pub fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), SnapshotError> {
        let bytes =
            serde_json::to_vec(value).map_err(|err| SnapshotError::Codec(err.to_string()))?;
        self.buffer.extend_from_slice(&bytes);
        Ok(())
    }
}

pub struct SnapshotReader<'a> {
    bytes: &'a [u8],
}

impl SnapshotReader<'_> {
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn read_json<T: DeserializeOwned>(&self) -> Result<T, SnapshotError> {
        serde_json::from_slice(self.bytes).map_err(|err| SnapshotError::Codec(err.to_string()))
    }
}

fn content_digest(bytes: &[u8]) -> [u8; 32] {
    let mut sha = Sha256::new();
    sha.update(bytes);
    sha.finalize().into()
}

fn hex_digest(digest: &[u8; 32]) -> String {
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {index} content digest mismatch")]
    DigestMismatch { index: u64 },
    #[error("snapshot {index} is not newer than current snapshot {current}")]
    Stale { index: u64, current: u64 },
    #[error("snapshot codec error: {0}")]
    Codec(String),
}
