use crc32fast::Hasher as Crc32Hasher;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A committed Raft log record.
///
/// Indices handed to the engine are strictly increasing; positions removed
/// by compaction surface as tombstones that the dispatcher skips while
/// still advancing the applied index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub timestamp_ms: u64,
    pub payload: EntryPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    Register {
        client_id: String,
        timeout_ms: u64,
    },
    KeepAlive {
        session: u64,
        command_sequence: u64,
        event_index: u64,
    },
    Unregister {
        session: u64,
        expired: bool,
    },
    Connect {
        client_id: String,
    },
    Command {
        session: u64,
        sequence: u64,
        payload: Vec<u8>,
    },
    Initialize,
    Configuration {
        members: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Register,
    KeepAlive,
    Unregister,
    Connect,
    Command,
    Initialize,
    Configuration,
}

impl EntryPayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            EntryPayload::Register { .. } => EntryKind::Register,
            EntryPayload::KeepAlive { .. } => EntryKind::KeepAlive,
            EntryPayload::Unregister { .. } => EntryKind::Unregister,
            EntryPayload::Connect { .. } => EntryKind::Connect,
            EntryPayload::Command { .. } => EntryKind::Command,
            EntryPayload::Initialize => EntryKind::Initialize,
            EntryPayload::Configuration { .. } => EntryKind::Configuration,
        }
    }
}

/// Retention hint attached to an entry when the engine releases it.
///
/// `Sequential` allows removal once the entry is superseded in order;
/// `Quorum` retains the entry until it has been replicated to a majority;
/// `Full` and `Expiring` retain longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompactionMode {
    Sequential,
    Quorum,
    Full,
    Expiring,
}

const FRAME_HEADER_BYTES: usize = 8 + 8 + 8 + 4;
const FRAME_TRAILER_BYTES: usize = 4 + 32;

/// Binary frame carrying one entry: a fixed header, the encoded payload,
/// a crc32 over the payload bytes, and a sha-256 payload digest. Both
/// integrity checks must pass on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFrame {
    pub term: u64,
    pub index: u64,
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
    pub crc32: u32,
    pub digest: [u8; 32],
}

impl EntryFrame {
    pub fn from_entry(entry: &Entry) -> Result<Self, EntryFrameError> {
        let payload = serde_json::to_vec(&entry.payload)?;
        let mut hasher = Crc32Hasher::new();
        hasher.update(&payload);
        let crc32 = hasher.finalize();
        let mut sha = Sha256::new();
        sha.update(&payload);
        let digest: [u8; 32] = sha.finalize().into();
        Ok(Self {
            term: entry.term,
            index: entry.index,
            timestamp_ms: entry.timestamp_ms,
            payload,
            crc32,
            digest,
        })
    }

    pub fn into_entry(self) -> Result<Entry, EntryFrameError> {
        self.validate()?;
        let payload: EntryPayload = serde_json::from_slice(&self.payload)?;
        Ok(Entry {
            term: self.term,
            index: self.index,
            timestamp_ms: self.timestamp_ms,
            payload,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(FRAME_HEADER_BYTES + self.payload.len() + FRAME_TRAILER_BYTES);
        bytes.extend_from_slice(&self.term.to_le_bytes());
        bytes.extend_from_slice(&self.index.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.extend_from_slice(&self.crc32.to_le_bytes());
        bytes.extend_from_slice(&self.digest);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EntryFrameError> {
        if bytes.len() < FRAME_HEADER_BYTES + FRAME_TRAILER_BYTES {
            return Err(EntryFrameError::TooShort);
        }
        let mut cursor = 0;
        let term = read_u64(bytes, &mut cursor)?;
        let index = read_u64(bytes, &mut cursor)?;
        let timestamp_ms = read_u64(bytes, &mut cursor)?;
        let payload_len = read_u32(bytes, &mut cursor)? as usize;

        let payload_end = cursor + payload_len;
        if payload_end + FRAME_TRAILER_BYTES > bytes.len() {
            return Err(EntryFrameError::Corrupt);
        }
        let payload = bytes[cursor..payload_end].to_vec();
        cursor = payload_end;
        let crc32 = read_u32(bytes, &mut cursor)?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes[cursor..cursor + 32]);

        let frame = EntryFrame {
            term,
            index,
            timestamp_ms,
            payload,
            crc32,
            digest,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn validate(&self) -> Result<(), EntryFrameError> {
        let mut hasher = Crc32Hasher::new();
        hasher.update(&self.payload);
        if hasher.finalize() != self.crc32 {
            return Err(EntryFrameError::CrcMismatch);
        }
        let mut sha = Sha256::new();
        sha.update(&self.payload);
        let computed: [u8; 32] = sha.finalize().into();
        if computed != self.digest {
            return Err(EntryFrameError::DigestMismatch);
        }
        Ok(())
    }
}

impl Entry {
    pub fn kind(&self) -> EntryKind {
        self.payload.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EntryFrameError> {
        Ok(EntryFrame::from_entry(self)?.encode())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EntryFrameError> {
        EntryFrame::decode(bytes)?.into_entry()
    }
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64, EntryFrameError> {
    let value = u64::from_le_bytes(
        bytes[*cursor..*cursor + 8]
            .try_into()
            .map_err(|_| EntryFrameError::Corrupt)?,
    );
    *cursor += 8;
    Ok(value)
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32, EntryFrameError> {
    let value = u32::from_le_bytes(
        bytes[*cursor..*cursor + 4]
            .try_into()
            .map_err(|_| EntryFrameError::Corrupt)?,
    );
    *cursor += 4;
    Ok(value)
}

#[derive(Debug, Error)]
pub enum EntryFrameError {
    #[error("frame shorter than fixed header and trailer")]
    TooShort,
    #[error("frame length fields disagree with buffer")]
    Corrupt,
    #[error("frame crc32 mismatch")]
    CrcMismatch,
    #[error("frame payload digest mismatch")]
    DigestMismatch,
    #[error("payload codec error: {0}")]
    Payload(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> Entry {
        Entry {
            term: 3,
            index: 42,
            timestamp_ms: 1_000,
            payload: EntryPayload::Command {
                session: 1,
                sequence: 7,
                payload: b"set x=1".to_vec(),
            },
        }
    }

    #[test]
    fn frame_round_trip_preserves_entry() {
        let entry = sample_entry();
        let bytes = entry.encode().unwrap();
        let decoded = Entry::decode(&bytes).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn decode_rejects_flipped_payload_byte() {
        let entry = sample_entry();
        let mut bytes = entry.encode().unwrap();
        let payload_offset = 8 + 8 + 8 + 4;
        bytes[payload_offset] ^= 0xff;
        assert!(matches!(
            EntryFrame::decode(&bytes),
            Err(EntryFrameError::CrcMismatch)
        ));
    }

    #[test]
    fn decode_rejects_corrupt_digest() {
        let entry = sample_entry();
        let mut bytes = entry.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            EntryFrame::decode(&bytes),
            Err(EntryFrameError::DigestMismatch)
        ));
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let entry = sample_entry();
        let bytes = entry.encode().unwrap();
        assert!(matches!(
            EntryFrame::decode(&bytes[..10]),
            Err(EntryFrameError::TooShort)
        ));
    }

    #[test]
    fn payload_kind_is_stable() {
        assert_eq!(
            EntryPayload::Initialize.kind(),
            EntryKind::Initialize
        );
        assert_eq!(sample_entry().kind(), EntryKind::Command);
    }
}
