//! WAL record definitions
//!
//! Defines the logged operations and their wire framing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Entry, Value, NO_EXPIRY};

/// Record header size: seq (8) + crc (4) + len (4)
pub const RECORD_HEADER_SIZE: usize = 16;

/// Upper bound on one record's payload; anything larger during replay is
/// treated as corruption rather than an allocation request
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Operations that can be logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Put a key-value pair; `expire_at` of 0 means no TTL
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        expire_at: u64,
    },

    /// Delete a key (logs a tombstone)
    Delete { key: Vec<u8> },
}

/// A single record in the WAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Sequence number - monotonically increasing, strict append order
    pub seq: u64,

    /// The operation to replay
    pub op: Operation,
}

impl WalRecord {
    pub fn new(seq: u64, op: Operation) -> Self {
        Self { seq, op }
    }

    /// Encode to the on-disk framing: [seq][crc][len][payload]
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&self.op)?;
        let crc = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a payload whose checksum has already been verified
    pub fn decode_payload(seq: u64, payload: &[u8]) -> Result<Self> {
        let op: Operation = bincode::deserialize(payload)?;
        Ok(Self { seq, op })
    }

    /// Convert to the in-memory entry this record describes
    pub fn into_entry(self) -> Entry {
        match self.op {
            Operation::Put {
                key,
                value,
                expire_at,
            } => Entry {
                key: Bytes::from(key),
                value: Value::Put(Bytes::from(value)),
                seq: self.seq,
                expire_at,
            },
            Operation::Delete { key } => Entry {
                key: Bytes::from(key),
                value: Value::Tombstone,
                seq: self.seq,
                expire_at: NO_EXPIRY,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let record = WalRecord::new(
            7,
            Operation::Put {
                key: b"key".to_vec(),
                value: b"value".to_vec(),
                expire_at: 0,
            },
        );

        let buf = record.encode().unwrap();
        assert_eq!(u64::from_le_bytes(buf[0..8].try_into().unwrap()), 7);

        let len = u32::from_le_bytes(buf[12..16].try_into().unwrap()) as usize;
        assert_eq!(buf.len(), RECORD_HEADER_SIZE + len);

        let decoded = WalRecord::decode_payload(7, &buf[RECORD_HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn delete_converts_to_tombstone() {
        let record = WalRecord::new(3, Operation::Delete { key: b"k".to_vec() });
        let entry = record.into_entry();
        assert!(entry.value.is_tombstone());
        assert_eq!(entry.seq, 3);
    }
}
