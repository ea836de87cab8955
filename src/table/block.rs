//! Data block encode/decode
//!
//! A block is a self-contained run of encoded entries. Blocks decode into
//! memory as a whole (they are small and cached), after which lookups are
//! a binary search over the sorted entries.

use bytes::Bytes;

use crate::error::{KvError, Result};
use crate::types::{internal_cmp, Entry, Value};

use super::{ENTRY_HEADER_SIZE, TOMBSTONE_MARKER};

// =============================================================================
// Encoding
// =============================================================================

/// Accumulates entries into one block's byte buffer
pub struct BlockBuilder {
    buf: Vec<u8>,
    first_key: Option<Vec<u8>>,
    entry_count: u32,
}

impl BlockBuilder {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            first_key: None,
            entry_count: 0,
        }
    }

    /// Append an entry (entries must arrive in internal order)
    pub fn add(&mut self, entry: &Entry) {
        if self.first_key.is_none() {
            self.first_key = Some(entry.key.to_vec());
        }

        let val_len = match &entry.value {
            Value::Put(v) => v.len() as u32,
            Value::Tombstone => TOMBSTONE_MARKER,
        };

        self.buf.extend_from_slice(&(entry.key.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&val_len.to_le_bytes());
        self.buf.extend_from_slice(&entry.seq.to_le_bytes());
        self.buf.extend_from_slice(&entry.expire_at.to_le_bytes());
        self.buf.extend_from_slice(&entry.key);
        if let Value::Put(v) = &entry.value {
            self.buf.extend_from_slice(v);
        }

        self.entry_count += 1;
    }

    /// Current encoded size in bytes
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Consume the builder, returning the encoded bytes and the block's
    /// first key
    pub fn finish(self) -> (Vec<u8>, Vec<u8>) {
        (self.buf, self.first_key.unwrap_or_default())
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// A decoded, immutable data block
#[derive(Debug)]
pub struct Block {
    entries: Vec<Entry>,
    /// Encoded size, used for cache byte accounting
    encoded_size: usize,
}

impl Block {
    /// Decode a block whose checksum has already been verified
    pub fn decode(data: &[u8]) -> Result<Self> {
        let bytes = Bytes::copy_from_slice(data);
        let mut entries = Vec::new();
        let mut pos = 0usize;

        while pos < bytes.len() {
            if pos + ENTRY_HEADER_SIZE > bytes.len() {
                return Err(KvError::Corruption(format!(
                    "block entry header truncated at offset {}",
                    pos
                )));
            }

            let key_len =
                u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            let val_len = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
            let seq = u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
            let expire_at = u64::from_le_bytes(bytes[pos + 16..pos + 24].try_into().unwrap());
            pos += ENTRY_HEADER_SIZE;

            if pos + key_len > bytes.len() {
                return Err(KvError::Corruption(format!(
                    "block entry key truncated at offset {}",
                    pos
                )));
            }
            let key = bytes.slice(pos..pos + key_len);
            pos += key_len;

            let value = if val_len == TOMBSTONE_MARKER {
                Value::Tombstone
            } else {
                let val_len = val_len as usize;
                if pos + val_len > bytes.len() {
                    return Err(KvError::Corruption(format!(
                        "block entry value truncated at offset {}",
                        pos
                    )));
                }
                let v = bytes.slice(pos..pos + val_len);
                pos += val_len;
                Value::Put(v)
            };

            entries.push(Entry {
                key,
                value,
                seq,
                expire_at,
            });
        }

        Ok(Self {
            entries,
            encoded_size: data.len(),
        })
    }

    /// Latest version of `key` with `seq <= seq_bound`, if this block
    /// holds one
    pub fn get(&self, key: &[u8], seq_bound: u64) -> Option<&Entry> {
        // First entry at or after (key, seq_bound) in internal order
        let idx = self
            .entries
            .partition_point(|e| internal_cmp(&e.key, e.seq, key, seq_bound).is_lt());
        let entry = self.entries.get(idx)?;
        (entry.key == key).then_some(entry)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encoded byte size (cache charge)
    pub fn encoded_size(&self) -> usize {
        self.encoded_size
    }
}
