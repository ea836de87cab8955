//! Core entry types shared across the engine
//!
//! Every mutation becomes an [`Entry`]: a key, a value or tombstone, a
//! monotonically increasing sequence number, and an optional expiration
//! deadline. Entries order by `(key ascending, seq descending)` so the
//! newest version of a key sorts first among duplicates — the memtable,
//! sorted tables, and the merge iterator all rely on this ordering.

use std::cmp::Ordering;

use bytes::Bytes;

/// Expiration sentinel: the entry never expires.
pub const NO_EXPIRY: u64 = 0;

/// Largest possible sequence number; used as the upper read bound when no
/// snapshot constrains a lookup.
pub const MAX_SEQ: u64 = u64::MAX;

/// A stored value: either live bytes or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A live value
    Put(Bytes),

    /// A tombstone (deleted key), retained until compaction proves no
    /// older version of the key survives anywhere below it
    Tombstone,
}

impl Value {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }

    /// Byte length of the payload (0 for tombstones)
    pub fn len(&self) -> usize {
        match self {
            Value::Put(v) => v.len(),
            Value::Tombstone => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One versioned mutation of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Value,
    /// Engine-wide sequence number of the mutation
    pub seq: u64,
    /// Unix-seconds deadline after which the entry reads as absent;
    /// [`NO_EXPIRY`] means it never expires
    pub expire_at: u64,
}

impl Entry {
    pub fn put(key: Bytes, value: Bytes, seq: u64, expire_at: u64) -> Self {
        Self {
            key,
            value: Value::Put(value),
            seq,
            expire_at,
        }
    }

    pub fn tombstone(key: Bytes, seq: u64) -> Self {
        Self {
            key,
            value: Value::Tombstone,
            seq,
            expire_at: NO_EXPIRY,
        }
    }

    /// Whether the entry's TTL has elapsed at `now` (unix seconds)
    pub fn is_expired(&self, now: u64) -> bool {
        self.expire_at != NO_EXPIRY && now >= self.expire_at
    }

    /// Approximate in-memory footprint, used for memtable flush accounting
    pub fn approximate_size(&self) -> usize {
        // key + value + seq + expire_at + tombstone flag
        self.key.len() + self.value.len() + 8 + 8 + 1
    }
}

/// Compare two `(key, seq)` pairs in internal order:
/// key ascending, sequence number descending.
pub fn internal_cmp(a_key: &[u8], a_seq: u64, b_key: &[u8], b_seq: u64) -> Ordering {
    a_key.cmp(b_key).then_with(|| b_seq.cmp(&a_seq))
}

/// Ordering key for versioned structures: `(key, seq)` compared in
/// internal order. `(k, MAX_SEQ)` sorts before every stored version of
/// `k`, which makes it the natural lower bound for seeks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalKey {
    pub key: Bytes,
    pub seq: u64,
}

impl InternalKey {
    pub fn new(key: Bytes, seq: u64) -> Self {
        Self { key, seq }
    }

    /// Seek target positioned before all versions of `key`
    pub fn seek_to(key: Bytes) -> Self {
        Self { key, seq: MAX_SEQ }
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        internal_cmp(&self.key, self.seq, &other.key, other.seq)
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_order_sorts_newest_first() {
        let older = InternalKey::new(Bytes::from_static(b"a"), 1);
        let newer = InternalKey::new(Bytes::from_static(b"a"), 2);
        let other = InternalKey::new(Bytes::from_static(b"b"), 1);

        assert!(newer < older);
        assert!(older < other);
        assert!(InternalKey::seek_to(Bytes::from_static(b"a")) < newer);
    }

    #[test]
    fn expiry_check() {
        let e = Entry::put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), 1, 100);
        assert!(!e.is_expired(99));
        assert!(e.is_expired(100));

        let forever = Entry::put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), 1, NO_EXPIRY);
        assert!(!forever.is_expired(u64::MAX - 1));
    }
}
