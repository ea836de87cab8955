//! MemTable implementation
//!
//! BTreeMap-based versioned memtable with RwLock for concurrency.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::types::{Entry, InternalKey, Value};

/// Entries buffered per lock acquisition during range iteration
const SCAN_CHUNK: usize = 128;

/// In-memory table for recent writes.
///
/// Mutable only through the engine's serialized write path while active;
/// once swapped out for flushing it is frozen and accepts only reads.
pub struct MemTable {
    /// Id tying this memtable to its WAL segment generation
    id: u64,

    /// All versions, ordered `(key asc, seq desc)`
    data: RwLock<BTreeMap<InternalKey, (Value, u64)>>,

    /// Approximate byte footprint (drives the flush threshold)
    size: AtomicUsize,

    /// Set when the table is swapped out; writes are a logic error after
    frozen: AtomicBool,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new(id: u64) -> Self {
        Self {
            id,
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    /// Insert a versioned entry (put or tombstone).
    ///
    /// Returns the new approximate size so the caller can decide whether
    /// to trigger a flush.
    pub fn insert(&self, entry: Entry) -> usize {
        debug_assert!(!self.is_frozen(), "insert into frozen memtable");

        let added = entry.approximate_size();
        let key = InternalKey::new(entry.key, entry.seq);

        self.data.write().insert(key, (entry.value, entry.expire_at));
        self.size.fetch_add(added, Ordering::Relaxed) + added
    }

    /// Latest version of `key` with `seq <= seq_bound`.
    ///
    /// Tombstones and expired entries are returned as-is; visibility is the
    /// caller's concern (the engine needs the tombstone to stop the search).
    pub fn get(&self, key: &[u8], seq_bound: u64) -> Option<Entry> {
        let from = InternalKey::new(Bytes::copy_from_slice(key), seq_bound);
        let data = self.data.read();

        let (ik, (value, expire_at)) = data
            .range((Bound::Included(from), Bound::Unbounded))
            .next()?;
        if ik.key != key {
            return None;
        }

        Some(Entry {
            key: ik.key.clone(),
            value: value.clone(),
            seq: ik.seq,
            expire_at: *expire_at,
        })
    }

    /// Lazy iteration over all versions within the user-key bounds with
    /// `seq <= seq_bound`, in internal order.
    ///
    /// The read lock is held only while a chunk is buffered, never across
    /// the caller's processing of the yielded entries.
    pub fn iter_range(
        self: &Arc<Self>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        seq_bound: u64,
    ) -> MemTableIter {
        let cursor = match lower {
            Bound::Included(k) => {
                Bound::Included(InternalKey::seek_to(Bytes::copy_from_slice(k)))
            }
            // Excluding a user key excludes every version of it; (key, 0)
            // is the last version in internal order
            Bound::Excluded(k) => {
                Bound::Excluded(InternalKey::new(Bytes::copy_from_slice(k), 0))
            }
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match upper {
            Bound::Included(k) => Bound::Included(InternalKey::new(Bytes::copy_from_slice(k), 0)),
            Bound::Excluded(k) => {
                Bound::Excluded(InternalKey::seek_to(Bytes::copy_from_slice(k)))
            }
            Bound::Unbounded => Bound::Unbounded,
        };

        MemTableIter {
            table: Arc::clone(self),
            cursor,
            upper,
            seq_bound,
            buf: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Every version in internal order, for flushing to a sorted table
    pub fn iter_all(&self) -> Vec<Entry> {
        self.data
            .read()
            .iter()
            .map(|(ik, (value, expire_at))| Entry {
                key: ik.key.clone(),
                value: value.clone(),
                seq: ik.seq,
                expire_at: *expire_at,
            })
            .collect()
    }

    /// Mark the table immutable; called at swap time by the engine
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Approximate byte footprint
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of stored versions (not distinct keys)
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Highest sequence number stored, if any
    pub fn max_seq(&self) -> Option<u64> {
        self.data.read().keys().map(|ik| ik.seq).max()
    }
}

/// Lazy range iterator over a memtable.
///
/// Resumable: each refill re-seeks from the last buffered internal key,
/// so iteration stays correct while the table keeps taking writes.
/// Versions inserted after creation surface only if their seq passes the
/// bound; callers wanting a fixed view pass a bound captured up front.
pub struct MemTableIter {
    table: Arc<MemTable>,

    /// Resume point: strictly after the last internal key examined
    cursor: Bound<InternalKey>,
    upper: Bound<InternalKey>,
    seq_bound: u64,

    buf: VecDeque<Entry>,
    exhausted: bool,
}

impl MemTableIter {
    fn refill(&mut self) {
        let data = self.table.data.read();
        let mut taken = 0;
        for (ik, (value, expire_at)) in data.range((self.cursor.clone(), self.upper.clone())) {
            taken += 1;
            if ik.seq <= self.seq_bound {
                self.buf.push_back(Entry {
                    key: ik.key.clone(),
                    value: value.clone(),
                    seq: ik.seq,
                    expire_at: *expire_at,
                });
            }
            self.cursor = Bound::Excluded(ik.clone());
            if taken == SCAN_CHUNK {
                return;
            }
        }
        self.exhausted = true;
    }
}

impl Iterator for MemTableIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        loop {
            if let Some(entry) = self.buf.pop_front() {
                return Some(entry);
            }
            if self.exhausted {
                return None;
            }
            self.refill();
        }
    }
}
