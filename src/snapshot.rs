//! Snapshots
//!
//! A [`Snapshot`] is a caller-held pin on a point-in-time view: a
//! sequence bound plus references to the memtables and Version that can
//! serve reads at that point. Holding one keeps superseded tables alive
//! and delays tombstone garbage collection past its bound; dropping it
//! releases both.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::memtable::MemTable;
use crate::version::Version;

/// Registry of open snapshot sequence bounds.
///
/// Compaction asks it for the floor: the smallest bound any open
/// snapshot holds, below which obsolete versions and old tombstones are
/// reclaimable.
#[derive(Default)]
pub struct SnapshotList {
    /// bound -> number of open snapshots at that bound
    open: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, seq: u64) {
        *self.open.lock().entry(seq).or_insert(0) += 1;
    }

    pub(crate) fn release(&self, seq: u64) {
        let mut open = self.open.lock();
        if let Some(count) = open.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                open.remove(&seq);
            }
        }
    }

    /// Smallest open snapshot bound, or `u64::MAX` when none are open
    pub fn floor(&self) -> u64 {
        self.open
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX)
    }
}

/// A consistent point-in-time view of the engine.
///
/// Reads bound to a snapshot never observe sequence numbers above its
/// bound. Dropping the snapshot is the only release action; abandoned
/// scans simply let it fall out of scope.
pub struct Snapshot {
    seq: u64,
    version: Arc<Version>,
    memtable: Arc<MemTable>,
    imm: Vec<Arc<MemTable>>,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    pub(crate) fn new(
        seq: u64,
        version: Arc<Version>,
        memtable: Arc<MemTable>,
        imm: Vec<Arc<MemTable>>,
        list: Arc<SnapshotList>,
    ) -> Self {
        list.register(seq);
        Self {
            seq,
            version,
            memtable,
            imm,
            list,
        }
    }

    /// The sequence bound this snapshot reads at
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn version(&self) -> &Arc<Version> {
        &self.version
    }

    pub(crate) fn memtable(&self) -> &Arc<MemTable> {
        &self.memtable
    }

    pub(crate) fn imm(&self) -> &[Arc<MemTable>] {
        &self.imm
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.release(self.seq);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("seq", &self.seq).finish()
    }
}
