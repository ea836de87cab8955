//! K-way merge over entry sources
//!
//! Merges any number of internally-ordered entry streams into one stream
//! in `(key asc, seq desc)` order. Sources are ranked: when two sources
//! yield the same internal key (possible when a just-flushed memtable and
//! its table briefly coexist in a captured view), the lower-ranked
//! (newer) source wins and the duplicate is dropped.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::types::{internal_cmp, Entry};

/// Boxed source of ordered entries
pub type EntrySource = Box<dyn Iterator<Item = Result<Entry>> + Send>;

struct HeapItem {
    entry: Entry,
    /// Index of the source this came from; lower = newer data
    rank: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}
impl Eq for HeapItem {}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; invert so the smallest internal key
        // (and on ties the newest source) surfaces first
        internal_cmp(&self.entry.key, self.entry.seq, &other.entry.key, other.entry.seq)
            .then_with(|| self.rank.cmp(&other.rank))
            .reverse()
    }
}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Merged iterator over all sources, in internal order
pub struct MergeIterator {
    sources: Vec<EntrySource>,
    heap: BinaryHeap<HeapItem>,
    /// Last yielded (key, seq) for duplicate suppression
    last: Option<(bytes::Bytes, u64)>,
    errored: bool,
}

impl MergeIterator {
    /// Build a merge over `sources`, ordered newest data first
    pub fn new(sources: Vec<EntrySource>) -> Result<Self> {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            last: None,
            errored: false,
        };
        for rank in 0..merge.sources.len() {
            merge.advance(rank)?;
        }
        Ok(merge)
    }

    /// Pull the next entry from source `rank` into the heap
    fn advance(&mut self, rank: usize) -> Result<()> {
        if let Some(item) = self.sources[rank].next() {
            self.heap.push(HeapItem {
                entry: item?,
                rank,
            });
        }
        Ok(())
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.errored {
                return None;
            }

            let item = self.heap.pop()?;
            if let Err(e) = self.advance(item.rank) {
                self.errored = true;
                return Some(Err(e));
            }

            // Suppress an exact duplicate version from an older source
            if let Some((key, seq)) = &self.last {
                if *key == item.entry.key && *seq == item.entry.seq {
                    continue;
                }
            }
            self.last = Some((item.entry.key.clone(), item.entry.seq));

            return Some(Ok(item.entry));
        }
    }
}
