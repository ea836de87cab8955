//! Sorted table iterator
//!
//! Lazy iteration over a table's entries in internal order, fetching one
//! block at a time through the block cache. Range scans start at the
//! block the sparse index selects for the lower bound and stop as soon as
//! an entry passes the upper bound; unrelated blocks are never read.

use std::ops::Bound;
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::error::Result;
use crate::types::Entry;

use super::block::Block;
use super::SortedTable;

/// Iterator over a table's entries within user-key bounds
pub struct TableIterator {
    table: Arc<SortedTable>,
    cache: Arc<BlockCache>,

    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,

    block_idx: usize,
    block: Option<Arc<Block>>,
    entry_idx: usize,
    done: bool,
}

impl TableIterator {
    /// Iterate over every entry in the table
    pub fn new(table: Arc<SortedTable>, cache: Arc<BlockCache>) -> Self {
        Self::new_range(table, cache, Bound::Unbounded, Bound::Unbounded)
    }

    /// Iterate over entries whose user key falls within the bounds
    pub fn new_range(
        table: Arc<SortedTable>,
        cache: Arc<BlockCache>,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Self {
        // Start at the block preceding the first whose first key reaches
        // the lower bound; versions of the bound key can begin in it.
        // Entries before the bound inside that block are skipped lazily.
        let block_idx = match &lower {
            Bound::Included(k) | Bound::Excluded(k) => table
                .index()
                .partition_point(|ie| ie.first_key.as_slice() < *k)
                .saturating_sub(1),
            Bound::Unbounded => 0,
        };

        Self {
            table,
            cache,
            lower: bound_to_owned(lower),
            upper: bound_to_owned(upper),
            block_idx,
            block: None,
            entry_idx: 0,
            done: false,
        }
    }

    fn within_lower(&self, key: &[u8]) -> bool {
        match &self.lower {
            Bound::Included(k) => key >= k.as_slice(),
            Bound::Excluded(k) => key > k.as_slice(),
            Bound::Unbounded => true,
        }
    }

    fn within_upper(&self, key: &[u8]) -> bool {
        match &self.upper {
            Bound::Included(k) => key <= k.as_slice(),
            Bound::Excluded(k) => key < k.as_slice(),
            Bound::Unbounded => true,
        }
    }
}

impl Iterator for TableIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if self.block.is_none() {
                if self.block_idx >= self.table.index().len() {
                    self.done = true;
                    return None;
                }
                match self.table.block(self.block_idx, &self.cache) {
                    Ok(b) => {
                        self.entry_idx = 0;
                        self.block = Some(b);
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
            let Some(block) = self.block.as_ref() else {
                continue;
            };

            if self.entry_idx >= block.len() {
                self.block = None;
                self.block_idx += 1;
                continue;
            }

            let entry = block.entries()[self.entry_idx].clone();
            self.entry_idx += 1;

            if !self.within_lower(&entry.key) {
                continue;
            }
            if !self.within_upper(&entry.key) {
                self.done = true;
                return None;
            }

            return Some(Ok(entry));
        }
    }
}

fn bound_to_owned(bound: Bound<&[u8]>) -> Bound<Vec<u8>> {
    match bound {
        Bound::Included(k) => Bound::Included(k.to_vec()),
        Bound::Excluded(k) => Bound::Excluded(k.to_vec()),
        Bound::Unbounded => Bound::Unbounded,
    }
}
