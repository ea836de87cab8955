//! Manifest / Version Set Module
//!
//! Tracks which sorted tables constitute the engine's logical state.
//!
//! A [`Version`] is one immutable view of the table set, grouped into
//! levels: level 0 holds freshly flushed tables (newest first, key ranges
//! may overlap), levels ≥ 1 hold compacted tables with disjoint ranges.
//! Versions are copy-on-write: every flush or compaction journals a
//! [`VersionEdit`] to the manifest, builds a new Version, and atomically
//! swaps it in. Readers and snapshots keep old Versions alive through
//! reference counting; superseded table files are deleted only when the
//! last reference drops.

mod edit;
mod manifest;
mod set;

use std::sync::Arc;

pub use edit::{AddedTable, DeletedTable, VersionEdit};
pub use set::VersionSet;

use crate::table::SortedTable;

/// Number of levels in the tree; level 0 plus six compacted levels
pub const NUM_LEVELS: usize = 7;

/// One immutable snapshot of the live table set
pub struct Version {
    /// `levels[0]` is newest-first and may overlap; deeper levels are
    /// disjoint and sorted by min key
    levels: Vec<Vec<Arc<SortedTable>>>,
}

impl Version {
    /// A Version with no tables
    pub fn empty() -> Self {
        Self {
            levels: vec![Vec::new(); NUM_LEVELS],
        }
    }

    pub fn levels(&self) -> &[Vec<Arc<SortedTable>>] {
        &self.levels
    }

    /// Total number of live tables
    pub fn table_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    /// Total bytes in a level
    pub fn level_size(&self, level: usize) -> u64 {
        self.levels[level]
            .iter()
            .map(|t| t.meta().file_size)
            .sum()
    }

    /// Tables that might hold `key`, newest data first: every overlapping
    /// level-0 table in recency order, then at most one table per deeper
    /// level (ranges are disjoint there).
    pub fn tables_for_key(&self, key: &[u8]) -> Vec<Arc<SortedTable>> {
        let mut result = Vec::new();

        for table in &self.levels[0] {
            if table.meta().might_contain(key) {
                result.push(Arc::clone(table));
            }
        }

        for level in &self.levels[1..] {
            // Disjoint and sorted by min key: binary search the one
            // candidate whose range can contain the key
            let idx = level.partition_point(|t| t.max_key() < key);
            if let Some(table) = level.get(idx) {
                if table.meta().might_contain(key) {
                    result.push(Arc::clone(table));
                }
            }
        }

        result
    }

    /// Tables in `level` overlapping `[start, end]`
    pub fn overlapping_in_level(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<Arc<SortedTable>> {
        self.levels[level]
            .iter()
            .filter(|t| t.meta().overlaps(start, end))
            .map(Arc::clone)
            .collect()
    }

    /// Deepest level that currently holds any table
    pub fn max_populated_level(&self) -> usize {
        self.levels
            .iter()
            .rposition(|l| !l.is_empty())
            .unwrap_or(0)
    }

    /// Build the successor Version: drop the edit's deleted tables, add
    /// its new ones (level 0 prepends, deeper levels keep min-key order).
    pub(crate) fn apply(&self, edit: &VersionEdit, new_tables: &[(u32, Arc<SortedTable>)]) -> Version {
        let mut levels = self.levels.clone();

        for deleted in &edit.deleted {
            levels[deleted.level as usize].retain(|t| t.id() != deleted.id);
        }

        // `new_tables` lists level-0 additions newest-first; the block is
        // prepended as a whole so that order is preserved
        let mut l0_pos = 0;
        for (level, table) in new_tables {
            let level = *level as usize;
            if level == 0 {
                levels[0].insert(l0_pos, Arc::clone(table));
                l0_pos += 1;
            } else {
                let idx = levels[level]
                    .partition_point(|t| t.min_key() < table.min_key());
                levels[level].insert(idx, Arc::clone(table));
            }
        }

        Version { levels }
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<usize> = self.levels.iter().map(Vec::len).collect();
        f.debug_struct("Version")
            .field("tables_per_level", &counts)
            .finish()
    }
}
