//! Compactor Module
//!
//! Background merging of sorted tables to bound read amplification and
//! reclaim space from overwritten, deleted, and expired keys.
//!
//! ## Trigger Policy
//! The thresholds in [`Config`] are the sole trigger mechanism:
//! - level 0 compacts into level 1 once it accumulates
//!   `l0_compaction_trigger` tables (scored by count)
//! - level n ≥ 1 compacts into level n+1 once its total bytes exceed
//!   `level_base_size * level_size_multiplier^(n-1)` (scored by ratio)
//! The level with the highest score ≥ 1.0 is compacted first.
//!
//! ## Drop Rules
//! During the k-way merge, a version of a key is dropped when a newer
//! version of the same key is visible to every open snapshot. Tombstones
//! and expired entries are additionally dropped outright when the output
//! lands in the bottom-most populated level (nothing older can
//! resurrect) and no open snapshot might still read them.

mod merge;

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

pub use merge::{EntrySource, MergeIterator};

use crate::cache::BlockCache;
use crate::config::Config;
use crate::error::Result;
use crate::table::{SortedTable, TableBuilder, TableIterator};
use crate::types::{Entry, Value};
use crate::version::{Version, VersionEdit, VersionSet, NUM_LEVELS};

/// One unit of compaction work: merge `inputs` (from `level`) with
/// `next_inputs` (from `target_level`) into new tables at `target_level`.
pub struct CompactionTask {
    pub level: usize,
    pub target_level: usize,
    pub inputs: Vec<Arc<SortedTable>>,
    pub next_inputs: Vec<Arc<SortedTable>>,
    /// Output lands in the deepest populated level: tombstones and
    /// expired entries below the snapshot floor can be purged
    pub bottom: bool,
}

/// The edit and open handles produced by a completed compaction, ready
/// for the caller to install
pub struct CompactionOutcome {
    pub edit: VersionEdit,
    pub new_tables: Vec<(u32, Arc<SortedTable>)>,
}

/// Score the levels of `version` and pick the most urgent compaction,
/// if any threshold is exceeded
pub fn pick_compaction(version: &Version, config: &Config) -> Option<CompactionTask> {
    let mut best: Option<(f64, usize)> = None;

    let l0_count = version.levels()[0].len();
    if l0_count > 0 {
        let score = l0_count as f64 / config.l0_compaction_trigger as f64;
        if score >= 1.0 {
            best = Some((score, 0));
        }
    }

    for level in 1..NUM_LEVELS - 1 {
        let size = version.level_size(level);
        if size == 0 {
            continue;
        }
        let threshold = config.level_base_size
            * config.level_size_multiplier.pow(level as u32 - 1);
        let score = size as f64 / threshold as f64;
        if score >= 1.0 && best.map_or(true, |(s, _)| score > s) {
            best = Some((score, level));
        }
    }

    let (score, level) = best?;
    let target_level = level + 1;

    // Level 0 tables overlap, so all of them go at once; deeper levels
    // move one table at a time (the largest) to bound the merge width.
    let inputs: Vec<Arc<SortedTable>> = if level == 0 {
        version.levels()[0].to_vec()
    } else {
        version.levels()[level]
            .iter()
            .max_by_key(|t| t.meta().file_size)
            .map(Arc::clone)
            .into_iter()
            .collect()
    };
    if inputs.is_empty() {
        return None;
    }

    let start = inputs.iter().map(|t| t.min_key().to_vec()).min()?;
    let end = inputs.iter().map(|t| t.max_key().to_vec()).max()?;
    let next_inputs = version.overlapping_in_level(target_level, &start, &end);

    let bottom = target_level >= version.max_populated_level();

    debug!(
        level,
        target_level,
        score,
        inputs = inputs.len(),
        next_inputs = next_inputs.len(),
        bottom,
        "picked compaction"
    );

    Some(CompactionTask {
        level,
        target_level,
        inputs,
        next_inputs,
        bottom,
    })
}

/// Execute a compaction task: stream a k-way merge of the inputs into
/// new disjoint tables at the target level, applying the drop rules.
///
/// `snapshot_floor` is the smallest sequence bound any open snapshot
/// holds (`u64::MAX` when none are open). `now` is the unix time used to
/// judge expiration.
pub fn run_compaction(
    dir: &Path,
    config: &Config,
    cache: &Arc<BlockCache>,
    versions: &VersionSet,
    task: &CompactionTask,
    snapshot_floor: u64,
    now: u64,
) -> Result<CompactionOutcome> {
    let sources: Vec<EntrySource> = task
        .inputs
        .iter()
        .chain(task.next_inputs.iter())
        .map(|t| {
            Box::new(TableIterator::new(Arc::clone(t), Arc::clone(cache))) as EntrySource
        })
        .collect();
    let merge = MergeIterator::new(sources)?;

    let mut outputs: Vec<(u32, Arc<SortedTable>)> = Vec::new();
    let mut builder: Option<TableBuilder> = None;
    let mut metas = Vec::new();

    // Per-key drop state
    let mut current_key: Option<bytes::Bytes> = None;
    let mut prev_seq_in_key = 0u64;

    let mut input_entries = 0u64;
    let mut dropped_entries = 0u64;

    for item in merge {
        let entry = item?;
        input_entries += 1;

        let same_key = current_key.as_ref() == Some(&entry.key);
        if !same_key {
            // Key group finished: cut the output here if it is full, so
            // versions of one key never straddle two output tables
            let full = builder
                .as_ref()
                .map_or(false, |b| b.data_size() >= config.target_table_size);
            if full {
                if let Some(finished) = builder.take() {
                    metas.push(finished.finish()?);
                }
            }
            current_key = Some(entry.key.clone());
        }

        if !keep(&entry, same_key, prev_seq_in_key, task.bottom, snapshot_floor, now) {
            dropped_entries += 1;
            prev_seq_in_key = entry.seq;
            continue;
        }
        prev_seq_in_key = entry.seq;

        if builder.is_none() {
            builder = Some(TableBuilder::new(
                dir,
                versions.allocate_table_id(),
                config.block_size,
            )?);
        }
        if let Some(b) = builder.as_mut() {
            b.add(&entry)?;
        }
    }

    if let Some(b) = builder.take() {
        if b.entry_count() > 0 {
            metas.push(b.finish()?);
        }
    }

    let mut edit = VersionEdit::new();
    for table in task.inputs.iter() {
        edit.delete_table(task.level as u32, table.id());
    }
    for table in task.next_inputs.iter() {
        edit.delete_table(task.target_level as u32, table.id());
    }
    for meta in metas {
        let table = Arc::new(SortedTable::open(dir, meta.clone())?);
        edit.add_table(task.target_level as u32, meta);
        outputs.push((task.target_level as u32, table));
    }

    info!(
        level = task.level,
        target_level = task.target_level,
        input_tables = task.inputs.len() + task.next_inputs.len(),
        output_tables = outputs.len(),
        input_entries,
        dropped_entries,
        "compaction complete"
    );

    Ok(CompactionOutcome {
        edit,
        new_tables: outputs,
    })
}

/// Decide whether a merged entry survives compaction.
///
/// `same_key` says whether an earlier (newer) version of this key was
/// already seen, in which case `prev_seq` is that version's sequence.
fn keep(
    entry: &Entry,
    same_key: bool,
    prev_seq: u64,
    bottom: bool,
    snapshot_floor: u64,
    now: u64,
) -> bool {
    // An older version is obsolete once some newer version is visible to
    // every open snapshot (and to latest-reads)
    if same_key && prev_seq <= snapshot_floor {
        return false;
    }

    // Newest surviving version: purge deletions and expired entries when
    // nothing below this level could resurrect the key and no snapshot
    // can still read them
    if bottom && entry.seq <= snapshot_floor {
        if matches!(entry.value, Value::Tombstone) || entry.is_expired(now) {
            return false;
        }
    }

    true
}
