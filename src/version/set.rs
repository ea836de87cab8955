//! VersionSet: the single synchronized hand-off point
//!
//! Owns the current Version pointer, the manifest log, and the durable
//! counters (next table id, flushed sequence number, WAL floor). Reads of
//! the current Version are a brief lock around one reference clone;
//! installs journal the edit first, then swap the pointer.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::table::{self, SortedTable, TableMeta};

use super::edit::VersionEdit;
use super::manifest::{self, ManifestLog};
use super::{Version, NUM_LEVELS};

/// Tracks the live Version and journals its transitions
pub struct VersionSet {
    /// Current Version; replaced wholesale on install, never mutated
    current: RwLock<Arc<Version>>,

    /// Live manifest; the mutex serializes installs
    manifest: Mutex<ManifestLog>,

    /// Next sorted table id (atomic, lock-free, never reused)
    next_table_id: AtomicU64,

    /// Highest sequence number durably flushed to a sorted table
    flushed_seq: AtomicU64,

    /// Lowest WAL segment still holding unflushed data
    wal_floor: AtomicU64,
}

impl VersionSet {
    /// Open or create the version set in `dir`.
    ///
    /// Replays CURRENT + manifest when present, opens every live table,
    /// then starts a fresh manifest seeded with one snapshot edit so the
    /// log never grows across restarts.
    pub fn open(dir: &Path) -> Result<Self> {
        let recovered = manifest::replay(dir)?;

        let mut levels: Vec<Vec<TableMeta>> = vec![Vec::new(); NUM_LEVELS];
        let mut flushed_seq = 0u64;
        let mut next_table_id = 1u64;
        let mut wal_floor = 1u64;
        let old_manifest_id = recovered.as_ref().map(|(id, _)| *id).unwrap_or(0);

        if let Some((_, edits)) = recovered {
            for edit in &edits {
                for deleted in &edit.deleted {
                    levels[deleted.level as usize].retain(|m| m.id != deleted.id);
                }
                // An edit's level-0 tables are listed newest-first and the
                // whole block goes in front, keeping its internal order
                let mut l0_pos = 0;
                for added in &edit.added {
                    let level = added.level as usize;
                    if level == 0 {
                        levels[0].insert(l0_pos, added.meta.clone());
                        l0_pos += 1;
                    } else {
                        let idx = levels[level].partition_point(|m| {
                            m.properties.min_key < added.meta.properties.min_key
                        });
                        levels[level].insert(idx, added.meta.clone());
                    }
                }
                if let Some(seq) = edit.flushed_seq {
                    flushed_seq = flushed_seq.max(seq);
                }
                if let Some(id) = edit.next_table_id {
                    next_table_id = next_table_id.max(id);
                }
                if let Some(floor) = edit.wal_floor {
                    wal_floor = wal_floor.max(floor);
                }
            }
        }

        // Open every live table
        let mut opened: Vec<Vec<Arc<SortedTable>>> = vec![Vec::new(); NUM_LEVELS];
        for (level, metas) in levels.iter().enumerate() {
            for meta in metas {
                opened[level].push(Arc::new(SortedTable::open(dir, meta.clone())?));
            }
        }
        let version = Arc::new(Version { levels: opened });

        // Start a fresh manifest seeded with the recovered state
        let manifest_id = old_manifest_id + 1;
        let mut log = ManifestLog::create(dir, manifest_id)?;
        let mut snapshot = VersionEdit::new();
        for (level, metas) in levels.iter().enumerate() {
            for meta in metas {
                snapshot.add_table(level as u32, meta.clone());
            }
        }
        snapshot
            .set_flushed_seq(flushed_seq)
            .set_next_table_id(next_table_id)
            .set_wal_floor(wal_floor);
        log.append(&snapshot)?;
        manifest::set_current(dir, manifest_id)?;
        manifest::remove_stale_manifests(dir, manifest_id)?;

        // A crash between writing a table file and journaling its install
        // leaves an orphan .sst; reclaim it now that the live set is known
        let live: HashSet<u64> = levels.iter().flatten().map(|m| m.id).collect();
        remove_orphan_tables(dir, &live)?;

        info!(
            manifest = manifest_id,
            tables = version.table_count(),
            flushed_seq,
            "version set opened"
        );

        Ok(Self {
            current: RwLock::new(version),
            manifest: Mutex::new(log),
            next_table_id: AtomicU64::new(next_table_id),
            flushed_seq: AtomicU64::new(flushed_seq),
            wal_floor: AtomicU64::new(wal_floor),
        })
    }

    /// Reference to the current Version; never observes a partial install
    pub fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current.read())
    }

    /// Journal `edit`, build the successor Version, and publish it.
    ///
    /// `new_tables` are the already-open handles for `edit.added`.
    /// Deleted tables are marked obsolete so their files disappear once
    /// the last snapshot or in-flight read drops them. Returns the new
    /// Version and the deleted table ids (for cache invalidation).
    pub fn log_and_apply(
        &self,
        edit: VersionEdit,
        new_tables: &[(u32, Arc<SortedTable>)],
    ) -> Result<(Arc<Version>, Vec<u64>)> {
        let mut manifest = self.manifest.lock();

        manifest.append(&edit)?;

        if let Some(seq) = edit.flushed_seq {
            self.flushed_seq.fetch_max(seq, Ordering::SeqCst);
        }
        if let Some(floor) = edit.wal_floor {
            self.wal_floor.fetch_max(floor, Ordering::SeqCst);
        }

        let base = self.current();
        let next = Arc::new(base.apply(&edit, new_tables));

        // Mark superseded tables; deletion happens when the last
        // Version/snapshot reference drops
        let mut deleted_ids = Vec::with_capacity(edit.deleted.len());
        for deleted in &edit.deleted {
            deleted_ids.push(deleted.id);
            for table in &base.levels()[deleted.level as usize] {
                if table.id() == deleted.id {
                    table.mark_obsolete();
                }
            }
        }

        *self.current.write() = Arc::clone(&next);

        Ok((next, deleted_ids))
    }

    /// Allocate a fresh, never-reused table id
    pub fn allocate_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest sequence number durably flushed to a sorted table
    pub fn flushed_seq(&self) -> u64 {
        self.flushed_seq.load(Ordering::SeqCst)
    }

    /// Lowest WAL segment id still holding unflushed data
    pub fn wal_floor(&self) -> u64 {
        self.wal_floor.load(Ordering::SeqCst)
    }
}

/// Delete table files the manifest does not account for
fn remove_orphan_tables(dir: &Path, live: &HashSet<u64>) -> Result<()> {
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        let Some(id) = table::parse_table_id(&path) else {
            continue;
        };
        if live.contains(&id) {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(table = id, "removed orphan table file"),
            Err(e) => warn!(table = id, error = %e, "failed to remove orphan table file"),
        }
    }
    Ok(())
}
