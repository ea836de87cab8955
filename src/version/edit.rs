//! Version transition records
//!
//! A [`VersionEdit`] is the unit of change journaled to the manifest:
//! which tables joined which level, which tables left, and the durable
//! counters at that point. Replaying the manifest's edits in order
//! reconstructs the live Version after a crash.

use serde::{Deserialize, Serialize};

use crate::table::TableMeta;

/// A table added to a level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedTable {
    pub level: u32,
    pub meta: TableMeta,
}

/// A table removed from a level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedTable {
    pub level: u32,
    pub id: u64,
}

/// One journaled change to the table set and durable counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    pub added: Vec<AddedTable>,
    pub deleted: Vec<DeletedTable>,

    /// Highest sequence number durably reflected in a sorted table;
    /// recovery replays WAL records above this
    pub flushed_seq: Option<u64>,

    /// Next table id to allocate after recovery
    pub next_table_id: Option<u64>,

    /// Lowest WAL segment id still containing unflushed data; older
    /// segments are deletable
    pub wal_floor: Option<u64>,
}

impl VersionEdit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, level: u32, meta: TableMeta) -> &mut Self {
        self.added.push(AddedTable { level, meta });
        self
    }

    pub fn delete_table(&mut self, level: u32, id: u64) -> &mut Self {
        self.deleted.push(DeletedTable { level, id });
        self
    }

    pub fn set_flushed_seq(&mut self, seq: u64) -> &mut Self {
        self.flushed_seq = Some(seq);
        self
    }

    pub fn set_next_table_id(&mut self, id: u64) -> &mut Self {
        self.next_table_id = Some(id);
        self
    }

    pub fn set_wal_floor(&mut self, segment: u64) -> &mut Self {
        self.wal_floor = Some(segment);
        self
    }
}
