//! Sorted Table Module
//!
//! Immutable, block-structured, indexed on-disk representation of a sorted
//! run of entries. Produced by memtable flushes and by compaction; never
//! mutated after creation, only superseded.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (6 bytes)                                         │
//! │   Magic: "KVST" (4) | Version: u16 (2)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data Block 0 (≈ block_size bytes)                        │
//! │   [KeyLen: u32][ValLen: u32][Seq: u64][ExpireAt: u64]    │
//! │   [Key][Value]                                           │
//! │   ... entries in (key asc, seq desc) order ...           │
//! │   (ValLen = u32::MAX means tombstone, no value bytes)    │
//! ├──────────────────────────────────────────────────────────┤
//! │ Data Block 1 ...                                         │
//! ├──────────────────────────────────────────────────────────┤
//! │ Index Block                                              │
//! │   Count: u32, then per data block:                       │
//! │   [KeyLen: u32][Offset: u64][Len: u32][CRC: u32][Key]    │
//! │   (Key = first key of the block; CRC covers the block)   │
//! ├──────────────────────────────────────────────────────────┤
//! │ Properties Block                                         │
//! │   [CRC: u32][Len: u32][bincode TableProperties]          │
//! ├──────────────────────────────────────────────────────────┤
//! │ Footer (42 bytes)                                        │
//! │   IndexOffset: u64 | IndexLen: u64 | IndexCRC: u32 |     │
//! │   PropsOffset: u64 | PropsLen: u64 | Version: u16 |      │
//! │   Magic: "KVST" (4)                                      │
//! └──────────────────────────────────────────────────────────┘
//! ```
//! Every data block carries its own checksum in the index, so corruption
//! is detected and isolated per block rather than failing the whole table.

pub mod block;
mod builder;
mod iterator;
mod reader;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use builder::TableBuilder;
pub use iterator::TableIterator;
pub use reader::SortedTable;

// =============================================================================
// Shared Constants (used by builder, reader, iterator)
// =============================================================================

/// Magic bytes identifying a KVStorage sorted table file
pub(crate) const MAGIC: &[u8; 4] = b"KVST";

/// Current sorted table format version
pub(crate) const FORMAT_VERSION: u16 = 1;

/// Header size: Magic (4) + Version (2) = 6 bytes
pub(crate) const HEADER_SIZE: u64 = 6;

/// Footer size: IndexOffset (8) + IndexLen (8) + IndexCRC (4) +
/// PropsOffset (8) + PropsLen (8) + Version (2) + Magic (4) = 42 bytes
pub(crate) const FOOTER_SIZE: u64 = 42;

/// Sentinel value-length indicating a tombstone (deleted key)
pub(crate) const TOMBSTONE_MARKER: u32 = u32::MAX;

/// Per-entry fixed header: key_len (4) + val_len (4) + seq (8) + expire_at (8)
pub(crate) const ENTRY_HEADER_SIZE: usize = 24;

// =============================================================================
// Table Metadata
// =============================================================================

/// Summary statistics written into the properties block and carried in
/// manifest records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    /// Number of entries (versions, not distinct keys)
    pub entry_count: u64,
    /// Smallest user key
    pub min_key: Vec<u8>,
    /// Largest user key
    pub max_key: Vec<u8>,
    /// Highest sequence number stored
    pub max_seq: u64,
    /// Number of tombstone entries
    pub tombstone_count: u64,
}

/// Identity and stats of one sorted table, as tracked by the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Engine-wide table id (also the file name)
    pub id: u64,
    /// File size in bytes
    pub file_size: u64,
    pub properties: TableProperties,
}

impl TableMeta {
    /// Quick check if a key might be in this table (range check).
    /// Returns false if key is definitely outside [min_key, max_key].
    pub fn might_contain(&self, key: &[u8]) -> bool {
        key >= self.properties.min_key.as_slice() && key <= self.properties.max_key.as_slice()
    }

    /// Whether this table's key range intersects [start, end]
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.properties.min_key.as_slice() <= end && self.properties.max_key.as_slice() >= start
    }
}

/// One sparse index entry: the first key of a data block and where to
/// find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub first_key: Vec<u8>,
    pub offset: u64,
    pub len: u32,
    pub crc: u32,
}

// =============================================================================
// File Naming
// =============================================================================

/// File path of a sorted table with the given id
pub fn table_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("table_{:06}.sst", id))
}

/// Parse a table id from a file path
/// "table_000042.sst" → Some(42)
pub fn parse_table_id(path: &Path) -> Option<u64> {
    let name = path.file_stem()?.to_string_lossy();
    let id_str = name.strip_prefix("table_")?;
    id_str.parse().ok()
}
