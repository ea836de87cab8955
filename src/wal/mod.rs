//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging. Every
//! mutation is appended here before it touches the memtable; replay at
//! startup reconstructs acknowledged writes that never reached a sorted
//! table.
//!
//! ## Record Format
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Record 1                                │
//! │ ┌─────────┬─────────┬────────┬────────┐ │
//! │ │ Seq (8) │ CRC (4) │Len (4) │ Data   │ │
//! │ └─────────┴─────────┴────────┴────────┘ │
//! ├─────────────────────────────────────────┤
//! │ Record 2                                │
//! │ ...                                     │
//! └─────────────────────────────────────────┘
//! ```
//! CRC covers the data payload. Data is the bincode-encoded [`Operation`].
//!
//! ## Segments
//! The log is split into numbered segment files (`wal_000001.log`, ...).
//! The writer rotates to a fresh segment once the active one exceeds the
//! configured size; segments whose contents are durably flushed to sorted
//! tables are deleted by the engine.

mod record;
mod reader;
mod recovery;
mod writer;

use std::path::{Path, PathBuf};

pub use reader::WalReader;
pub use record::{Operation, WalRecord, RECORD_HEADER_SIZE};
pub use recovery::{RecoveryReport, WalRecovery};
pub use writer::WalWriter;

use crate::error::Result;

/// File path of a WAL segment with the given id
pub fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal_{:06}.log", id))
}

/// Parse a segment id from a WAL file path
/// "wal_000042.log" → Some(42)
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    let name = path.file_stem()?.to_string_lossy();
    let id_str = name.strip_prefix("wal_")?;
    id_str.parse().ok()
}

/// Discover WAL segments in a directory, sorted oldest first
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.is_file() {
            if let Some(id) = parse_segment_id(&path) {
                segments.push((id, path));
            }
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}
