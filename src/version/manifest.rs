//! Manifest log
//!
//! Append-only journal of [`VersionEdit`] records plus a small CURRENT
//! pointer file naming the live manifest. Each record uses the same
//! crc/len framing as the WAL; a torn record at the tail is tolerated
//! (crash during an install), damage earlier in the log is corruption.
//!
//! On every engine open a fresh manifest is started with one snapshot
//! edit describing the recovered state, then CURRENT is swapped to it
//! via a temp-file rename, so the log does not grow across restarts.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{KvError, Result};

use super::edit::VersionEdit;

/// CURRENT pointer file name
const CURRENT_FILE: &str = "CURRENT";

/// Record header: crc (4) + len (4)
const FRAME_HEADER_SIZE: usize = 8;

/// Sanity bound on one edit record
const MAX_EDIT_SIZE: u32 = 16 * 1024 * 1024;

/// File path of a manifest with the given id
pub fn manifest_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("MANIFEST-{:06}", id))
}

/// Parse a manifest id from a file name
fn parse_manifest_id(name: &str) -> Option<u64> {
    name.strip_prefix("MANIFEST-")?.parse().ok()
}

/// Append-only writer over the live manifest
pub struct ManifestLog {
    writer: BufWriter<File>,
    id: u64,
}

impl ManifestLog {
    /// Create a new manifest file with the given id (does not update
    /// CURRENT; callers point CURRENT at it after writing the initial
    /// snapshot edit)
    pub fn create(dir: &Path, id: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(manifest_path(dir, id))?;
        Ok(Self {
            writer: BufWriter::new(file),
            id,
        })
    }

    /// Append an edit and fsync before returning.
    ///
    /// The edit is durable once this returns; the in-memory Version swap
    /// happens after, so a crash in between is resolved by replay.
    pub fn append(&mut self, edit: &VersionEdit) -> Result<()> {
        let payload = bincode::serialize(edit)?;
        self.writer
            .write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        self.writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Point CURRENT at the given manifest via temp-file rename, so the
/// switch is atomic on the filesystem
pub fn set_current(dir: &Path, manifest_id: u64) -> Result<()> {
    let tmp = dir.join("CURRENT.tmp");
    {
        let mut file = File::create(&tmp)?;
        writeln!(file, "MANIFEST-{:06}", manifest_id)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, dir.join(CURRENT_FILE))?;
    Ok(())
}

/// Read CURRENT and replay the manifest it names.
///
/// Returns `None` when no CURRENT exists (fresh directory). The returned
/// id is the live manifest's id.
pub fn replay(dir: &Path) -> Result<Option<(u64, Vec<VersionEdit>)>> {
    let current_path = dir.join(CURRENT_FILE);
    if !current_path.exists() {
        return Ok(None);
    }

    let name = std::fs::read_to_string(&current_path)?;
    let name = name.trim();
    let id = parse_manifest_id(name).ok_or_else(|| {
        KvError::Corruption(format!("CURRENT names an invalid manifest: {:?}", name))
    })?;

    let path = dir.join(name);
    let mut buf = Vec::new();
    File::open(&path)?.read_to_end(&mut buf)?;

    let mut edits = Vec::new();
    let mut pos = 0usize;

    while pos < buf.len() {
        if pos + FRAME_HEADER_SIZE > buf.len() {
            // Torn frame header at the tail: crash during an install
            warn!(manifest = id, offset = pos, "dropping torn manifest tail");
            break;
        }
        let crc = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
        let len = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());

        if len > MAX_EDIT_SIZE {
            return Err(KvError::Corruption(format!(
                "manifest {} record at offset {} has absurd length {}",
                id, pos, len
            )));
        }

        let payload_start = pos + FRAME_HEADER_SIZE;
        let payload_end = payload_start + len as usize;
        if payload_end > buf.len() {
            warn!(manifest = id, offset = pos, "dropping torn manifest tail");
            break;
        }

        let payload = &buf[payload_start..payload_end];
        if crc32fast::hash(payload) != crc {
            if payload_end == buf.len() {
                warn!(manifest = id, offset = pos, "dropping torn manifest tail");
                break;
            }
            return Err(KvError::Corruption(format!(
                "manifest {} record at offset {} checksum mismatch",
                id, pos
            )));
        }

        edits.push(bincode::deserialize(payload)?);
        pos = payload_end;
    }

    Ok(Some((id, edits)))
}

/// Delete manifests other than the live one (run after CURRENT moves)
pub fn remove_stale_manifests(dir: &Path, live_id: u64) -> Result<()> {
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if let Some(id) = parse_manifest_id(name) {
                if id != live_id {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!(manifest = id, error = %e, "failed to remove stale manifest");
                    }
                }
            }
        }
    }
    Ok(())
}
