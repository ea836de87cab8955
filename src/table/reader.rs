//! Sorted table reader
//!
//! Opens a table file, validates its framing, and serves point lookups
//! through the block cache. The handle is immutable and safely shared;
//! the underlying file is deleted on drop once the table is superseded
//! and marked obsolete.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache::BlockCache;
use crate::error::{KvError, Result};
use crate::types::Entry;

use super::block::Block;
use super::{IndexEntry, TableMeta, FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC};

/// An open, immutable sorted table
pub struct SortedTable {
    meta: TableMeta,
    path: PathBuf,

    /// Sparse index: first key of each data block, loaded eagerly
    index: Vec<IndexEntry>,

    /// File handle; the mutex serializes seek+read pairs
    file: Mutex<File>,

    /// Set when a newer Version supersedes this table; the file is
    /// removed when the last reference drops
    obsolete: AtomicBool,
}

impl SortedTable {
    /// Open the table file described by `meta` under `dir`.
    ///
    /// Validates header and footer framing and the index checksum, and
    /// loads the sparse index into memory.
    pub fn open(dir: &Path, meta: TableMeta) -> Result<Self> {
        let path = super::table_path(dir, meta.id);
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size < HEADER_SIZE + FOOTER_SIZE {
            return Err(KvError::Corruption(format!(
                "table {} too small: {} bytes",
                meta.id, file_size
            )));
        }

        // Header
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(KvError::Corruption(format!(
                "table {} has invalid magic",
                meta.id
            )));
        }
        let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(KvError::Corruption(format!(
                "table {} has unsupported format version {}",
                meta.id, version
            )));
        }

        // Footer
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact(&mut footer)?;
        if &footer[38..42] != MAGIC {
            return Err(KvError::Corruption(format!(
                "table {} has invalid footer magic",
                meta.id
            )));
        }
        let index_offset = u64::from_le_bytes(footer[0..8].try_into().unwrap());
        let index_len = u64::from_le_bytes(footer[8..16].try_into().unwrap());
        let index_crc = u32::from_le_bytes(footer[16..20].try_into().unwrap());

        // Index block
        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact(&mut index_buf)?;
        if crc32fast::hash(&index_buf) != index_crc {
            return Err(KvError::Corruption(format!(
                "table {} index checksum mismatch",
                meta.id
            )));
        }
        let index = Self::parse_index(meta.id, &index_buf)?;

        debug!(table = meta.id, blocks = index.len(), "opened sorted table");

        Ok(Self {
            meta,
            path,
            index,
            file: Mutex::new(file),
            obsolete: AtomicBool::new(false),
        })
    }

    /// Latest version of `key` with `seq <= seq_bound`.
    ///
    /// Returns `Ok(None)` when the table cannot hold the key; tombstones
    /// and expired entries are returned as-is for the caller to interpret.
    pub fn get(&self, key: &[u8], seq_bound: u64, cache: &BlockCache) -> Result<Option<Entry>> {
        if !self.meta.might_contain(key) {
            return Ok(None);
        }

        // Versions of one key can straddle block boundaries, newest first.
        // Start at the block preceding the first whose first key reaches
        // `key`; that is where the newest version can hide.
        let mut idx = self
            .index
            .partition_point(|ie| ie.first_key.as_slice() < key)
            .saturating_sub(1);

        loop {
            let block = self.block(idx, cache)?;
            if let Some(entry) = block.get(key, seq_bound) {
                return Ok(Some(entry.clone()));
            }

            // Continue while later blocks still start at this key; they
            // hold its older versions
            idx += 1;
            match self.index.get(idx) {
                Some(next) if next.first_key.as_slice() == key => continue,
                _ => return Ok(None),
            }
        }
    }

    /// Load (or fetch from cache) the data block at index position `idx`
    pub(super) fn block(&self, idx: usize, cache: &BlockCache) -> Result<Arc<Block>> {
        let ie = &self.index[idx];
        cache.get_or_load((self.meta.id, ie.offset), || self.read_block(ie))
    }

    /// Read and verify one data block from disk
    fn read_block(&self, ie: &IndexEntry) -> Result<Block> {
        let mut buf = vec![0u8; ie.len as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(ie.offset))?;
            file.read_exact(&mut buf)?;
        }

        if crc32fast::hash(&buf) != ie.crc {
            return Err(KvError::Corruption(format!(
                "table {} block at offset {} checksum mismatch",
                self.meta.id, ie.offset
            )));
        }

        Block::decode(&buf)
    }

    /// Mark the file for deletion once the last reference drops
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn min_key(&self) -> &[u8] {
        &self.meta.properties.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.meta.properties.max_key
    }

    pub(super) fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    fn parse_index(table_id: u64, buf: &[u8]) -> Result<Vec<IndexEntry>> {
        let corrupt =
            || KvError::Corruption(format!("table {} index block malformed", table_id));

        if buf.len() < 4 {
            return Err(corrupt());
        }
        let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let mut index = Vec::with_capacity(count);
        let mut pos = 4usize;

        for _ in 0..count {
            if pos + 20 > buf.len() {
                return Err(corrupt());
            }
            let key_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            let offset = u64::from_le_bytes(buf[pos + 4..pos + 12].try_into().unwrap());
            let len = u32::from_le_bytes(buf[pos + 12..pos + 16].try_into().unwrap());
            let crc = u32::from_le_bytes(buf[pos + 16..pos + 20].try_into().unwrap());
            pos += 20;

            if pos + key_len > buf.len() {
                return Err(corrupt());
            }
            let first_key = buf[pos..pos + key_len].to_vec();
            pos += key_len;

            index.push(IndexEntry {
                first_key,
                offset,
                len,
                crc,
            });
        }

        Ok(index)
    }
}

impl Drop for SortedTable {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => debug!(table = self.meta.id, "deleted obsolete table file"),
                Err(e) => warn!(table = self.meta.id, error = %e, "failed to delete obsolete table file"),
            }
        }
    }
}

impl std::fmt::Debug for SortedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedTable")
            .field("id", &self.meta.id)
            .field("entries", &self.meta.properties.entry_count)
            .field("blocks", &self.index.len())
            .finish()
    }
}
