//! Sorted table builder
//!
//! Writes entries (already in internal order) into the block-structured
//! file format: data blocks cut at the configured size, a sparse index
//! with per-block checksums, a properties block, and a footer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::types::{Entry, Value};

use super::block::BlockBuilder;
use super::{
    IndexEntry, TableMeta, TableProperties, FOOTER_SIZE, FORMAT_VERSION, HEADER_SIZE, MAGIC,
};

/// Builder for creating new sorted tables from ordered entries
pub struct TableBuilder {
    /// Output file path
    path: PathBuf,

    id: u64,

    /// Buffered writer for performance
    writer: BufWriter<File>,

    /// Block being accumulated
    block: BlockBuilder,

    /// Cut threshold for data blocks
    block_size: usize,

    /// Sparse index built as blocks are flushed
    index: Vec<IndexEntry>,

    /// Current write position
    offset: u64,

    // Properties accumulated across all entries
    entry_count: u64,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    max_seq: u64,
    tombstone_count: u64,
}

impl TableBuilder {
    /// Create a new builder writing to `table_{id}.sst` under `dir`.
    ///
    /// Writes the header immediately; call `add()` in internal order, then
    /// `finish()` to write the index, properties, and footer.
    pub fn new(dir: &Path, id: u64, block_size: usize) -> Result<Self> {
        let path = super::table_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut writer = BufWriter::new(file);
        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;

        Ok(Self {
            path,
            id,
            writer,
            block: BlockBuilder::new(block_size),
            block_size,
            index: Vec::new(),
            offset: HEADER_SIZE,
            entry_count: 0,
            min_key: None,
            max_key: None,
            max_seq: 0,
            tombstone_count: 0,
        })
    }

    /// Append an entry (must be called in internal key order)
    pub fn add(&mut self, entry: &Entry) -> Result<()> {
        if self.min_key.is_none() {
            self.min_key = Some(entry.key.to_vec());
        }
        self.max_key = Some(entry.key.to_vec());
        self.max_seq = self.max_seq.max(entry.seq);
        self.entry_count += 1;
        if matches!(entry.value, Value::Tombstone) {
            self.tombstone_count += 1;
        }

        self.block.add(entry);
        if self.block.size() >= self.block_size {
            self.flush_block()?;
        }

        Ok(())
    }

    /// Number of entries added so far
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Bytes written to data blocks so far (compaction uses this to decide
    /// when to cut an output table)
    pub fn data_size(&self) -> u64 {
        self.offset - HEADER_SIZE
    }

    /// Finish building: write index, properties, and footer; fsync; return
    /// the table's metadata
    pub fn finish(mut self) -> Result<TableMeta> {
        if !self.block.is_empty() {
            self.flush_block()?;
        }

        // Index block: count, then (key_len, offset, len, crc, key) per block
        let index_offset = self.offset;
        let mut index_buf = Vec::new();
        index_buf.extend_from_slice(&(self.index.len() as u32).to_le_bytes());
        for ie in &self.index {
            index_buf.extend_from_slice(&(ie.first_key.len() as u32).to_le_bytes());
            index_buf.extend_from_slice(&ie.offset.to_le_bytes());
            index_buf.extend_from_slice(&ie.len.to_le_bytes());
            index_buf.extend_from_slice(&ie.crc.to_le_bytes());
            index_buf.extend_from_slice(&ie.first_key);
        }
        let index_crc = crc32fast::hash(&index_buf);
        self.writer.write_all(&index_buf)?;
        self.offset += index_buf.len() as u64;

        // Properties block: [crc][len][bincode payload]
        let properties = TableProperties {
            entry_count: self.entry_count,
            min_key: self.min_key.unwrap_or_default(),
            max_key: self.max_key.unwrap_or_default(),
            max_seq: self.max_seq,
            tombstone_count: self.tombstone_count,
        };
        let props_payload = bincode::serialize(&properties)?;
        let props_offset = self.offset;
        self.writer.write_all(&crc32fast::hash(&props_payload).to_le_bytes())?;
        self.writer.write_all(&(props_payload.len() as u32).to_le_bytes())?;
        self.writer.write_all(&props_payload)?;
        self.offset += 8 + props_payload.len() as u64;

        // Footer
        self.writer.write_all(&index_offset.to_le_bytes())?;
        self.writer.write_all(&(index_buf.len() as u64).to_le_bytes())?;
        self.writer.write_all(&index_crc.to_le_bytes())?;
        self.writer.write_all(&props_offset.to_le_bytes())?;
        self.writer.write_all(&((8 + props_payload.len()) as u64).to_le_bytes())?;
        self.writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        self.writer.write_all(MAGIC)?;
        self.offset += FOOTER_SIZE;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        let file_size = self.offset;
        debug_assert_eq!(file_size, std::fs::metadata(&self.path)?.len());

        Ok(TableMeta {
            id: self.id,
            file_size,
            properties,
        })
    }

    fn flush_block(&mut self) -> Result<()> {
        let block = std::mem::replace(&mut self.block, BlockBuilder::new(self.block_size));
        let (data, first_key) = block.finish();

        let crc = crc32fast::hash(&data);
        self.writer.write_all(&data)?;

        self.index.push(IndexEntry {
            first_key,
            offset: self.offset,
            len: data.len() as u32,
            crc,
        });
        self.offset += data.len() as u64;

        Ok(())
    }
}
