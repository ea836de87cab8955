//! WAL Writer
//!
//! Appends records to the active WAL segment, rotating to a fresh segment
//! when the active one exceeds the configured size.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::SyncPolicy;
use crate::error::Result;

use super::record::{Operation, WalRecord};
use super::segment_path;

/// Writes records to the WAL
pub struct WalWriter {
    /// Directory holding the segment files
    dir: PathBuf,

    /// Buffered writer over the active segment
    writer: BufWriter<File>,

    /// Id of the active segment
    segment_id: u64,

    /// Bytes written to the active segment
    segment_bytes: u64,

    /// Appends since the last fsync
    unsynced: usize,

    /// Rotation threshold
    segment_size: u64,

    sync_policy: SyncPolicy,
}

impl WalWriter {
    /// Open a writer on a fresh segment with the given id
    pub fn create(
        dir: &Path,
        first_segment: u64,
        segment_size: u64,
        sync_policy: SyncPolicy,
    ) -> Result<Self> {
        let writer = Self::open_segment(dir, first_segment)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writer,
            segment_id: first_segment,
            segment_bytes: 0,
            unsynced: 0,
            segment_size,
            sync_policy,
        })
    }

    /// Append an operation with the given sequence number.
    ///
    /// Durability on return follows the configured sync policy. Rotation
    /// happens before the append so one record never spans two segments.
    pub fn append(&mut self, seq: u64, op: Operation) -> Result<()> {
        if self.segment_bytes >= self.segment_size {
            self.rotate()?;
        }

        let buf = WalRecord::new(seq, op).encode()?;
        self.writer.write_all(&buf)?;
        self.segment_bytes += buf.len() as u64;
        self.unsynced += 1;

        match self.sync_policy {
            SyncPolicy::EveryWrite => self.sync()?,
            SyncPolicy::EveryNWrites { count } => {
                if self.unsynced >= count {
                    self.sync()?;
                }
            }
        }

        Ok(())
    }

    /// Force buffered records to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Close the active segment and start a new one.
    ///
    /// The old segment stays on disk until the engine confirms its contents
    /// are durable in a sorted table. Returns the new segment id.
    pub fn rotate(&mut self) -> Result<u64> {
        self.sync()?;

        self.segment_id += 1;
        self.writer = Self::open_segment(&self.dir, self.segment_id)?;
        self.segment_bytes = 0;

        debug!(segment = self.segment_id, "rotated WAL segment");
        Ok(self.segment_id)
    }

    /// Id of the active segment
    pub fn segment_id(&self) -> u64 {
        self.segment_id
    }

    fn open_segment(dir: &Path, id: u64) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(dir, id))?;
        Ok(BufWriter::new(file))
    }
}
