//! WAL Reader
//!
//! Reads records back out of one WAL segment, distinguishing a torn
//! trailing record (expected after a crash mid-append) from corruption in
//! the middle of the log.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::Result;

use super::record::{WalRecord, MAX_RECORD_SIZE, RECORD_HEADER_SIZE};

/// Outcome of reading the next record from a segment
#[derive(Debug)]
pub enum ReadOutcome {
    /// A valid record
    Record(WalRecord),

    /// Clean end of segment
    Eof,

    /// The record at `offset` is incomplete or fails its checksum and
    /// nothing valid can follow it: the expected crash boundary
    Torn { offset: u64 },

    /// The record at `offset` fails its checksum but the segment continues
    /// past it: genuine corruption, fatal for this segment
    Corrupt { offset: u64 },
}

/// Reads records from a single WAL segment
pub struct WalReader {
    file: BufReader<File>,
    position: u64,
    file_len: u64,
}

impl WalReader {
    /// Open a WAL segment for reading
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            file: BufReader::new(file),
            position: 0,
            file_len,
        })
    }

    /// Read the next record, classifying any damage
    pub fn read_next(&mut self) -> Result<ReadOutcome> {
        let record_start = self.position;

        if record_start == self.file_len {
            return Ok(ReadOutcome::Eof);
        }

        // Header must fit in the remaining bytes
        if self.file_len - record_start < RECORD_HEADER_SIZE as u64 {
            return Ok(ReadOutcome::Torn {
                offset: record_start,
            });
        }

        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        self.position += RECORD_HEADER_SIZE as u64;

        let seq = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let crc = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let len = u32::from_le_bytes(header[12..16].try_into().unwrap());

        // An absurd length means the header itself is garbage. If it is the
        // last thing in the file we call it a torn append; otherwise the
        // stream is unrecoverable either way.
        if len > MAX_RECORD_SIZE {
            return Ok(ReadOutcome::Corrupt {
                offset: record_start,
            });
        }

        // Payload running past EOF: interrupted append
        if self.position + len as u64 > self.file_len {
            return Ok(ReadOutcome::Torn {
                offset: record_start,
            });
        }

        let mut payload = vec![0u8; len as usize];
        self.file.read_exact(&mut payload)?;
        self.position += len as u64;

        if crc32fast::hash(&payload) != crc {
            // A bad checksum on the very last record is a torn append
            // (partial payload write); anywhere else it is corruption.
            return if self.position == self.file_len {
                Ok(ReadOutcome::Torn {
                    offset: record_start,
                })
            } else {
                Ok(ReadOutcome::Corrupt {
                    offset: record_start,
                })
            };
        }

        let record = WalRecord::decode_payload(seq, &payload)?;
        Ok(ReadOutcome::Record(record))
    }
}
