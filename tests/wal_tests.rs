//! Tests for the Write-Ahead Log
//!
//! These tests verify:
//! - Append and replay of well-formed segments
//! - Segment rotation and discovery
//! - Recovery with a torn tail (truncated, not fatal)
//! - Recovery with mid-log corruption (fatal)
//! - Replay skipping records already flushed
//! - Verify mode (stats only, no mutation)

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use kvstorage::config::SyncPolicy;
use kvstorage::error::KvError;
use kvstorage::wal::{self, Operation, WalRecovery, WalWriter};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn put_op(i: usize) -> Operation {
    Operation::Put {
        key: format!("key{:03}", i).into_bytes(),
        value: format!("value{:03}", i).into_bytes(),
        expire_at: 0,
    }
}

/// Append `count` records (seq 1..=count) through the writer
fn write_records(dir: &Path, count: usize) {
    let mut writer =
        WalWriter::create(dir, 1, 64 * 1024 * 1024, SyncPolicy::EveryWrite).unwrap();
    for i in 1..=count {
        writer.append(i as u64, put_op(i)).unwrap();
    }
}

/// Shave `bytes` off the end of the newest segment to fake a torn write
fn truncate_tail(dir: &Path, bytes: u64) {
    let (_, path) = wal::list_segments(dir).unwrap().pop().unwrap();
    let len = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - bytes).unwrap();
}

// =============================================================================
// Clean Replay
// =============================================================================

#[test]
fn test_replay_empty_directory() {
    let temp = TempDir::new().unwrap();
    let (records, report) = WalRecovery::replay(temp.path(), 0).unwrap();
    assert!(records.is_empty());
    assert_eq!(report.segments_replayed, 0);
    assert_eq!(report.last_seq, 0);
}

#[test]
fn test_replay_returns_records_in_order() {
    let temp = TempDir::new().unwrap();
    write_records(temp.path(), 5);

    let (records, report) = WalRecovery::replay(temp.path(), 0).unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(report.records_recovered, 5);
    assert_eq!(report.last_seq, 5);
    assert_eq!(report.truncated_bytes, 0);

    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_replay_skips_already_flushed_records() {
    let temp = TempDir::new().unwrap();
    write_records(temp.path(), 10);

    let (records, report) = WalRecovery::replay(temp.path(), 7).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].seq, 8);
    // last_seq still reflects everything seen
    assert_eq!(report.last_seq, 10);
}

// =============================================================================
// Rotation
// =============================================================================

#[test]
fn test_rotation_creates_new_segments() {
    let temp = TempDir::new().unwrap();
    // Tiny threshold: every append lands past it and rotates the next one
    let mut writer = WalWriter::create(temp.path(), 1, 1, SyncPolicy::EveryWrite).unwrap();
    for i in 1..=3u64 {
        writer.append(i, put_op(i as usize)).unwrap();
    }
    assert_eq!(writer.segment_id(), 3);

    let segments = wal::list_segments(temp.path()).unwrap();
    let ids: Vec<u64> = segments.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    // Replay stitches all segments back together in order
    let (records, _) = WalRecovery::replay(temp.path(), 0).unwrap();
    let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[test]
fn test_explicit_rotate_returns_next_id() {
    let temp = TempDir::new().unwrap();
    let mut writer =
        WalWriter::create(temp.path(), 7, 64 * 1024 * 1024, SyncPolicy::EveryWrite).unwrap();
    assert_eq!(writer.rotate().unwrap(), 8);
    assert_eq!(writer.segment_id(), 8);
}

// =============================================================================
// Torn Tail
// =============================================================================

#[test]
fn test_torn_tail_is_truncated_and_earlier_records_survive() {
    let temp = TempDir::new().unwrap();
    write_records(temp.path(), 3);
    truncate_tail(temp.path(), 2);

    let (records, report) = WalRecovery::replay(temp.path(), 0).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(report.last_seq, 2);
    assert!(report.truncated_bytes > 0);

    // The damaged tail is gone for good; a second replay is clean
    let (records, report) = WalRecovery::replay(temp.path(), 0).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(report.truncated_bytes, 0);
}

#[test]
fn test_torn_header_at_tail_is_truncated() {
    let temp = TempDir::new().unwrap();
    write_records(temp.path(), 2);
    // Leave fewer bytes than a record header
    let (_, path) = wal::list_segments(temp.path()).unwrap().pop().unwrap();
    let len = std::fs::metadata(&path).unwrap().len();
    let record_len = len / 2;
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(record_len + 5).unwrap();

    let (records, _) = WalRecovery::replay(temp.path(), 0).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].seq, 1);
}

// =============================================================================
// Corruption
// =============================================================================

#[test]
fn test_corruption_with_records_following_is_fatal() {
    let temp = TempDir::new().unwrap();
    write_records(temp.path(), 3);

    // Flip a payload byte of the first record; two intact records follow,
    // so this cannot be a torn tail
    let (_, path) = wal::list_segments(temp.path()).unwrap().remove(0);
    let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.seek(SeekFrom::Start(16)).unwrap();
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).unwrap();
    file.seek(SeekFrom::Start(16)).unwrap();
    file.write_all(&[byte[0] ^ 0xFF]).unwrap();
    file.sync_all().unwrap();

    let err = WalRecovery::replay(temp.path(), 0).unwrap_err();
    assert!(matches!(err, KvError::WalCorruption(_)));
}

#[test]
fn test_damage_in_older_segment_is_fatal() {
    let temp = TempDir::new().unwrap();
    let mut writer = WalWriter::create(temp.path(), 1, 1, SyncPolicy::EveryWrite).unwrap();
    writer.append(1, put_op(1)).unwrap();
    writer.append(2, put_op(2)).unwrap();

    // Truncating an older (non-newest) segment must not be forgiven
    let (_, path) = wal::list_segments(temp.path()).unwrap().remove(0);
    let len = std::fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 1).unwrap();

    let err = WalRecovery::replay(temp.path(), 0).unwrap_err();
    assert!(matches!(err, KvError::WalCorruption(_)));
}

// =============================================================================
// Verify Mode
// =============================================================================

#[test]
fn test_verify_reports_without_mutating() {
    let temp = TempDir::new().unwrap();
    write_records(temp.path(), 4);
    truncate_tail(temp.path(), 3);

    let len_before = std::fs::metadata(&wal::list_segments(temp.path()).unwrap()[0].1)
        .unwrap()
        .len();

    let report = WalRecovery::verify(temp.path()).unwrap();
    assert_eq!(report.records_recovered, 3);
    assert!(report.truncated_bytes > 0);

    // verify must leave the torn bytes in place
    let len_after = std::fs::metadata(&wal::list_segments(temp.path()).unwrap()[0].1)
        .unwrap()
        .len();
    assert_eq!(len_before, len_after);
}
