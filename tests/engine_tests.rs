//! End-to-end tests for the storage engine
//!
//! These tests verify:
//! - Basic put/get/delete visibility
//! - Snapshot isolation across later writes, deletes, and flushes
//! - Flush to sorted tables and reads spanning memtable + tables
//! - Reopen recovery (manifest + WAL replay)
//! - TTL expiration driven by an injected clock
//! - Ordered scans and get_many_sorted
//! - Compaction keeping reads correct under many flushes

use std::ops::Bound;
use std::sync::Arc;

use kvstorage::{Config, Engine, KvError, ManualClock, SyncPolicy};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Route engine logs through the test harness; `RUST_LOG` controls verbosity
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_config(dir: &std::path::Path) -> Config {
    Config::builder()
        .dir(dir)
        .sync_policy(SyncPolicy::EveryWrite)
        .memtable_size_limit(4 * 1024)
        .block_size(256)
        .target_table_size(16 * 1024)
        .l0_compaction_trigger(2)
        .level_base_size(32 * 1024)
        .build()
}

fn open_small(dir: &std::path::Path) -> Engine {
    init_tracing();
    Engine::open(small_config(dir)).unwrap()
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_put_get_delete() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    engine.put(b"k", b"v1").unwrap();
    assert_eq!(engine.get(b"k").unwrap().unwrap().as_ref(), b"v1");

    engine.put(b"k", b"v2").unwrap();
    assert_eq!(engine.get(b"k").unwrap().unwrap().as_ref(), b"v2");

    engine.delete(b"k").unwrap();
    assert!(engine.get(b"k").unwrap().is_none());

    // Deleting an absent key is fine
    engine.delete(b"never-existed").unwrap();
    assert!(engine.get(b"missing").unwrap().is_none());
}

#[test]
fn test_sequence_numbers_increase() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    let a = engine.put(b"a", b"1").unwrap();
    let b = engine.put(b"b", b"2").unwrap();
    let c = engine.delete(b"a").unwrap();
    assert!(a < b && b < c);
}

#[test]
fn test_closed_engine_rejects_operations() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());
    engine.put(b"k", b"v").unwrap();
    engine.close().unwrap();

    assert!(matches!(engine.put(b"k", b"v2"), Err(KvError::Closed)));
    assert!(matches!(engine.get(b"k"), Err(KvError::Closed)));
    // close is idempotent
    engine.close().unwrap();
}

// =============================================================================
// Snapshots
// =============================================================================

#[test]
fn test_snapshot_pins_point_in_time() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    engine.put(b"a", b"1").unwrap();
    engine.put(b"a", b"2").unwrap();
    let snap = engine.snapshot().unwrap();
    engine.put(b"a", b"3").unwrap();

    assert_eq!(engine.get(b"a").unwrap().unwrap().as_ref(), b"3");
    assert_eq!(engine.get_at(&snap, b"a").unwrap().unwrap().as_ref(), b"2");
}

#[test]
fn test_snapshot_survives_delete_and_flush() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    engine.put(b"a", b"old").unwrap();
    let snap = engine.snapshot().unwrap();

    engine.delete(b"a").unwrap();
    engine.flush().unwrap();

    assert!(engine.get(b"a").unwrap().is_none());
    assert_eq!(engine.get_at(&snap, b"a").unwrap().unwrap().as_ref(), b"old");
}

#[test]
fn test_snapshot_does_not_see_later_keys() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    engine.put(b"early", b"1").unwrap();
    let snap = engine.snapshot().unwrap();
    engine.put(b"late", b"2").unwrap();

    assert!(engine.get_at(&snap, b"late").unwrap().is_none());
    assert!(engine.get(b"late").unwrap().is_some());

    let snapped: Vec<_> = engine
        .scan_at(&snap, Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(snapped.len(), 1);
    assert_eq!(snapped[0].0.as_ref(), b"early");
}

// =============================================================================
// Flush and Reopen
// =============================================================================

#[test]
fn test_flush_then_read_from_table() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    for i in 0..100 {
        engine
            .put(format!("key{:03}", i).as_bytes(), format!("value{:03}", i).as_bytes())
            .unwrap();
    }
    engine.flush().unwrap();

    // Everything now lives in level 0, not the memtable
    for i in (0..100).step_by(7) {
        let got = engine.get(format!("key{:03}", i).as_bytes()).unwrap().unwrap();
        assert_eq!(got.as_ref(), format!("value{:03}", i).as_bytes());
    }

    // Newer memtable data shadows the flushed version
    engine.put(b"key050", b"updated").unwrap();
    assert_eq!(engine.get(b"key050").unwrap().unwrap().as_ref(), b"updated");
}

#[test]
fn test_reopen_recovers_flushed_and_unflushed_data() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open_small(temp.path());
        for i in 0..50 {
            engine
                .put(format!("key{:03}", i).as_bytes(), b"flushed")
                .unwrap();
        }
        engine.flush().unwrap();
        // These stay in the WAL only until close drains them
        engine.put(b"tail1", b"wal").unwrap();
        engine.put(b"tail2", b"wal").unwrap();
        engine.close().unwrap();
    }

    let engine = open_small(temp.path());
    assert_eq!(engine.get(b"key000").unwrap().unwrap().as_ref(), b"flushed");
    assert_eq!(engine.get(b"key049").unwrap().unwrap().as_ref(), b"flushed");
    assert_eq!(engine.get(b"tail1").unwrap().unwrap().as_ref(), b"wal");
    assert_eq!(engine.get(b"tail2").unwrap().unwrap().as_ref(), b"wal");
}

#[test]
fn test_reopen_replays_wal_without_manifest_state() {
    use kvstorage::wal::{Operation, WalWriter};

    let temp = TempDir::new().unwrap();
    // Simulate a crash that left acknowledged records only in the WAL
    {
        let mut writer =
            WalWriter::create(temp.path(), 1, 64 * 1024 * 1024, SyncPolicy::EveryWrite).unwrap();
        for i in 1..=5u64 {
            writer
                .append(
                    i,
                    Operation::Put {
                        key: format!("wal{}", i).into_bytes(),
                        value: b"recovered".to_vec(),
                        expire_at: 0,
                    },
                )
                .unwrap();
        }
        writer.sync().unwrap();
    }

    let engine = open_small(temp.path());
    for i in 1..=5 {
        let got = engine.get(format!("wal{}", i).as_bytes()).unwrap().unwrap();
        assert_eq!(got.as_ref(), b"recovered");
    }
    // New sequence numbers continue past the replayed ones
    assert!(engine.put(b"next", b"v").unwrap() > 5);
}

#[test]
fn test_crash_before_flush_recovers_all_keys_in_order() {
    use kvstorage::wal::{Operation, WalWriter};

    let temp = TempDir::new().unwrap();
    // 10,000 acknowledged writes that never reached a sorted table
    {
        let mut writer = WalWriter::create(
            temp.path(),
            1,
            64 * 1024 * 1024,
            SyncPolicy::EveryNWrites { count: 1000 },
        )
        .unwrap();
        for i in 0..10_000u64 {
            writer
                .append(
                    i + 1,
                    Operation::Put {
                        key: format!("key{:05}", i).into_bytes(),
                        value: format!("value{:05}", i).into_bytes(),
                        expire_at: 0,
                    },
                )
                .unwrap();
        }
        writer.sync().unwrap();
    }

    let engine = Engine::open(Config::builder().dir(temp.path()).build()).unwrap();
    let pairs: Vec<_> = engine
        .scan(Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(pairs.len(), 10_000);
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(pairs[0].0.as_ref(), b"key00000");
    assert_eq!(pairs[9_999].1.as_ref(), b"value09999");
}

#[test]
fn test_delete_survives_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open_small(temp.path());
        engine.put(b"doomed", b"v").unwrap();
        engine.flush().unwrap();
        engine.delete(b"doomed").unwrap();
        engine.close().unwrap();
    }

    let engine = open_small(temp.path());
    assert!(engine.get(b"doomed").unwrap().is_none());
}

#[test]
fn test_newest_flushed_version_wins_after_repeated_reopens() {
    let temp = TempDir::new().unwrap();
    // High L0 trigger: both tables must stay at level 0 across reopens so
    // recovery alone determines which version a read finds first
    let make_config = || {
        Config::builder()
            .dir(temp.path())
            .sync_policy(SyncPolicy::EveryWrite)
            .l0_compaction_trigger(100)
            .build()
    };

    {
        let engine = Engine::open(make_config()).unwrap();
        engine.put(b"k", b"old").unwrap();
        engine.flush().unwrap();
        engine.put(b"k", b"new").unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }
    {
        let engine = Engine::open(make_config()).unwrap();
        assert_eq!(engine.get(b"k").unwrap().unwrap().as_ref(), b"new");
        engine.close().unwrap();
    }
    // The second reopen replays the first reopen's rewritten manifest; the
    // level-0 recency order must survive that round trip too
    let engine = Engine::open(make_config()).unwrap();
    assert_eq!(engine.get(b"k").unwrap().unwrap().as_ref(), b"new");
    let pairs: Vec<_> = engine
        .scan(Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].1.as_ref(), b"new");
}

// =============================================================================
// Degraded Mode
// =============================================================================

#[test]
fn test_wal_failure_degrades_engine_to_read_only() {
    use kvstorage::wal;

    let temp = TempDir::new().unwrap();
    // A 1-byte segment threshold forces a rotation on the second append
    let config = Config::builder()
        .dir(temp.path())
        .sync_policy(SyncPolicy::EveryWrite)
        .wal_segment_size(1)
        .build();
    let engine = Engine::open(config).unwrap();
    engine.put(b"a", b"1").unwrap();

    // A directory squatting on the next segment path makes that rotation
    // fail inside the append
    std::fs::create_dir(wal::segment_path(temp.path(), 2)).unwrap();

    assert!(engine.put(b"b", b"2").is_err());
    // The failed write was never acknowledged and must not be visible
    assert!(engine.get(b"b").unwrap().is_none());

    // Subsequent writes are rejected up front; reads keep working
    assert!(matches!(engine.put(b"c", b"3"), Err(KvError::ReadOnly(_))));
    assert!(matches!(engine.delete(b"a"), Err(KvError::ReadOnly(_))));
    assert_eq!(engine.get(b"a").unwrap().unwrap().as_ref(), b"1");

    engine.close().unwrap();
}

#[test]
fn test_full_memtable_swaps_before_accepting_the_write() {
    let temp = TempDir::new().unwrap();
    // A 1-byte limit makes every write after the first find a full
    // memtable, exercising the swap-then-log path each time
    let config = Config::builder()
        .dir(temp.path())
        .sync_policy(SyncPolicy::EveryWrite)
        .memtable_size_limit(1)
        .l0_compaction_trigger(100)
        .build();
    {
        let engine = Engine::open(config).unwrap();
        for i in 0..10u32 {
            engine.put(format!("key{:02}", i).as_bytes(), b"v").unwrap();
        }
        for i in 0..10u32 {
            assert!(engine.get(format!("key{:02}", i).as_bytes()).unwrap().is_some());
        }
        engine.close().unwrap();
    }

    let engine = Engine::open(Config::builder().dir(temp.path()).build()).unwrap();
    for i in 0..10u32 {
        assert!(engine.get(format!("key{:02}", i).as_bytes()).unwrap().is_some());
    }
}

// =============================================================================
// TTL
// =============================================================================

#[test]
fn test_ttl_entry_expires() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let config = Config::builder()
        .dir(temp.path())
        .sync_policy(SyncPolicy::EveryWrite)
        .clock(Arc::clone(&clock) as Arc<dyn kvstorage::Clock>)
        .build();
    let engine = Engine::open(config).unwrap();

    engine.put_with_ttl(b"session", b"token", 60).unwrap();
    engine.put(b"forever", b"v").unwrap();

    assert!(engine.get(b"session").unwrap().is_some());
    clock.advance(59);
    assert!(engine.get(b"session").unwrap().is_some());
    clock.advance(1);
    assert!(engine.get(b"session").unwrap().is_none());
    assert!(engine.get(b"forever").unwrap().is_some());
}

#[test]
fn test_expired_version_masks_older_one() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let config = Config::builder()
        .dir(temp.path())
        .sync_policy(SyncPolicy::EveryWrite)
        .clock(Arc::clone(&clock) as Arc<dyn kvstorage::Clock>)
        .build();
    let engine = Engine::open(config).unwrap();

    engine.put(b"k", b"eternal").unwrap();
    engine.put_with_ttl(b"k", b"fleeting", 10).unwrap();

    clock.advance(11);
    // The newest version expired; the key reads absent, not rolled back
    assert!(engine.get(b"k").unwrap().is_none());
}

#[test]
fn test_scan_skips_expired_entries() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(500));
    let config = Config::builder()
        .dir(temp.path())
        .sync_policy(SyncPolicy::EveryWrite)
        .clock(Arc::clone(&clock) as Arc<dyn kvstorage::Clock>)
        .build();
    let engine = Engine::open(config).unwrap();

    engine.put(b"a", b"1").unwrap();
    engine.put_with_ttl(b"b", b"2", 5).unwrap();
    engine.put(b"c", b"3").unwrap();
    clock.advance(10);

    let keys: Vec<_> = engine
        .scan(Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].as_ref(), b"a");
    assert_eq!(keys[1].as_ref(), b"c");
}

#[test]
fn test_ttl_survives_flush_and_reopen() {
    let temp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(100));
    let make_config = |clock: &Arc<ManualClock>| {
        Config::builder()
            .dir(temp.path())
            .sync_policy(SyncPolicy::EveryWrite)
            .clock(Arc::clone(clock) as Arc<dyn kvstorage::Clock>)
            .build()
    };

    {
        let engine = Engine::open(make_config(&clock)).unwrap();
        engine.put_with_ttl(b"k", b"v", 50).unwrap();
        engine.flush().unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(make_config(&clock)).unwrap();
    assert!(engine.get(b"k").unwrap().is_some());
    clock.advance(50);
    assert!(engine.get(b"k").unwrap().is_none());
}

// =============================================================================
// Scans
// =============================================================================

#[test]
fn test_scan_merges_memtable_and_tables_in_order() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    for i in (0..40).step_by(2) {
        engine.put(format!("key{:03}", i).as_bytes(), b"flushed").unwrap();
    }
    engine.flush().unwrap();
    for i in (1..40).step_by(2) {
        engine.put(format!("key{:03}", i).as_bytes(), b"fresh").unwrap();
    }

    let pairs: Vec<_> = engine
        .scan(Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(pairs.len(), 40);
    for (i, (key, value)) in pairs.iter().enumerate() {
        assert_eq!(key.as_ref(), format!("key{:03}", i).as_bytes());
        let expected: &[u8] = if i % 2 == 0 { b"flushed" } else { b"fresh" };
        assert_eq!(value.as_ref(), expected);
    }
}

#[test]
fn test_scan_respects_bounds() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());
    for key in [b"apple".as_slice(), b"brave", b"cedar", b"delta"] {
        engine.put(key, b"v").unwrap();
    }

    let keys: Vec<_> = engine
        .scan(Bound::Excluded(b"apple".as_slice()), Bound::Included(b"cedar".as_slice()))
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0].as_ref(), b"brave");
    assert_eq!(keys[1].as_ref(), b"cedar");
}

#[test]
fn test_scan_does_not_observe_later_writes() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());
    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();

    let scan = engine.scan(Bound::Unbounded, Bound::Unbounded).unwrap();
    // Writes after the scan is created are beyond its sequence bound
    engine.put(b"a", b"9").unwrap();
    engine.put(b"c", b"3").unwrap();

    let pairs: Vec<_> = scan.collect::<Result<Vec<_>, _>>().unwrap();
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].0.as_ref(), b"a");
    assert_eq!(pairs[0].1.as_ref(), b"1");
    assert_eq!(pairs[1].0.as_ref(), b"b");
}

#[test]
fn test_scan_hides_deleted_keys_across_layers() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    engine.put(b"a", b"1").unwrap();
    engine.put(b"b", b"2").unwrap();
    engine.flush().unwrap();
    // Tombstone in the memtable masks the flushed value below it
    engine.delete(b"a").unwrap();

    let keys: Vec<_> = engine
        .scan(Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .map(|r| r.unwrap().0)
        .collect();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].as_ref(), b"b");
}

#[test]
fn test_get_many_sorted() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());
    for i in 0..20 {
        engine.put(format!("key{:03}", i).as_bytes(), b"v").unwrap();
    }

    let got = engine.get_many_sorted(b"key005", 3).unwrap();
    let keys: Vec<&[u8]> = got.iter().map(|(k, _)| k.as_ref()).collect();
    assert_eq!(keys, vec![b"key005".as_ref(), b"key006".as_ref(), b"key007".as_ref()]);

    // Asking past the end returns what exists
    let tail = engine.get_many_sorted(b"key018", 10).unwrap();
    assert_eq!(tail.len(), 2);
}

// =============================================================================
// Compaction
// =============================================================================

#[test]
fn test_reads_stay_correct_under_compaction() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    // Several flush rounds overwriting the same keys; with an L0 trigger
    // of 2 this forces compactions while we keep writing
    for round in 0..6 {
        for i in 0..30 {
            engine
                .put(
                    format!("key{:03}", i).as_bytes(),
                    format!("round{}", round).as_bytes(),
                )
                .unwrap();
        }
        engine.flush().unwrap();
    }
    std::thread::sleep(std::time::Duration::from_millis(600));

    for i in 0..30 {
        let got = engine.get(format!("key{:03}", i).as_bytes()).unwrap().unwrap();
        assert_eq!(got.as_ref(), b"round5");
    }

    let pairs: Vec<_> = engine
        .scan(Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(pairs.len(), 30);
}

#[test]
fn test_deleted_keys_stay_deleted_through_compaction() {
    let temp = TempDir::new().unwrap();
    let engine = open_small(temp.path());

    for i in 0..30 {
        engine.put(format!("key{:03}", i).as_bytes(), b"v").unwrap();
    }
    engine.flush().unwrap();
    for i in 0..30 {
        engine.delete(format!("key{:03}", i).as_bytes()).unwrap();
    }
    engine.flush().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(600));

    for i in 0..30 {
        assert!(engine.get(format!("key{:03}", i).as_bytes()).unwrap().is_none());
    }
    assert_eq!(engine.scan(Bound::Unbounded, Bound::Unbounded).unwrap().count(), 0);
}

// =============================================================================
// Volume
// =============================================================================

#[test]
fn test_many_keys_survive_close_and_reopen() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open_small(temp.path());
        for i in 0..2_000 {
            engine
                .put(format!("key{:05}", i).as_bytes(), format!("value{:05}", i).as_bytes())
                .unwrap();
        }
        engine.close().unwrap();
    }

    let engine = open_small(temp.path());
    for i in (0..2_000).step_by(97) {
        let got = engine.get(format!("key{:05}", i).as_bytes()).unwrap().unwrap();
        assert_eq!(got.as_ref(), format!("value{:05}", i).as_bytes());
    }

    // Full ordered sweep
    let pairs: Vec<_> = engine
        .scan(Bound::Unbounded, Bound::Unbounded)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(pairs.len(), 2_000);
    assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
}
