//! Engine Module
//!
//! The public facade tying the storage layers together. One [`Engine`]
//! owns the WAL, the active and immutable memtables, the version set,
//! the block cache, and two background workers (flush and compaction).
//!
//! ## Write Path
//! Writes are serialized: if the active memtable is over its size limit
//! the WAL rotates and the memtable freezes onto the immutable queue
//! first, then a sequence number is assigned, the operation is appended
//! to the WAL (durability per the configured sync policy), and the entry
//! lands in the active memtable. A WAL append failure degrades the
//! engine to read-only so acknowledged durability is never silently lost.
//!
//! ## Read Path
//! Lookups consult newest data first: active memtable, immutable
//! memtables (newest first), then the sorted tables of the current
//! Version. A tombstone or expired entry found on the way reads as
//! absent and stops the search; older versions beneath it stay masked.
//!
//! ## Shutdown
//! `close` (also run on drop) stops accepting writes, drains every
//! memtable to level 0, and joins the workers. A clean shutdown leaves
//! nothing to replay.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cache::BlockCache;
use crate::compaction::{pick_compaction, run_compaction, EntrySource, MergeIterator};
use crate::config::Config;
use crate::error::{KvError, Result};
use crate::memtable::MemTable;
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table::{SortedTable, TableBuilder, TableIterator, TableMeta};
use crate::types::{Entry, Value, MAX_SEQ, NO_EXPIRY};
use crate::version::{Version, VersionEdit, VersionSet};
use crate::wal::{self, Operation, WalRecovery, WalWriter};

/// Immutable memtables the write path tolerates before it stalls and
/// flushes synchronously
const MAX_IMM_MEMTABLES: usize = 4;

/// One consistent bundle of in-memory read state.
///
/// Replaced wholesale under the state lock on every memtable swap, flush
/// install, and compaction install; readers clone the `Arc` and work
/// from a stable view.
struct EngineState {
    /// Active memtable receiving writes
    memtable: Arc<MemTable>,

    /// Frozen memtables awaiting flush, newest first
    imm: Vec<Arc<MemTable>>,

    /// Current sorted-table Version
    version: Arc<Version>,
}

struct EngineInner {
    config: Config,

    state: RwLock<Arc<EngineState>>,

    /// Serializes state replacements (swap, flush install, compaction
    /// install) so no install works from a stale base
    state_lock: Mutex<()>,

    /// Serializes the seq-assign / WAL-append / memtable-insert sequence
    write_lock: Mutex<()>,

    /// Serializes flushes; taken by the worker and by synchronous stalls
    flush_lock: Mutex<()>,

    wal: Mutex<WalWriter>,

    /// Next sequence number to assign
    next_seq: AtomicU64,

    versions: VersionSet,
    cache: Arc<BlockCache>,
    snapshots: Arc<SnapshotList>,

    flush_tx: Sender<()>,
    compact_tx: Sender<()>,

    shutdown: AtomicBool,
    read_only: AtomicBool,
}

/// An open storage engine
pub struct Engine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open (or create) the engine rooted at `config.dir`.
    ///
    /// Recovery order: replay the manifest to reconstruct the table set,
    /// delete WAL segments the manifest proves fully flushed, then replay
    /// the remaining segments into a fresh memtable, skipping records
    /// already durable in a sorted table.
    pub fn open(config: Config) -> Result<Engine> {
        std::fs::create_dir_all(&config.dir)?;

        let versions = VersionSet::open(&config.dir)?;
        remove_flushed_segments(&config.dir, versions.wal_floor());

        let (records, report) = WalRecovery::replay(&config.dir, versions.flushed_seq())?;

        let segments = wal::list_segments(&config.dir)?;
        let next_segment = segments
            .last()
            .map(|(id, _)| id + 1)
            .unwrap_or_else(|| versions.wal_floor().max(1));
        // The recovered memtable's data lives in the retained segments;
        // none of them may be deleted until it flushes
        let memtable_segment = segments.first().map(|(id, _)| *id).unwrap_or(next_segment);

        let wal = WalWriter::create(
            &config.dir,
            next_segment,
            config.wal_segment_size,
            config.sync_policy,
        )?;

        let memtable = Arc::new(MemTable::new(memtable_segment));
        for record in records {
            memtable.insert(record.into_entry());
        }

        let next_seq = report.last_seq.max(versions.flushed_seq()) + 1;
        let version = versions.current();

        let (flush_tx, flush_rx) = bounded(1);
        let (compact_tx, compact_rx) = bounded(1);

        let inner = Arc::new(EngineInner {
            cache: Arc::new(BlockCache::new(config.cache_capacity)),
            config,
            state: RwLock::new(Arc::new(EngineState {
                memtable,
                imm: Vec::new(),
                version,
            })),
            state_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            wal: Mutex::new(wal),
            next_seq: AtomicU64::new(next_seq),
            versions,
            snapshots: Arc::new(SnapshotList::new()),
            flush_tx,
            compact_tx,
            shutdown: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
        });

        let flush_worker = thread::Builder::new().name("kv-flush".into()).spawn({
            let inner = Arc::clone(&inner);
            move || flush_loop(inner, flush_rx)
        })?;
        let compact_worker = thread::Builder::new().name("kv-compact".into()).spawn({
            let inner = Arc::clone(&inner);
            move || compaction_loop(inner, compact_rx)
        })?;

        // Work left over from before the restart
        let _ = inner.flush_tx.try_send(());
        let _ = inner.compact_tx.try_send(());

        info!(
            dir = %inner.config.dir.display(),
            recovered_records = report.records_recovered,
            next_seq,
            tables = inner.versions.current().table_count(),
            "engine opened"
        );

        Ok(Engine {
            inner,
            workers: Mutex::new(vec![flush_worker, compact_worker]),
        })
    }

    /// Store `value` under `key`. Returns the assigned sequence number.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.inner.write(
            Operation::Put {
                key: key.to_vec(),
                value: value.to_vec(),
                expire_at: NO_EXPIRY,
            },
            Entry::put(
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(value),
                0,
                NO_EXPIRY,
            ),
        )
    }

    /// Store `value` under `key` with a time-to-live.
    ///
    /// The entry reads as absent once `ttl_secs` have elapsed; compaction
    /// reclaims the space later. Returns the assigned sequence number.
    pub fn put_with_ttl(&self, key: &[u8], value: &[u8], ttl_secs: u64) -> Result<u64> {
        let expire_at = self.inner.config.clock.now().saturating_add(ttl_secs);
        self.inner.write(
            Operation::Put {
                key: key.to_vec(),
                value: value.to_vec(),
                expire_at,
            },
            Entry::put(
                Bytes::copy_from_slice(key),
                Bytes::copy_from_slice(value),
                0,
                expire_at,
            ),
        )
    }

    /// Delete `key` by writing a tombstone. Returns the assigned sequence
    /// number. Deleting an absent key is not an error.
    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        self.inner.write(
            Operation::Delete { key: key.to_vec() },
            Entry::tombstone(Bytes::copy_from_slice(key), 0),
        )
    }

    /// Latest visible value of `key`, or `None` if absent, deleted, or
    /// expired
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.ensure_open()?;
        let state = self.inner.state.read().clone();
        self.inner
            .lookup(&state.memtable, &state.imm, &state.version, key, MAX_SEQ)
    }

    /// Value of `key` as of `snapshot`
    pub fn get_at(&self, snapshot: &Snapshot, key: &[u8]) -> Result<Option<Bytes>> {
        self.inner.ensure_open()?;
        self.inner.lookup(
            snapshot.memtable(),
            snapshot.imm(),
            snapshot.version(),
            key,
            snapshot.seq(),
        )
    }

    /// Lazy ordered iteration over the visible keys in `[lower, upper]`.
    ///
    /// The returned iterator reads a stable view captured at call time:
    /// its sequence bound is fixed here, so concurrent writes do not
    /// appear in it.
    pub fn scan(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Result<Scan> {
        self.inner.ensure_open()?;
        let _guard = self.inner.state_lock.lock();
        let seq = self.inner.next_seq.load(Ordering::SeqCst).saturating_sub(1);
        let state = self.inner.state.read().clone();
        self.inner.build_scan(
            &state.memtable,
            &state.imm,
            &state.version,
            lower,
            upper,
            seq,
        )
    }

    /// Ordered iteration bounded by `snapshot`
    pub fn scan_at(
        &self,
        snapshot: &Snapshot,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Scan> {
        self.inner.ensure_open()?;
        self.inner.build_scan(
            snapshot.memtable(),
            snapshot.imm(),
            snapshot.version(),
            lower,
            upper,
            snapshot.seq(),
        )
    }

    /// Up to `count` visible key-value pairs starting at `start`
    /// (inclusive), in ascending key order
    pub fn get_many_sorted(&self, start: &[u8], count: usize) -> Result<Vec<(Bytes, Bytes)>> {
        let mut out = Vec::new();
        for item in self.scan(Bound::Included(start), Bound::Unbounded)? {
            out.push(item?);
            if out.len() == count {
                break;
            }
        }
        Ok(out)
    }

    /// Capture a consistent point-in-time view for repeatable reads.
    ///
    /// Holding the snapshot delays garbage collection of the versions it
    /// can read; drop it when done.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.inner.ensure_open()?;
        // The state lock pairs the sequence bound with a state that holds
        // every write at or below it
        let _guard = self.inner.state_lock.lock();
        let seq = self.inner.next_seq.load(Ordering::SeqCst).saturating_sub(1);
        let state = self.inner.state.read().clone();
        Ok(Snapshot::new(
            seq,
            Arc::clone(&state.version),
            Arc::clone(&state.memtable),
            state.imm.clone(),
            Arc::clone(&self.inner.snapshots),
        ))
    }

    /// Force every buffered write down to a level-0 sorted table
    pub fn flush(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.flush()
    }

    /// Block cache hit/miss counters
    pub fn cache_stats(&self) -> (u64, u64) {
        self.inner.cache.stats()
    }

    /// Stop accepting writes, drain all memtables, and join the workers.
    ///
    /// Idempotent; also invoked on drop. After a clean close the WAL is
    /// empty of unflushed data and reopening replays nothing.
    pub fn close(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("closing engine");

        let flush_result = if self.inner.read_only.load(Ordering::SeqCst) {
            // WAL already failed; do not risk acknowledging more state
            Ok(())
        } else {
            self.inner.flush()
        };

        let _ = self.inner.flush_tx.try_send(());
        let _ = self.inner.compact_tx.try_send(());
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }

        if let Err(e) = &flush_result {
            error!(error = %e, "final flush failed during close");
        }
        flush_result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.inner.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                error!(error = %e, "close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.inner.config.dir)
            .finish()
    }
}

impl EngineInner {
    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(KvError::Closed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only.load(Ordering::SeqCst) {
            return Err(KvError::ReadOnly(
                "a WAL append failed; reopen the engine to recover".into(),
            ));
        }
        Ok(())
    }

    /// Serialized write path: make room, assign a sequence number, log,
    /// apply.
    ///
    /// `entry` mirrors `op`; its seq is filled in here. The swap and any
    /// capacity stall happen before the WAL append, so a rejected write
    /// was never logged and a logged write is always applied.
    fn write(&self, op: Operation, mut entry: Entry) -> Result<u64> {
        self.ensure_writable()?;
        let _guard = self.write_lock.lock();

        let state = self.state.read().clone();
        if state.memtable.approximate_size() >= self.config.memtable_size_limit {
            if state.imm.len() >= MAX_IMM_MEMTABLES {
                // Backpressure: flush in this thread rather than queueing
                // unbounded memory
                warn!("immutable memtable backlog full, flushing synchronously");
                self.flush_oldest_imm()?;
                if self.state.read().imm.len() >= MAX_IMM_MEMTABLES {
                    return Err(KvError::Capacity);
                }
            }
            self.swap_memtable()?;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        entry.seq = seq;

        {
            let mut wal = self.wal.lock();
            if let Err(e) = wal.append(seq, op) {
                self.read_only.store(true, Ordering::SeqCst);
                error!(error = %e, "WAL append failed, degrading to read-only");
                return Err(e);
            }
        }

        self.state.read().memtable.insert(entry);
        Ok(seq)
    }

    /// Freeze the active memtable onto the immutable queue and start a
    /// fresh one on a fresh WAL segment. Caller holds the write lock.
    fn swap_memtable(&self) -> Result<()> {
        // Rotate first so the frozen memtable's records all live in
        // segments older than the new active one
        let new_segment = self.wal.lock().rotate()?;

        let _guard = self.state_lock.lock();
        let state = self.state.read().clone();
        state.memtable.freeze();

        let mut imm = state.imm.clone();
        imm.insert(0, Arc::clone(&state.memtable));

        debug!(
            frozen = state.memtable.id(),
            size = state.memtable.approximate_size(),
            backlog = imm.len(),
            "memtable swapped"
        );

        *self.state.write() = Arc::new(EngineState {
            memtable: Arc::new(MemTable::new(new_segment)),
            imm,
            version: Arc::clone(&state.version),
        });

        let _ = self.flush_tx.try_send(());
        Ok(())
    }

    /// Flush the oldest immutable memtable to a level-0 table.
    ///
    /// Returns false when there was nothing to flush.
    fn flush_oldest_imm(&self) -> Result<bool> {
        let _flush_guard = self.flush_lock.lock();

        let Some(mem) = self.state.read().imm.last().cloned() else {
            return Ok(false);
        };

        let meta = if mem.is_empty() {
            None
        } else {
            let table_id = self.versions.allocate_table_id();
            let mut builder = TableBuilder::new(&self.config.dir, table_id, self.config.block_size)?;
            for entry in mem.iter_all() {
                builder.add(&entry)?;
            }
            Some(builder.finish()?)
        };

        let _state_guard = self.state_lock.lock();
        let state = self.state.read().clone();
        let mut imm = state.imm.clone();
        imm.pop();

        // Segments older than every live memtable's first segment hold
        // only flushed data
        let wal_floor = imm
            .iter()
            .map(|m| m.id())
            .chain(std::iter::once(state.memtable.id()))
            .min()
            .unwrap_or_else(|| state.memtable.id());

        let version = match meta {
            Some(meta) => {
                let table = Arc::new(SortedTable::open(&self.config.dir, meta.clone())?);
                let table_id = meta.id;

                let mut edit = VersionEdit::new();
                edit.add_table(0, meta);
                if let Some(seq) = mem.max_seq() {
                    edit.set_flushed_seq(seq);
                }
                edit.set_wal_floor(wal_floor).set_next_table_id(table_id + 1);

                let (version, _) = self.versions.log_and_apply(edit, &[(0, table)])?;
                info!(
                    table = table_id,
                    entries = mem.len(),
                    wal_floor,
                    "memtable flushed to level 0"
                );
                version
            }
            None => Arc::clone(&state.version),
        };

        *self.state.write() = Arc::new(EngineState {
            memtable: Arc::clone(&state.memtable),
            imm,
            version,
        });
        drop(_state_guard);

        remove_flushed_segments(&self.config.dir, wal_floor);
        let _ = self.compact_tx.try_send(());
        Ok(true)
    }

    /// Swap out a non-empty active memtable and drain the whole queue
    fn flush(&self) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            if !self.state.read().memtable.is_empty() {
                self.swap_memtable()?;
            }
        }
        while self.flush_oldest_imm()? {}
        Ok(())
    }

    /// Point lookup against an explicit view, newest data first
    fn lookup(
        &self,
        memtable: &MemTable,
        imm: &[Arc<MemTable>],
        version: &Version,
        key: &[u8],
        seq_bound: u64,
    ) -> Result<Option<Bytes>> {
        let now = self.config.clock.now();

        if let Some(entry) = memtable.get(key, seq_bound) {
            return Ok(visible(entry, now));
        }
        for mem in imm {
            if let Some(entry) = mem.get(key, seq_bound) {
                return Ok(visible(entry, now));
            }
        }
        for table in version.tables_for_key(key) {
            match table.get(key, seq_bound, &self.cache)? {
                Some(entry) => return Ok(visible(entry, now)),
                None => continue,
            }
        }
        Ok(None)
    }

    /// Assemble the merge over every source overlapping the bounds.
    ///
    /// The sources pin their tables and memtables; the returned scan stays
    /// valid however the engine state moves on.
    fn build_scan(
        &self,
        memtable: &Arc<MemTable>,
        imm: &[Arc<MemTable>],
        version: &Version,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        seq_bound: u64,
    ) -> Result<Scan> {
        let now = self.config.clock.now();

        let mut sources: Vec<EntrySource> = Vec::new();
        sources.push(Box::new(memtable.iter_range(lower, upper, seq_bound).map(Ok)));
        for mem in imm {
            sources.push(Box::new(mem.iter_range(lower, upper, seq_bound).map(Ok)));
        }
        for level in version.levels() {
            for table in level {
                if table_overlaps(table.meta(), &lower, &upper) {
                    sources.push(Box::new(TableIterator::new_range(
                        Arc::clone(table),
                        Arc::clone(&self.cache),
                        lower,
                        upper,
                    )));
                }
            }
        }

        Ok(Scan {
            merge: MergeIterator::new(sources)?,
            seq_bound,
            now,
            last_key: None,
        })
    }

    /// One compaction pass; returns false when no level is over threshold
    fn compact_once(&self) -> Result<bool> {
        let version = self.versions.current();
        let Some(task) = pick_compaction(&version, &self.config) else {
            return Ok(false);
        };

        let outcome = run_compaction(
            &self.config.dir,
            &self.config,
            &self.cache,
            &self.versions,
            &task,
            self.snapshots.floor(),
            self.config.clock.now(),
        )?;

        let deleted = {
            let _guard = self.state_lock.lock();
            let (new_version, deleted) = self.versions.log_and_apply(outcome.edit, &outcome.new_tables)?;
            let state = self.state.read().clone();
            *self.state.write() = Arc::new(EngineState {
                memtable: Arc::clone(&state.memtable),
                imm: state.imm.clone(),
                version: new_version,
            });
            deleted
        };

        for id in deleted {
            self.cache.invalidate_table(id);
        }
        Ok(true)
    }
}

/// Resolve a raw entry to its caller-visible value
fn visible(entry: Entry, now: u64) -> Option<Bytes> {
    if entry.is_expired(now) {
        return None;
    }
    match entry.value {
        Value::Tombstone => None,
        Value::Put(value) => Some(value),
    }
}

fn table_overlaps(meta: &TableMeta, lower: &Bound<&[u8]>, upper: &Bound<&[u8]>) -> bool {
    let above_lower = match lower {
        Bound::Included(k) => meta.properties.max_key.as_slice() >= *k,
        Bound::Excluded(k) => meta.properties.max_key.as_slice() > *k,
        Bound::Unbounded => true,
    };
    let below_upper = match upper {
        Bound::Included(k) => meta.properties.min_key.as_slice() <= *k,
        Bound::Excluded(k) => meta.properties.min_key.as_slice() < *k,
        Bound::Unbounded => true,
    };
    above_lower && below_upper
}

/// Delete WAL segments older than `floor`; best effort, failures only warn
fn remove_flushed_segments(dir: &std::path::Path, floor: u64) {
    let segments = match wal::list_segments(dir) {
        Ok(segments) => segments,
        Err(e) => {
            warn!(error = %e, "failed to list WAL segments for cleanup");
            return;
        }
    };
    for (id, path) in segments {
        if id < floor {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(segment = id, "removed flushed WAL segment"),
                Err(e) => warn!(segment = id, error = %e, "failed to remove WAL segment"),
            }
        }
    }
}

fn flush_loop(inner: Arc<EngineInner>, rx: Receiver<()>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        loop {
            match inner.flush_oldest_imm() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(error = %e, "flush failed, will retry");
                    break;
                }
            }
        }
    }
}

fn compaction_loop(inner: Arc<EngineInner>, rx: Receiver<()>) {
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        loop {
            if inner.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match inner.compact_once() {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    error!(error = %e, "compaction failed, will retry");
                    break;
                }
            }
        }
    }
}

/// Lazy ordered iterator over visible key-value pairs.
///
/// Yields each key at most once with its newest version at or below the
/// bound; tombstoned and expired keys are skipped. Holds its sources
/// alive, so the view stays stable for the iterator's lifetime.
pub struct Scan {
    merge: MergeIterator,
    seq_bound: u64,
    now: u64,
    last_key: Option<Bytes>,
}

impl Iterator for Scan {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.merge.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };

            // Versions above the bound neither surface nor mask
            if entry.seq > self.seq_bound {
                continue;
            }
            // First version at or below the bound decides the key; older
            // ones are masked
            if self.last_key.as_ref() == Some(&entry.key) {
                continue;
            }
            self.last_key = Some(entry.key.clone());

            let expired = entry.is_expired(self.now);
            match entry.value {
                Value::Tombstone => continue,
                Value::Put(_) if expired => continue,
                Value::Put(value) => return Some(Ok((entry.key, value))),
            }
        }
    }
}
