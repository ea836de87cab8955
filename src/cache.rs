//! Block Cache
//!
//! Shared in-memory cache of decoded data blocks, keyed by
//! `(table id, block offset)`.
//!
//! ## Policy
//! - Least-recently-used eviction, bounded by total cached bytes rather
//!   than entry count (blocks vary in size)
//! - Misses load outside the cache-wide lock; at most one concurrent load
//!   per key, so concurrent readers of the same block share one disk read
//! - Transient I/O errors during a load are retried once before surfacing

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{KvError, Result};
use crate::table::block::Block;

/// Cache key: (table id, block offset within the table file)
pub type BlockKey = (u64, u64);

struct CacheShardState {
    lru: LruCache<BlockKey, Arc<Block>>,
    used_bytes: usize,
}

/// Byte-bounded LRU cache of decoded blocks
pub struct BlockCache {
    state: Mutex<CacheShardState>,
    capacity: usize,

    /// Per-key load guards; presence means a load is in flight
    loading: Mutex<HashMap<BlockKey, Arc<Mutex<()>>>>,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Create a cache bounded by `capacity` total cached bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheShardState {
                lru: LruCache::unbounded(),
                used_bytes: 0,
            }),
            capacity,
            loading: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch the block, loading it with `load` on a miss.
    ///
    /// The loader runs outside the cache lock. Concurrent callers for the
    /// same key block on a per-key guard and find the block cached once
    /// the first loader finishes.
    pub fn get_or_load<F>(&self, key: BlockKey, mut load: F) -> Result<Arc<Block>>
    where
        F: FnMut() -> Result<Block>,
    {
        if let Some(block) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Single-flight: take (or join) the per-key load guard
        let guard = {
            let mut loading = self.loading.lock();
            loading.entry(key).or_default().clone()
        };
        let _held = guard.lock();

        // Another caller may have finished the load while we waited
        if let Some(block) = self.lookup(key) {
            self.release_guard(key, &guard);
            return Ok(block);
        }

        let loaded = match load() {
            Ok(block) => Ok(block),
            // One retry for transient I/O failures; corruption is not retried
            Err(KvError::Io(e)) => {
                debug!(table = key.0, offset = key.1, error = %e, "retrying block load");
                load()
            }
            Err(e) => Err(e),
        };

        let result = loaded.map(|block| {
            let block = Arc::new(block);
            self.insert(key, Arc::clone(&block));
            block
        });

        self.release_guard(key, &guard);
        result
    }

    /// Drop every cached block belonging to a deleted table
    pub fn invalidate_table(&self, table_id: u64) {
        let mut state = self.state.lock();
        let stale: Vec<BlockKey> = state
            .lru
            .iter()
            .filter(|((id, _), _)| *id == table_id)
            .map(|(k, _)| *k)
            .collect();
        for key in stale {
            if let Some(block) = state.lru.pop(&key) {
                state.used_bytes -= block.encoded_size();
            }
        }
    }

    /// Total bytes currently cached
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    fn lookup(&self, key: BlockKey) -> Option<Arc<Block>> {
        self.state.lock().lru.get(&key).cloned()
    }

    fn insert(&self, key: BlockKey, block: Arc<Block>) {
        let mut state = self.state.lock();
        state.used_bytes += block.encoded_size();
        if let Some(old) = state.lru.push(key, block).and_then(|(k, old)| {
            // push returns the evicted pair only when k differs; same-key
            // replacement returns the old value under the same key
            (k == key).then_some(old)
        }) {
            state.used_bytes -= old.encoded_size();
        }

        while state.used_bytes > self.capacity {
            match state.lru.pop_lru() {
                Some((_, evicted)) => state.used_bytes -= evicted.encoded_size(),
                None => break,
            }
        }
    }

    fn release_guard(&self, key: BlockKey, guard: &Arc<Mutex<()>>) {
        let mut loading = self.loading.lock();
        if let Some(current) = loading.get(&key) {
            if Arc::ptr_eq(current, guard) {
                loading.remove(&key);
            }
        }
    }
}
