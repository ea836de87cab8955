//! Configuration for KVStorage
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};

/// Main configuration for a KVStorage instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files.
    /// Internal structure:
    ///   {dir}/
    ///     ├── wal_000001.log   (write-ahead log segments)
    ///     ├── table_000001.sst (sorted table files)
    ///     ├── MANIFEST-000001  (version transition log)
    ///     └── CURRENT          (pointer to the live manifest)
    pub dir: PathBuf,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync policy: how often to fsync the WAL
    pub sync_policy: SyncPolicy,

    /// Rotate the active WAL segment once it exceeds this many bytes
    pub wal_segment_size: u64,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Approximate byte footprint of the memtable before it is swapped
    /// out and flushed to a sorted table
    pub memtable_size_limit: usize,

    // -------------------------------------------------------------------------
    // Sorted Table Configuration
    // -------------------------------------------------------------------------
    /// Target uncompressed size of one data block
    pub block_size: usize,

    /// Compaction cuts a new output table once it exceeds this many bytes
    pub target_table_size: u64,

    // -------------------------------------------------------------------------
    // Block Cache Configuration
    // -------------------------------------------------------------------------
    /// Total bytes of decoded blocks the cache may hold
    pub cache_capacity: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Number of level-0 tables that triggers a compaction into level 1
    pub l0_compaction_trigger: usize,

    /// Byte budget of level 1; each deeper level gets
    /// `level_base_size * level_size_multiplier^(n-1)`
    pub level_base_size: u64,

    /// Fan-out between adjacent levels
    pub level_size_multiplier: u64,

    // -------------------------------------------------------------------------
    // Time Source
    // -------------------------------------------------------------------------
    /// Clock used to evaluate entry expiration; injectable for tests
    pub clock: Arc<dyn Clock>,
}

/// WAL sync policy
#[derive(Debug, Clone, Copy)]
pub enum SyncPolicy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced appends (balanced durability/performance)
    EveryNWrites { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./kvstorage_data"),
            sync_policy: SyncPolicy::EveryNWrites { count: 100 },
            wal_segment_size: 64 * 1024 * 1024,      // 64 MB
            memtable_size_limit: 64 * 1024 * 1024,   // 64 MB
            block_size: 4 * 1024,                    // 4 KB
            target_table_size: 32 * 1024 * 1024,     // 32 MB
            cache_capacity: 128 * 1024 * 1024,       // 128 MB
            l0_compaction_trigger: 4,
            level_base_size: 64 * 1024 * 1024,       // 64 MB
            level_size_multiplier: 10,
            clock: Arc::new(SystemClock),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dir = path.into();
        self
    }

    /// Set the WAL sync policy
    pub fn sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.config.sync_policy = policy;
        self
    }

    /// Set the WAL segment rotation threshold (in bytes)
    pub fn wal_segment_size(mut self, size: u64) -> Self {
        self.config.wal_segment_size = size;
        self
    }

    /// Set the memtable size limit (in bytes)
    pub fn memtable_size_limit(mut self, size: usize) -> Self {
        self.config.memtable_size_limit = size;
        self
    }

    /// Set the sorted table block size (in bytes)
    pub fn block_size(mut self, size: usize) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the compaction output table size (in bytes)
    pub fn target_table_size(mut self, size: u64) -> Self {
        self.config.target_table_size = size;
        self
    }

    /// Set the block cache capacity (in bytes)
    pub fn cache_capacity(mut self, size: usize) -> Self {
        self.config.cache_capacity = size;
        self
    }

    /// Set the level-0 table count that triggers compaction
    pub fn l0_compaction_trigger(mut self, count: usize) -> Self {
        self.config.l0_compaction_trigger = count;
        self
    }

    /// Set the byte budget of level 1
    pub fn level_base_size(mut self, size: u64) -> Self {
        self.config.level_base_size = size;
        self
    }

    /// Set the fan-out between adjacent levels
    pub fn level_size_multiplier(mut self, multiplier: u64) -> Self {
        self.config.level_size_multiplier = multiplier;
        self
    }

    /// Set the clock used for TTL expiration
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.config.clock = clock;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
