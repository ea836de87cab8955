//! # KVStorage
//!
//! An embeddable, disk-backed key-value storage engine with:
//! - Write-Ahead Logging (WAL) for durability
//! - Crash recovery with partial write handling
//! - Versioned reads through point-in-time snapshots
//! - Per-key time-to-live (TTL) expiration
//! - Background flushing and leveled compaction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Engine                                │
//! │        put / put_with_ttl / delete / get / scan              │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ writes                           │ reads
//!            ▼                                  ▼
//!     ┌─────────────┐                   ┌──────────────┐
//!     │     WAL     │                   │   MemTable   │
//!     │  (append)   │──── replay ──────▶│  (versioned) │
//!     └─────────────┘                   └──────┬───────┘
//!                                              │ flush
//!                                              ▼
//!     ┌─────────────┐   compaction      ┌──────────────┐
//!     │  Manifest / │◀── journals ──────│Sorted Tables │
//!     │ Version Set │                   │ (L0 ... L6)  │
//!     └─────────────┘                   └──────┬───────┘
//!                                              │ block reads
//!                                              ▼
//!                                       ┌──────────────┐
//!                                       │ Block Cache  │
//!                                       │    (LRU)     │
//!                                       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use kvstorage::{Config, Engine};
//!
//! # fn main() -> kvstorage::Result<()> {
//! let config = Config::builder().dir("./data").build();
//! let engine = Engine::open(config)?;
//!
//! engine.put(b"name", b"value")?;
//! assert!(engine.get(b"name")?.is_some());
//!
//! let snap = engine.snapshot()?;
//! engine.delete(b"name")?;
//! assert!(engine.get(b"name")?.is_none());
//! assert!(engine.get_at(&snap, b"name")?.is_some());
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod clock;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod error;
pub mod memtable;
pub mod snapshot;
pub mod table;
pub mod types;
pub mod version;
pub mod wal;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use cache::BlockCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder, SyncPolicy};
pub use engine::{Engine, Scan};
pub use error::{KvError, Result};
pub use snapshot::Snapshot;
pub use types::{Entry, Value, NO_EXPIRY};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
