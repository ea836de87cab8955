//! MemTable Module
//!
//! In-memory ordered structure holding the most recent writes.
//!
//! ## Responsibilities
//! - Fast reads and writes in memory
//! - Retain every version of a key so snapshot-bounded reads stay exact
//! - Track approximate size for flush triggers
//! - Ordered iteration for sorted table creation
//!
//! ## Data Structure Choice
//! BTreeMap keyed by `(key, seq)` in internal order, wrapped in a RwLock:
//! - Ordered keys (required for sorted table generation)
//! - Newest version of a key is the first in its key group
//! - Single writer is enforced by the engine's write path; the lock exists
//!   for the flush/scan readers that run concurrently with it

mod table;

pub use table::{MemTable, MemTableIter};
