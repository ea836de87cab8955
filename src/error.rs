//! Error types for KVStorage
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using KvError
pub type Result<T> = std::result::Result<T, KvError>;

/// Unified error type for KVStorage operations
#[derive(Debug, Error)]
pub enum KvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Corruption Errors
    // -------------------------------------------------------------------------
    /// Checksum mismatch or malformed on-disk table/manifest data. Carries
    /// enough context to identify the damaged file so the engine can isolate
    /// it instead of crashing.
    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("WAL corruption detected: {0}")]
    WalCorruption(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    /// Operation attempted while the engine is not in the Open state.
    #[error("engine is not open")]
    Closed,

    /// The engine degraded to read-only after a WAL write failure;
    /// mutations are rejected to preserve the durability guarantee.
    #[error("engine is read-only: {0}")]
    ReadOnly(String),

    /// Writes outran flushing and the immutable memtable backlog is full
    #[error("write stalled: too many unflushed memtables")]
    Capacity,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for KvError {
    fn from(e: bincode::Error) -> Self {
        KvError::Serialization(e.to_string())
    }
}
