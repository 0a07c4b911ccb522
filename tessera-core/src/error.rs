//! Error types for Tessera core
//!
//! Covers the codec, encryption and data-model failures. Network and
//! host-level failures live in the host and worker crates.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Unified error type for the slab data model and shard codec
#[derive(Error, Debug)]
pub enum TesseraError {
    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Shard size mismatch: expected {expected}, got {actual}")]
    ShardSizeMismatch { expected: usize, actual: usize },

    #[error("Shard count mismatch: expected {expected}, got {actual}")]
    ShardCountMismatch { expected: usize, actual: usize },

    #[error("Slab data too large: {size} bytes (max: {max})")]
    SlabTooLarge { size: usize, max: usize },

    // ===== Data Model Errors =====
    #[error("Invalid redundancy: {0}")]
    InvalidRedundancy(String),

    #[error("Invalid slab slice: offset {offset} + length {length} exceeds {max}")]
    InvalidSlice { offset: u32, length: u32, max: u64 },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reed_solomon_erasure::Error> for TesseraError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        TesseraError::ErasureCoding(err.to_string())
    }
}
