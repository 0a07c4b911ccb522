//! Tessera Core Library
//!
//! Core abstractions for the Tessera renter-side slab worker.
//! This crate provides:
//! - Host, contract and sector identifiers
//! - Redundancy settings (min-of-total shard counts)
//! - Striped Reed-Solomon shard coding
//! - Per-shard stream encryption (keyed Blake3 XOF)
//! - Slabs, slab slices and sector-region arithmetic

pub mod crypto;
pub mod erasure;
pub mod error;
pub mod redundancy;
pub mod slab;
pub mod types;

pub use crypto::{xor_keystream, EncryptionKey};
pub use erasure::ShardCodec;
pub use error::{Result, TesseraError};
pub use redundancy::RedundancySettings;
pub use slab::{Slab, SlabSlice};
pub use types::{ContractId, ContractMetadata, HostKey, Sector, SectorRoot};

/// Size of a host sector in bytes (4 MiB).
///
/// Every shard is exactly one sector.
pub const SECTOR_SIZE: usize = 1 << 22;

/// Striping granule in bytes.
///
/// Plaintext is distributed across data shards in `LEAF_SIZE` segments so a
/// contiguous byte range of a slab maps onto the same contiguous region of
/// every shard.
pub const LEAF_SIZE: usize = 64;
