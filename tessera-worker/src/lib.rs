//! Tessera Slab Worker
//!
//! This crate places erasure-coded slabs on storage hosts and keeps them
//! available:
//! - Upload (encode, encrypt, place one shard per host)
//! - Download (fetch `min_shards` sector regions, decrypt, recover)
//! - Migration (move shards off bad or reused hosts)
//! - Deletion (one batch delete per host)
//!
//! Every shard operation holds its contract's lock and runs in a bounded
//! fan-out pool that retries failed shards on the next candidate host and
//! reports hosts that exceeded the sector timeout as slow.

pub mod config;
pub mod error;
pub mod fanout;
pub mod locker;
pub mod metrics;
pub mod spending;
pub mod telemetry;
pub mod transfer;

// Re-export main types
pub use config::{ConfigError, WorkerConfig};
pub use error::{HostError, HostErrorSet, MigrationStep, ShardError, SlabError};
pub use fanout::{ShardDownloads, ShardPool, ShardUploads};
pub use locker::{
    ContractLocker, LockError, LockId, LockerStats, MemoryLocker, DOWNLOAD_PRIORITY,
    UPLOAD_PRIORITY,
};
pub use spending::{
    ContractSpending, ContractSpendingRecord, ContractSpendingRecorder, SpendingError,
    SpendingSink,
};
pub use telemetry::init_tracing;
pub use transfer::{slabs_for_download, SlabUpload, SlabWorker};
