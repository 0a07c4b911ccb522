//! Tessera Sector Hosts
//!
//! Provides the per-host sector session abstraction used by the slab worker:
//! - `SectorStore` trait for a session against one contract's host
//! - `StoreProvider` trait for opening sessions
//! - `MemoryHost` / `MemoryProvider` for testing and local development

pub mod backend;
pub mod memory;

pub use backend::{HostStats, SectorStore, SessionError, SessionResult, StoreProvider};
pub use memory::{MemoryHost, MemoryProvider, MemorySession};
