//! Sector session traits
//!
//! Defines the interface every host transport must follow. A session is
//! scoped to one (contract, host) pair and is torn down when dropped.

use async_trait::async_trait;
use tessera_core::{ContractId, ContractMetadata, HostKey, SectorRoot};
use thiserror::Error;
use tokio::io::AsyncWrite;

/// Result type alias for session operations
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Errors reported by a host session
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("Sector not found: {0}")]
    SectorNotFound(SectorRoot),

    #[error("Range out of bounds: offset {offset} length {length}")]
    OutOfBounds { offset: u32, length: u32 },

    #[error("Host rejected request: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

/// Host statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostStats {
    /// Number of sectors stored
    pub sectors: u64,

    /// Bytes used by stored sectors
    pub bytes_used: u64,

    /// Number of sector uploads
    pub uploads: u64,

    /// Number of sector range downloads
    pub downloads: u64,

    /// Number of sectors deleted
    pub deletes: u64,

    /// Number of delete calls (batches)
    pub delete_calls: u64,

    /// Sessions opened / torn down
    pub sessions_opened: u64,
    pub sessions_closed: u64,
}

impl HostStats {
    /// Sessions still alive
    pub fn open_sessions(&self) -> u64 {
        self.sessions_opened.saturating_sub(self.sessions_closed)
    }
}

/// A session against one contract's host
///
/// All implementations must be Send + Sync so sessions can be driven from
/// spawned tasks.
#[async_trait]
pub trait SectorStore: Send + Sync {
    /// Contract the session operates on
    fn contract(&self) -> ContractId;

    /// Host the session talks to
    fn host_key(&self) -> HostKey;

    /// Store one sector-sized buffer, returning its content root
    async fn upload_sector(&self, sector: &[u8]) -> SessionResult<SectorRoot>;

    /// Write `length` bytes of sector `root`, starting at `offset`, to `out`
    async fn download_sector(
        &self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        root: SectorRoot,
        offset: u32,
        length: u32,
    ) -> SessionResult<()>;

    /// Delete a batch of sectors
    async fn delete_sectors(&self, roots: &[SectorRoot]) -> SessionResult<()>;
}

/// Opens sessions against contracted hosts
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Open a session for `contract`. The session is torn down when the
    /// returned box is dropped.
    async fn session(&self, contract: &ContractMetadata) -> SessionResult<Box<dyn SectorStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_sessions() {
        let stats = HostStats {
            sessions_opened: 5,
            sessions_closed: 3,
            ..Default::default()
        };
        assert_eq!(stats.open_sessions(), 2);
    }

    #[test]
    fn test_io_error_conversion() {
        let err: SessionError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, SessionError::Io(msg) if msg.contains("gone")));
    }
}
