//! In-memory sector hosts
//!
//! Used for testing and development. Not persistent. Hosts can be taken
//! offline, slowed down or made to reject uploads to exercise the slab
//! worker's failure handling.

use crate::backend::{HostStats, SectorStore, SessionError, SessionResult, StoreProvider};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{ContractId, ContractMetadata, HostKey, SectorRoot, SECTOR_SIZE};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A content-addressed sector host held in memory
pub struct MemoryHost {
    key: HostKey,

    /// Sector storage
    sectors: RwLock<HashMap<SectorRoot, Bytes>>,

    /// Delay applied to every sector operation
    latency: RwLock<Duration>,

    offline: AtomicBool,
    fail_uploads: AtomicBool,

    /// Operation counters
    uploads: AtomicU64,
    downloads: AtomicU64,
    deletes: AtomicU64,
    delete_calls: AtomicU64,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
}

impl MemoryHost {
    /// Create a new, empty host
    pub fn new(key: HostKey) -> Self {
        Self {
            key,
            sectors: RwLock::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
            offline: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
            uploads: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            sessions_closed: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> HostKey {
        self.key
    }

    /// Refuse new sessions and fail operations on open ones
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every sector operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Reject every upload
    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Check whether a sector is stored
    pub fn has_sector(&self, root: &SectorRoot) -> bool {
        self.sectors.read().contains_key(root)
    }

    /// Roots of every stored sector
    pub fn sector_roots(&self) -> Vec<SectorRoot> {
        self.sectors.read().keys().copied().collect()
    }

    /// Snapshot of the host's counters
    pub fn stats(&self) -> HostStats {
        let sectors = self.sectors.read();
        HostStats {
            sectors: sectors.len() as u64,
            bytes_used: sectors.values().map(|s| s.len() as u64).sum(),
            uploads: self.uploads.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            delete_calls: self.delete_calls.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::SeqCst),
            sessions_closed: self.sessions_closed.load(Ordering::SeqCst),
        }
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Apply configured latency, then fail if the host went away meanwhile
    async fn begin(&self) -> SessionResult<()> {
        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.is_offline() {
            return Err(SessionError::Unreachable(self.key.to_string()));
        }
        Ok(())
    }
}

/// Session against a [`MemoryHost`]
pub struct MemorySession {
    host: Arc<MemoryHost>,
    contract: ContractId,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.host.sessions_closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SectorStore for MemorySession {
    fn contract(&self) -> ContractId {
        self.contract
    }

    fn host_key(&self) -> HostKey {
        self.host.key
    }

    async fn upload_sector(&self, sector: &[u8]) -> SessionResult<SectorRoot> {
        self.host.begin().await?;
        if self.host.fail_uploads.load(Ordering::SeqCst) {
            return Err(SessionError::Rejected("uploads disabled".to_string()));
        }
        if sector.len() != SECTOR_SIZE {
            return Err(SessionError::Rejected(format!(
                "sector must be {} bytes, got {}",
                SECTOR_SIZE,
                sector.len()
            )));
        }

        let root = SectorRoot::of(sector);
        self.host
            .sectors
            .write()
            .insert(root, Bytes::copy_from_slice(sector));
        self.host.uploads.fetch_add(1, Ordering::Relaxed);
        debug!(host = %self.host.key, root = ?root, "stored sector");
        Ok(root)
    }

    async fn download_sector(
        &self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        root: SectorRoot,
        offset: u32,
        length: u32,
    ) -> SessionResult<()> {
        self.host.begin().await?;
        if offset as usize + length as usize > SECTOR_SIZE {
            return Err(SessionError::OutOfBounds { offset, length });
        }

        let sector = self
            .host
            .sectors
            .read()
            .get(&root)
            .cloned()
            .ok_or(SessionError::SectorNotFound(root))?;
        self.host.downloads.fetch_add(1, Ordering::Relaxed);

        let (start, end) = (offset as usize, offset as usize + length as usize);
        out.write_all(&sector[start..end]).await?;
        Ok(())
    }

    async fn delete_sectors(&self, roots: &[SectorRoot]) -> SessionResult<()> {
        self.host.begin().await?;
        self.host.delete_calls.fetch_add(1, Ordering::Relaxed);

        let mut sectors = self.host.sectors.write();
        for root in roots {
            if sectors.remove(root).is_some() {
                self.host.deletes.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

/// Hands out sessions against a set of [`MemoryHost`]s
#[derive(Default)]
pub struct MemoryProvider {
    hosts: RwLock<HashMap<HostKey, Arc<MemoryHost>>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new empty host, replacing any previous host with that key
    pub fn add_host(&self, key: HostKey) -> Arc<MemoryHost> {
        let host = Arc::new(MemoryHost::new(key));
        self.hosts.write().insert(key, host.clone());
        host
    }

    /// Look up a registered host
    pub fn host(&self, key: &HostKey) -> Option<Arc<MemoryHost>> {
        self.hosts.read().get(key).cloned()
    }

    /// Unregister a host. Open sessions keep working until dropped.
    pub fn remove_host(&self, key: &HostKey) -> Option<Arc<MemoryHost>> {
        self.hosts.write().remove(key)
    }

    /// Open a session with the concrete type, for callers that need it
    pub fn open(&self, contract: &ContractMetadata) -> SessionResult<MemorySession> {
        let host = self
            .host(&contract.host_key)
            .ok_or_else(|| SessionError::Unreachable(contract.host_addr.clone()))?;
        if host.is_offline() {
            return Err(SessionError::Unreachable(contract.host_addr.clone()));
        }

        host.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            host,
            contract: contract.id,
        })
    }
}

#[async_trait]
impl StoreProvider for MemoryProvider {
    async fn session(&self, contract: &ContractMetadata) -> SessionResult<Box<dyn SectorStore>> {
        Ok(Box::new(self.open(contract)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(n: u8) -> ContractMetadata {
        ContractMetadata::new(
            ContractId::from_bytes([n; 32]),
            HostKey::from_bytes([n; 32]),
            format!("host{}.test:9982", n),
        )
    }

    fn sector(fill: u8) -> Vec<u8> {
        vec![fill; SECTOR_SIZE]
    }

    #[tokio::test]
    async fn test_upload_download_range() {
        let provider = MemoryProvider::new();
        provider.add_host(HostKey::from_bytes([1; 32]));
        let session = provider.session(&contract(1)).await.unwrap();

        let mut data = sector(0);
        data[100..110].copy_from_slice(b"0123456789");
        let root = session.upload_sector(&data).await.unwrap();
        assert_eq!(root, SectorRoot::of(&data));

        let mut out = Vec::new();
        session.download_sector(&mut out, root, 102, 5).await.unwrap();
        assert_eq!(out, b"23456");
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let provider = MemoryProvider::new();
        let host = provider.add_host(HostKey::from_bytes([1; 32]));
        let session = provider.session(&contract(1)).await.unwrap();

        let a = session.upload_sector(&sector(7)).await.unwrap();
        let b = session.upload_sector(&sector(7)).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(host.stats().sectors, 1);
        assert_eq!(host.stats().uploads, 2);
    }

    #[tokio::test]
    async fn test_rejects_wrong_size_and_bad_range() {
        let provider = MemoryProvider::new();
        provider.add_host(HostKey::from_bytes([1; 32]));
        let session = provider.session(&contract(1)).await.unwrap();

        let err = session.upload_sector(&[0u8; 10]).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected(_)));

        let root = session.upload_sector(&sector(1)).await.unwrap();
        let mut out = Vec::new();
        let err = session
            .download_sector(&mut out, root, SECTOR_SIZE as u32 - 1, 2)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::OutOfBounds {
                offset: SECTOR_SIZE as u32 - 1,
                length: 2
            }
        );

        let missing = SectorRoot::from_bytes([9; 32]);
        let err = session.download_sector(&mut out, missing, 0, 1).await.unwrap_err();
        assert_eq!(err, SessionError::SectorNotFound(missing));
    }

    #[tokio::test]
    async fn test_offline_and_unknown_hosts() {
        let provider = MemoryProvider::new();
        let host = provider.add_host(HostKey::from_bytes([1; 32]));

        assert!(matches!(
            provider.session(&contract(2)).await,
            Err(SessionError::Unreachable(_))
        ));

        let session = provider.session(&contract(1)).await.unwrap();
        host.set_offline(true);
        assert!(matches!(
            session.upload_sector(&sector(1)).await,
            Err(SessionError::Unreachable(_))
        ));
        assert!(matches!(
            provider.session(&contract(1)).await,
            Err(SessionError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_and_session_accounting() {
        let provider = MemoryProvider::new();
        let host = provider.add_host(HostKey::from_bytes([1; 32]));

        {
            let session = provider.session(&contract(1)).await.unwrap();
            let root = session.upload_sector(&sector(3)).await.unwrap();
            session
                .delete_sectors(&[root, SectorRoot::from_bytes([0; 32])])
                .await
                .unwrap();
            assert!(!host.has_sector(&root));
            assert_eq!(host.stats().open_sessions(), 1);
        }

        let stats = host.stats();
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.delete_calls, 1);
        assert_eq!(stats.sessions_opened, 1);
        assert_eq!(stats.sessions_closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_applied() {
        let provider = MemoryProvider::new();
        let host = provider.add_host(HostKey::from_bytes([1; 32]));
        host.set_latency(Duration::from_secs(5));
        let session = provider.session(&contract(1)).await.unwrap();

        let start = tokio::time::Instant::now();
        session.upload_sector(&sector(1)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
