//! Shared fixtures: a set of in-memory hosts with one contract each

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tessera_core::{ContractId, ContractMetadata, HostKey, RedundancySettings};
use tessera_host::{MemoryHost, MemoryProvider};
use tessera_worker::{MemoryLocker, SlabWorker, WorkerConfig};

pub struct Cluster {
    pub provider: Arc<MemoryProvider>,
    pub locker: Arc<MemoryLocker>,
}

impl Cluster {
    /// Cluster with hosts `1..=hosts`
    pub fn new(hosts: u8) -> Self {
        let cluster = Self {
            provider: Arc::new(MemoryProvider::new()),
            locker: Arc::new(MemoryLocker::new()),
        };
        for n in 1..=hosts {
            cluster.add_host(n);
        }
        cluster
    }

    pub fn add_host(&self, n: u8) -> Arc<MemoryHost> {
        self.provider.add_host(host_key(n))
    }

    pub fn host(&self, n: u8) -> Arc<MemoryHost> {
        self.provider
            .host(&host_key(n))
            .unwrap_or_else(|| panic!("host {n} not registered"))
    }

    pub fn worker(&self, config: WorkerConfig) -> SlabWorker {
        SlabWorker::new(self.provider.clone(), self.locker.clone(), config)
    }
}

pub fn host_key(n: u8) -> HostKey {
    HostKey::from_bytes([n; 32])
}

pub fn contract(n: u8) -> ContractMetadata {
    let mut id = [0xc0; 32];
    id[0] = n;
    ContractMetadata::new(
        ContractId::from_bytes(id),
        host_key(n),
        format!("host{n}.tessera.test:9982"),
    )
}

pub fn contracts(hosts: &[u8]) -> Vec<ContractMetadata> {
    hosts.iter().map(|&n| contract(n)).collect()
}

/// Worker config without sector timeouts
pub fn test_config() -> WorkerConfig {
    WorkerConfig {
        upload_sector_timeout: None,
        download_sector_timeout: None,
        lock_timeout: Duration::from_secs(5),
        max_concurrent_sectors: 16,
        spending_flush_interval: Duration::from_secs(1),
        redundancy: RedundancySettings::new(2, 4).unwrap(),
    }
}

pub fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}
