//! Slab transfers
//!
//! Upload, download, migration and deletion of slabs on top of the shard
//! fan-out pool.

use crate::error::{HostErrorSet, MigrationStep, ShardError, SlabError};
use crate::fanout::ShardPool;
use crate::locker::ContractLocker;
use crate::metrics::names;
use crate::spending::{ContractSpending, ContractSpendingRecorder, SpendingSink};
use crate::WorkerConfig;
use futures::future::join_all;
use metrics::counter;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessera_core::{
    ContractMetadata, HostKey, RedundancySettings, SectorRoot, Slab, SlabSlice, TesseraError,
    SECTOR_SIZE,
};
use tessera_host::{SectorStore, StoreProvider};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

/// Result of [`SlabWorker::upload_slab`]
#[derive(Debug, Clone)]
pub struct SlabUpload {
    pub slab: Slab,
    /// Plaintext bytes consumed from the reader
    pub length: usize,
    /// Indices into the candidate list of hosts that timed out
    pub slow_hosts: Vec<usize>,
}

/// Slab placement engine
pub struct SlabWorker {
    pool: ShardPool,
    config: WorkerConfig,
}

impl SlabWorker {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        locker: Arc<dyn ContractLocker>,
        config: WorkerConfig,
    ) -> Self {
        let pool = ShardPool::new(provider, locker, &config);
        Self { pool, config }
    }

    /// Record contract spending of every successful sector operation
    pub fn with_spending(mut self, recorder: ContractSpendingRecorder) -> Self {
        self.pool = self.pool.with_spending(recorder);
        self
    }

    /// Record contract spending into `sink`, flushed every
    /// `spending_flush_interval` of the worker config
    pub fn with_spending_sink(self, sink: Arc<dyn SpendingSink>) -> Self {
        let recorder = ContractSpendingRecorder::new(sink, self.config.spending_flush_interval);
        self.with_spending(recorder)
    }

    /// Spending recorder in use, if any. Stop it before shutting down.
    pub fn spending(&self) -> Option<&ContractSpendingRecorder> {
        self.pool.spending()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn pool(&self) -> &ShardPool {
        &self.pool
    }

    /// Read up to `min_shards` sectors of plaintext from `reader`, encode and
    /// encrypt it, and place one shard on each of `total_shards` hosts.
    ///
    /// Short input is padded; a reader at EOF still produces a slab.
    #[instrument(skip_all, fields(min_shards = redundancy.min_shards, total_shards = redundancy.total_shards))]
    pub async fn upload_slab<R>(
        &self,
        reader: &mut R,
        redundancy: RedundancySettings,
        contracts: &[ContractMetadata],
    ) -> Result<SlabUpload, SlabError>
    where
        R: AsyncRead + Unpin + Send,
    {
        redundancy.validate()?;
        if contracts.len() < redundancy.total_shards {
            return Err(SlabError::NotEnoughHosts {
                have: contracts.len(),
                need: redundancy.total_shards,
            });
        }

        let mut buf = vec![0u8; redundancy.min_shards * SECTOR_SIZE];
        let mut length = 0;
        while length < buf.len() {
            let n = reader.read(&mut buf[length..]).await?;
            if n == 0 {
                break;
            }
            length += n;
        }

        let mut slab = Slab::new(redundancy.min_shards as u8);
        let mut shards = slab.encode(&buf[..length], redundancy.total_shards)?;
        drop(buf);
        slab.encrypt(&mut shards);

        let uploads = self.pool.upload_shards(shards, contracts).await?;
        slab.shards = uploads.sectors;

        counter!(names::SLABS_UPLOADED).increment(1);
        debug!(length, slow_hosts = uploads.slow_hosts.len(), "uploaded slab");
        Ok(SlabUpload {
            slab,
            length,
            slow_hosts: uploads.slow_hosts,
        })
    }

    /// [`SlabWorker::upload_slab`] with the configured redundancy
    pub async fn upload_slab_default<R>(
        &self,
        reader: &mut R,
        contracts: &[ContractMetadata],
    ) -> Result<SlabUpload, SlabError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.upload_slab(reader, self.config.redundancy, contracts)
            .await
    }

    /// Download the slice from `min_shards` of its hosts and write the
    /// recovered plaintext to `out`. Returns the indices of slow hosts.
    #[instrument(skip_all, fields(offset = slice.offset, length = slice.length))]
    pub async fn download_slab<W>(
        &self,
        out: &mut W,
        slice: &SlabSlice,
        contracts: &[ContractMetadata],
    ) -> Result<Vec<usize>, SlabError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut downloads = self.pool.download_shards(slice, contracts).await?;
        slice.decrypt(&mut downloads.shards);

        let mut plaintext = Vec::with_capacity(slice.length as usize);
        slice.recover(&mut plaintext, downloads.shards)?;
        out.write_all(&plaintext).await?;

        counter!(names::SLABS_DOWNLOADED).increment(1);
        Ok(downloads.slow_hosts)
    }

    /// Move shards off hosts that are not in `contracts` and off hosts that
    /// hold more than one shard of the slab.
    ///
    /// Returns the migrated shard indices; an empty list means the slab was
    /// already healthy.
    #[instrument(skip_all, fields(min_shards = slab.min_shards, shards = slab.shards.len()))]
    pub async fn migrate_slab(
        &self,
        slab: &mut Slab,
        contracts: &[ContractMetadata],
    ) -> Result<Vec<usize>, SlabError> {
        let good: HashSet<HostKey> = contracts.iter().map(|c| c.host_key).collect();
        let mut used = HashSet::new();

        // earliest shard keeps a reused host
        let indices: Vec<usize> = slab
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| !good.contains(&s.host) || !used.insert(s.host))
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return Ok(indices);
        }

        let healthy = slab.shards.len() - indices.len();
        let min_shards = slab.min_shards as usize;
        if healthy < min_shards {
            return Err(SlabError::NotEnoughShards {
                have: healthy,
                need: min_shards,
            });
        }

        let mut candidates: Vec<ContractMetadata> = contracts
            .iter()
            .filter(|c| !used.contains(&c.host_key))
            .cloned()
            .collect();
        if indices.len() > candidates.len() {
            return Err(SlabError::NotEnoughHosts {
                have: candidates.len(),
                need: indices.len(),
            });
        }

        // download and regenerate every shard
        let slice = SlabSlice::full(slab.clone());
        let mut downloads = self
            .pool
            .download_shards(&slice, contracts)
            .await
            .map_err(SlabError::migration(MigrationStep::Download))?;
        slice.decrypt(&mut downloads.shards);
        slab.reconstruct(&mut downloads.shards)
            .map_err(|e| SlabError::migration(MigrationStep::Reconstruct)(e.into()))?;

        let mut shards: Vec<Vec<u8>> = downloads
            .shards
            .into_iter()
            .collect::<Option<_>>()
            .ok_or_else(|| {
                SlabError::migration(MigrationStep::Reconstruct)(
                    TesseraError::InsufficientShards {
                        available: 0,
                        required: min_shards,
                    }
                    .into(),
                )
            })?;
        slab.encrypt(&mut shards);
        let shards: Vec<Vec<u8>> = indices
            .iter()
            .map(|&i| std::mem::take(&mut shards[i]))
            .collect();

        // spread migrations out, slow hosts last
        candidates.shuffle(&mut rand::thread_rng());
        let mut slow: HashMap<HostKey, usize> = HashMap::new();
        for &i in &downloads.slow_hosts {
            *slow.entry(contracts[i].host_key).or_default() += 1;
        }
        candidates.sort_by_key(|c| slow.get(&c.host_key).copied().unwrap_or(0));

        let uploads = self
            .pool
            .upload_shards(shards, &candidates)
            .await
            .map_err(SlabError::migration(MigrationStep::Upload))?;

        for (&i, sector) in indices.iter().zip(uploads.sectors) {
            slab.shards[i] = sector;
        }

        counter!(names::SLAB_MIGRATIONS).increment(1);
        counter!(names::SHARDS_MIGRATED).increment(indices.len() as u64);
        info!(migrated = ?indices, "migrated slab");
        Ok(indices)
    }

    /// Delete every sector of `slabs` with one batch call per host that
    /// owns any of them.
    ///
    /// Deletion is best effort: a failing host does not stop the others.
    /// A host owning sectors without a session in `sessions` is reported
    /// with [`ShardError::NoSession`].
    #[instrument(skip_all, fields(slabs = slabs.len(), hosts = sessions.len()))]
    pub async fn delete_slabs(
        &self,
        slabs: &[Slab],
        sessions: &[Box<dyn SectorStore>],
    ) -> Result<(), HostErrorSet> {
        let mut roots: HashMap<HostKey, Vec<SectorRoot>> = HashMap::new();
        for sector in slabs.iter().flat_map(|s| &s.shards) {
            roots.entry(sector.host).or_default().push(sector.root);
        }

        let calls = sessions.iter().filter_map(|session| {
            let host_roots = roots.get(&session.host_key())?;
            Some(async move {
                let result = session.delete_sectors(host_roots).await;
                (session, host_roots.len(), result)
            })
        });

        let mut errors = HostErrorSet::new();
        let covered: HashSet<HostKey> = sessions.iter().map(|s| s.host_key()).collect();
        let mut orphaned: Vec<HostKey> = roots
            .keys()
            .filter(|host| !covered.contains(host))
            .copied()
            .collect();
        orphaned.sort_unstable();
        for host in orphaned {
            warn!(%host, sectors = roots[&host].len(), "no session to delete sectors");
            errors.push(host, ShardError::NoSession);
        }

        for (session, count, result) in join_all(calls).await {
            match result {
                Ok(()) => {
                    counter!(names::SECTORS_DELETED).increment(count as u64);
                    if let Some(recorder) = self.pool.spending() {
                        recorder.record(session.contract(), ContractSpending::deletion(count as u64));
                    }
                }
                Err(e) => {
                    warn!(host = %session.host_key(), error = %e, "failed to delete sectors");
                    errors.push(session.host_key(), ShardError::Session(e));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Slices covering the `length` bytes starting at `offset` of the object
/// made up of `slices`, with the first and last one trimmed to the span.
///
/// Zero-length slices are skipped. The input is not modified.
pub fn slabs_for_download(slices: &[SlabSlice], offset: u64, length: u64) -> Vec<SlabSlice> {
    let end = offset.saturating_add(length);
    let mut out = Vec::new();
    let mut start = 0u64;

    for slice in slices {
        let slice_start = start;
        let slice_end = start + slice.length as u64;
        start = slice_end;

        if slice.length == 0 || slice_end <= offset {
            continue;
        }
        if slice_start >= end {
            break;
        }

        let from = offset.max(slice_start) - slice_start;
        let to = end.min(slice_end) - slice_start;
        let mut trimmed = slice.clone();
        trimmed.offset += from as u32;
        trimmed.length = (to - from) as u32;
        out.push(trimmed);
    }
    out
}
