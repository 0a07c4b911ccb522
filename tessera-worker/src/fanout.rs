//! Shard fan-out pool
//!
//! Runs one task per shard request. Each task:
//! - waits for a pool permit, which caps sector operations across batches
//! - acquires the contract lock
//! - opens a session and performs exactly one sector operation
//! - releases the lock and publishes its result
//!
//! A request that exceeds the sector timeout publishes a synthetic timeout
//! result, marking the host slow, and keeps running; its real result is
//! published when it completes. Timeout results trigger a retry on the next
//! candidate host but do not free an inflight slot. The first successful
//! result per shard wins and later duplicates are dropped.
//!
//! When a batch finishes, requests that are still running are cancelled.

use crate::error::{HostErrorSet, ShardError, SlabError};
use crate::locker::{ContractLocker, DOWNLOAD_PRIORITY, UPLOAD_PRIORITY};
use crate::metrics;
use crate::spending::{ContractSpending, ContractSpendingRecorder};
use crate::WorkerConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{ContractMetadata, Sector, SectorRoot, SlabSlice};
use tessera_host::{SectorStore, SessionResult, StoreProvider};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info_span, warn, Instrument, Span};

/// A sector operation performed by one shard request
#[async_trait]
trait SectorOp: Send + Sync + 'static {
    type Output: Send + 'static;

    const NAME: &'static str;
    const PRIORITY: u8;

    fn timeout_error(&self) -> ShardError;

    async fn perform(&self, session: &dyn SectorStore, shard: usize) -> SessionResult<Self::Output>;

    fn spending(&self, output: &Self::Output) -> ContractSpending;
}

struct UploadOp {
    shards: Vec<Vec<u8>>,
}

#[async_trait]
impl SectorOp for UploadOp {
    type Output = SectorRoot;

    const NAME: &'static str = "upload";
    const PRIORITY: u8 = UPLOAD_PRIORITY;

    fn timeout_error(&self) -> ShardError {
        ShardError::UploadTimeout
    }

    async fn perform(&self, session: &dyn SectorStore, shard: usize) -> SessionResult<SectorRoot> {
        session.upload_sector(&self.shards[shard]).await
    }

    fn spending(&self, _: &SectorRoot) -> ContractSpending {
        ContractSpending::upload(tessera_core::SECTOR_SIZE as u64)
    }
}

struct DownloadOp {
    roots: Vec<SectorRoot>,
    offset: u32,
    length: u32,
}

#[async_trait]
impl SectorOp for DownloadOp {
    type Output = Vec<u8>;

    const NAME: &'static str = "download";
    const PRIORITY: u8 = DOWNLOAD_PRIORITY;

    fn timeout_error(&self) -> ShardError {
        ShardError::DownloadTimeout
    }

    async fn perform(&self, session: &dyn SectorStore, shard: usize) -> SessionResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length as usize);
        session
            .download_sector(&mut buf, self.roots[shard], self.offset, self.length)
            .await?;
        Ok(buf)
    }

    fn spending(&self, output: &Vec<u8>) -> ContractSpending {
        ContractSpending::download(output.len() as u64)
    }
}

/// One attempt to serve a shard from a candidate host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShardRequest {
    /// Index into the candidate list
    host: usize,
    /// Shard slot served by the host, `None` if it holds none
    shard: Option<usize>,
}

struct ShardResponse<T> {
    req: ShardRequest,
    result: Result<T, ShardError>,
}

impl<T> ShardResponse<T> {
    fn finished(req: ShardRequest, joined: Result<Result<T, ShardError>, JoinError>) -> Self {
        let result = joined.unwrap_or_else(|e| Err(ShardError::Task(e.to_string())));
        Self { req, result }
    }
}

/// Successful shard results of one batch
struct Batch<T> {
    /// Per shard slot: winning candidate index and output
    slots: Vec<Option<(usize, T)>>,
    /// Candidate indices that timed out, sorted and de-duplicated
    slow_hosts: Vec<usize>,
}

/// Shards placed by [`ShardPool::upload_shards`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardUploads {
    /// One sector per input shard, in shard order
    pub sectors: Vec<Sector>,
    /// Indices into the candidate list of hosts that timed out
    pub slow_hosts: Vec<usize>,
}

/// Shards fetched by [`ShardPool::download_shards`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDownloads {
    /// Sector regions by shard index; at least `min_shards` are present
    pub shards: Vec<Option<Vec<u8>>>,
    /// Indices into the candidate list of hosts that timed out
    pub slow_hosts: Vec<usize>,
}

/// Bounded pool running shard requests against hosts
#[derive(Clone)]
pub struct ShardPool {
    provider: Arc<dyn StoreProvider>,
    locker: Arc<dyn ContractLocker>,
    permits: Arc<Semaphore>,
    lock_timeout: Duration,
    upload_timeout: Option<Duration>,
    download_timeout: Option<Duration>,
    spending: Option<ContractSpendingRecorder>,
}

impl ShardPool {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        locker: Arc<dyn ContractLocker>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            provider,
            locker,
            permits: Arc::new(Semaphore::new(config.max_concurrent_sectors.max(1))),
            lock_timeout: config.lock_timeout,
            upload_timeout: config.upload_sector_timeout,
            download_timeout: config.download_sector_timeout,
            spending: None,
        }
    }

    /// Record successful sector operations with `recorder`
    pub fn with_spending(mut self, recorder: ContractSpendingRecorder) -> Self {
        self.spending = Some(recorder);
        self
    }

    /// Number of sector operations that could start right now
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub(crate) fn spending(&self) -> Option<&ContractSpendingRecorder> {
        self.spending.as_ref()
    }

    /// Upload every shard, one per host, trying the next candidate when a
    /// host fails. Shard `i` is first tried on candidate `i`.
    pub async fn upload_shards(
        &self,
        shards: Vec<Vec<u8>>,
        contracts: &[ContractMetadata],
    ) -> Result<ShardUploads, SlabError> {
        let count = shards.len();
        if contracts.len() < count {
            return Err(SlabError::NotEnoughHosts {
                have: contracts.len(),
                need: count,
            });
        }

        let op = UploadOp { shards };
        let batch = self
            .run(op, contracts, count, count, self.upload_timeout, |host, failed| {
                failed.or(Some(host))
            })
            .await?;

        let sectors = batch
            .slots
            .into_iter()
            .flatten()
            .map(|(host, root)| Sector {
                host: contracts[host].host_key,
                root,
            })
            .collect();
        Ok(ShardUploads {
            sectors,
            slow_hosts: batch.slow_hosts,
        })
    }

    /// Download the slice's sector region from `min_shards` hosts.
    ///
    /// Each candidate serves the first shard of the slab it holds; a
    /// candidate holding none fails with [`ShardError::UnusedHost`].
    pub async fn download_shards(
        &self,
        slice: &SlabSlice,
        contracts: &[ContractMetadata],
    ) -> Result<ShardDownloads, SlabError> {
        let slab = &slice.slab;
        let min_shards = slab.min_shards as usize;
        if contracts.len() < min_shards {
            return Err(SlabError::NotEnoughHosts {
                have: contracts.len(),
                need: min_shards,
            });
        }
        if slab.shards.len() < min_shards {
            return Err(SlabError::NotEnoughShards {
                have: slab.shards.len(),
                need: min_shards,
            });
        }

        let shard_of: Vec<Option<usize>> = contracts
            .iter()
            .map(|c| slab.shards.iter().position(|s| s.host == c.host_key))
            .collect();
        let (offset, length) = slice.sector_region();
        let op = DownloadOp {
            roots: slab.shards.iter().map(|s| s.root).collect(),
            offset,
            length,
        };

        let batch = self
            .run(
                op,
                contracts,
                slab.shards.len(),
                min_shards,
                self.download_timeout,
                |host, _| shard_of[host],
            )
            .await?;

        Ok(ShardDownloads {
            shards: batch
                .slots
                .into_iter()
                .map(|slot| slot.map(|(_, data)| data))
                .collect(),
            slow_hosts: batch.slow_hosts,
        })
    }

    /// Fan requests out over `contracts` until `required` of `slots` shard
    /// slots are filled or the candidates run out.
    ///
    /// `assign(host, failed_shard)` picks the shard slot a candidate serves.
    async fn run<O, F>(
        &self,
        op: O,
        contracts: &[ContractMetadata],
        slots: usize,
        required: usize,
        timeout: Option<Duration>,
        assign: F,
    ) -> Result<Batch<O::Output>, HostErrorSet>
    where
        O: SectorOp,
        F: Fn(usize, Option<usize>) -> Option<usize>,
    {
        let mut filled: Vec<Option<(usize, O::Output)>> = (0..slots).map(|_| None).collect();
        if required == 0 {
            return Ok(Batch {
                slots: filled,
                slow_hosts: Vec::new(),
            });
        }

        let op = Arc::new(op);
        // every host can publish up to two results
        let (tx, mut rx) = mpsc::channel(2 * contracts.len().max(1));
        let batch = CancellationToken::new();
        let _cancel_stragglers = batch.clone().drop_guard();

        let spawn = |req: ShardRequest| {
            tokio::spawn(self.clone().drive(
                op.clone(),
                contracts[req.host].clone(),
                req,
                tx.clone(),
                batch.child_token(),
                timeout,
            ));
        };

        let mut next_host = 0;
        let mut inflight = 0;
        for _ in 0..required {
            spawn(ShardRequest {
                host: next_host,
                shard: assign(next_host, None),
            });
            next_host += 1;
            inflight += 1;
        }

        let mut errors = HostErrorSet::new();
        let mut slow_hosts = Vec::new();
        let mut remaining = required;
        while remaining > 0 && inflight > 0 {
            let Some(resp) = rx.recv().await else {
                break;
            };
            let host_key = contracts[resp.req.host].host_key;

            match resp.result {
                Err(err) => {
                    let slow = err.is_timeout();
                    if slow {
                        slow_hosts.push(resp.req.host);
                    } else {
                        inflight -= 1;
                    }
                    metrics::record_host_error(O::NAME, slow);
                    warn!(host = %host_key, shard = ?resp.req.shard, error = %err, "shard request failed");
                    errors.push(host_key, err);

                    // try the next host
                    if next_host < contracts.len() {
                        spawn(ShardRequest {
                            host: next_host,
                            shard: assign(next_host, resp.req.shard),
                        });
                        next_host += 1;
                        inflight += 1;
                    }
                }
                Ok(output) => {
                    inflight -= 1;
                    if let Some(shard) = resp.req.shard {
                        if filled[shard].is_none() {
                            debug!(host = %host_key, shard, "shard request succeeded");
                            filled[shard] = Some((resp.req.host, output));
                            remaining -= 1;
                        }
                    }
                }
            }
        }

        if remaining > 0 {
            return Err(errors);
        }

        slow_hosts.sort_unstable();
        slow_hosts.dedup();
        Ok(Batch {
            slots: filled,
            slow_hosts,
        })
    }

    /// Run one request, publishing a timeout result if it runs long
    async fn drive<O: SectorOp>(
        self,
        op: Arc<O>,
        contract: ContractMetadata,
        req: ShardRequest,
        tx: mpsc::Sender<ShardResponse<O::Output>>,
        cancel: CancellationToken,
        timeout: Option<Duration>,
    ) {
        let span = info_span!(
            "shard_request",
            op = O::NAME,
            host = %contract.host_key,
            contract = %contract.id,
            shard = ?req.shard,
            slow = field::Empty,
        );

        async move {
            let Some(shard) = req.shard else {
                let _ = tx
                    .send(ShardResponse {
                        req,
                        result: Err(ShardError::UnusedHost),
                    })
                    .await;
                return;
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = self.permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                let _ = tx
                    .send(ShardResponse {
                        req,
                        result: Err(ShardError::Cancelled),
                    })
                    .await;
                return;
            };

            let timeout_error = op.timeout_error();
            let mut work = tokio::spawn(
                self.execute(op, contract, shard, cancel)
                    .in_current_span(),
            );

            if let Some(timeout) = timeout {
                tokio::select! {
                    joined = &mut work => {
                        let _ = tx.send(ShardResponse::finished(req, joined)).await;
                        return;
                    }
                    _ = tokio::time::sleep(timeout) => {
                        Span::current().record("slow", true);
                        let _ = tx
                            .send(ShardResponse {
                                req,
                                result: Err(timeout_error),
                            })
                            .await;
                    }
                }
            }

            let joined = work.await;
            let _ = tx.send(ShardResponse::finished(req, joined)).await;
        }
        .instrument(span)
        .await
    }

    /// Lock the contract, perform the operation, release the lock
    async fn execute<O: SectorOp>(
        self,
        op: Arc<O>,
        contract: ContractMetadata,
        shard: usize,
        cancel: CancellationToken,
    ) -> Result<O::Output, ShardError> {
        let started = Instant::now();
        let lock = tokio::select! {
            _ = cancel.cancelled() => return Err(ShardError::Cancelled),
            lock = self.locker.acquire(contract.id, O::PRIORITY, self.lock_timeout) => lock?,
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ShardError::Cancelled),
            result = self.perform(op.as_ref(), &contract, shard) => result,
        };
        self.locker.release(contract.id, lock).await;

        let output = result?;
        metrics::record_sector(O::NAME, started.elapsed());
        if let Some(recorder) = &self.spending {
            recorder.record(contract.id, op.spending(&output));
        }
        Ok(output)
    }

    async fn perform<O: SectorOp>(
        &self,
        op: &O,
        contract: &ContractMetadata,
        shard: usize,
    ) -> Result<O::Output, ShardError> {
        // the session is torn down when dropped, on every path
        let session = self.provider.session(contract).await?;
        Ok(op.perform(session.as_ref(), shard).await?)
    }
}
