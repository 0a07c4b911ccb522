//! Contract locking
//!
//! Every shard operation holds its contract's lock for the duration of the
//! sector operation, which serializes revisions of the same contract.
//! Downloads are latency sensitive and take priority over uploads.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tessera_core::ContractId;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lock priority used by uploads
pub const UPLOAD_PRIORITY: u8 = 1;

/// Lock priority used by downloads
pub const DOWNLOAD_PRIORITY: u8 = 2;

/// Token proving ownership of a contract lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockId(u64);

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock-{}", self.0)
    }
}

/// Locking errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for contract {contract}")]
    Timeout { contract: ContractId, waited: Duration },

    #[error("locker unavailable: {0}")]
    Unavailable(String),
}

/// Mutual exclusion keyed by contract
#[async_trait]
pub trait ContractLocker: Send + Sync {
    /// Acquire the lock on `contract`, waiting at most `max_wait`
    async fn acquire(
        &self,
        contract: ContractId,
        priority: u8,
        max_wait: Duration,
    ) -> Result<LockId, LockError>;

    /// Release a lock obtained from [`ContractLocker::acquire`]
    async fn release(&self, contract: ContractId, lock: LockId);
}

/// Lock counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockerStats {
    pub acquired: u64,
    pub released: u64,
    pub timeouts: u64,
    pub stale_releases: u64,
}

impl LockerStats {
    /// Locks currently held
    pub fn held(&self) -> u64 {
        self.acquired.saturating_sub(self.released)
    }
}

#[derive(Default)]
struct ContractState {
    holder: Option<LockId>,
    /// Number of queued waiters per priority
    waiting: BTreeMap<u8, usize>,
}

impl ContractState {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiting.is_empty()
    }

    fn outranked(&self, priority: u8) -> bool {
        self.waiting
            .range((Bound::Excluded(priority), Bound::Unbounded))
            .next()
            .is_some()
    }
}

/// In-process priority locker
///
/// One holder per contract. A free lock goes to a waiter only when no
/// waiter with a higher priority is queued on the same contract.
#[derive(Default)]
pub struct MemoryLocker {
    contracts: Mutex<HashMap<ContractId, ContractState>>,
    changed: Notify,
    next_id: AtomicU64,

    acquired: AtomicU64,
    released: AtomicU64,
    timeouts: AtomicU64,
    stale_releases: AtomicU64,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `contract` is currently locked
    pub fn is_locked(&self, contract: &ContractId) -> bool {
        self.contracts
            .lock()
            .get(contract)
            .is_some_and(|state| state.holder.is_some())
    }

    /// Snapshot of the lock counters
    pub fn stats(&self) -> LockerStats {
        LockerStats {
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
            stale_releases: self.stale_releases.load(Ordering::SeqCst),
        }
    }

    fn try_take(&self, contract: ContractId, priority: u8) -> Option<LockId> {
        let mut contracts = self.contracts.lock();
        let state = contracts.entry(contract).or_default();
        if state.holder.is_some() || state.outranked(priority) {
            return None;
        }

        let id = LockId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.holder = Some(id);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Some(id)
    }
}

/// Registers a queued waiter for as long as it is alive
struct WaiterGuard<'a> {
    locker: &'a MemoryLocker,
    contract: ContractId,
    priority: u8,
}

impl<'a> WaiterGuard<'a> {
    fn new(locker: &'a MemoryLocker, contract: ContractId, priority: u8) -> Self {
        *locker
            .contracts
            .lock()
            .entry(contract)
            .or_default()
            .waiting
            .entry(priority)
            .or_default() += 1;
        Self {
            locker,
            contract,
            priority,
        }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        {
            let mut contracts = self.locker.contracts.lock();
            if let Some(state) = contracts.get_mut(&self.contract) {
                if let Some(count) = state.waiting.get_mut(&self.priority) {
                    *count -= 1;
                    if *count == 0 {
                        state.waiting.remove(&self.priority);
                    }
                }
                if state.is_idle() {
                    contracts.remove(&self.contract);
                }
            }
        }
        // lower priority waiters may now be allowed to take the lock
        self.locker.changed.notify_waiters();
    }
}

#[async_trait]
impl ContractLocker for MemoryLocker {
    async fn acquire(
        &self,
        contract: ContractId,
        priority: u8,
        max_wait: Duration,
    ) -> Result<LockId, LockError> {
        let started = Instant::now();
        let deadline = started + max_wait;

        // fast path, nobody queued
        if let Some(id) = self.try_take(contract, priority) {
            return Ok(id);
        }

        let waiter = WaiterGuard::new(self, contract, priority);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = self.try_take(contract, priority) {
                drop(waiter);
                debug!(%contract, lock = %id, waited = ?started.elapsed(), "acquired contract");
                return Ok(id);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.timeouts.fetch_add(1, Ordering::SeqCst);
                return Err(LockError::Timeout {
                    contract,
                    waited: started.elapsed(),
                });
            }
        }
    }

    async fn release(&self, contract: ContractId, lock: LockId) {
        {
            let mut contracts = self.contracts.lock();
            match contracts.get_mut(&contract) {
                Some(state) if state.holder == Some(lock) => {
                    state.holder = None;
                    if state.is_idle() {
                        contracts.remove(&contract);
                    }
                }
                _ => {
                    self.stale_releases.fetch_add(1, Ordering::SeqCst);
                    warn!(%contract, %lock, "ignoring release of a lock that is not held");
                    return;
                }
            }
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}
