//! Contract spending
//!
//! Successful sector operations are recorded per contract and flushed to a
//! [`SpendingSink`] in batches. The first record after a flush schedules the
//! next flush `flush_interval` later; records arriving meanwhile are merged
//! into the same batch. Flushes never overlap.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::ContractId;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Usage attributed to a contract
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpending {
    /// Bytes uploaded
    pub uploads: u64,
    /// Bytes downloaded
    pub downloads: u64,
    /// Sectors deleted
    pub deletions: u64,
}

impl ContractSpending {
    pub fn upload(bytes: u64) -> Self {
        Self {
            uploads: bytes,
            ..Default::default()
        }
    }

    pub fn download(bytes: u64) -> Self {
        Self {
            downloads: bytes,
            ..Default::default()
        }
    }

    pub fn deletion(sectors: u64) -> Self {
        Self {
            deletions: sectors,
            ..Default::default()
        }
    }
}

impl Add for ContractSpending {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            uploads: self.uploads + other.uploads,
            downloads: self.downloads + other.downloads,
            deletions: self.deletions + other.deletions,
        }
    }
}

impl AddAssign for ContractSpending {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Spending of one contract as sent to the sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSpendingRecord {
    pub contract_id: ContractId,
    pub spending: ContractSpending,
}

/// Spending sink errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpendingError {
    #[error("failed to record contract spending: {0}")]
    Sink(String),
}

/// Destination for flushed spending records
#[async_trait]
pub trait SpendingSink: Send + Sync {
    async fn record_contract_spending(
        &self,
        records: Vec<ContractSpendingRecord>,
    ) -> Result<(), SpendingError>;
}

#[derive(Default)]
struct RecorderState {
    buffer: HashMap<ContractId, ContractSpending>,
    flush_task: Option<JoinHandle<()>>,
}

struct RecorderInner {
    sink: Arc<dyn SpendingSink>,
    flush_interval: Duration,
    state: Mutex<RecorderState>,
    /// Held for the duration of a sink call
    flushing: tokio::sync::Mutex<()>,
}

impl RecorderInner {
    async fn flush(&self) -> Result<(), SpendingError> {
        let _flushing = self.flushing.lock().await;
        let records: Vec<ContractSpendingRecord> = {
            let mut state = self.state.lock();
            state
                .buffer
                .drain()
                .map(|(contract_id, spending)| ContractSpendingRecord {
                    contract_id,
                    spending,
                })
                .collect()
        };
        if records.is_empty() {
            return Ok(());
        }

        let count = records.len();
        match self.sink.record_contract_spending(records.clone()).await {
            Ok(()) => {
                debug!(contracts = count, "flushed contract spending");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, contracts = count, "failed to record contract spending");
                // keep the records for the next flush
                let mut state = self.state.lock();
                for record in records {
                    *state.buffer.entry(record.contract_id).or_default() += record.spending;
                }
                Err(e)
            }
        }
    }
}

/// Buffers contract spending and flushes it periodically
///
/// `record` must be called from within a tokio runtime.
#[derive(Clone)]
pub struct ContractSpendingRecorder {
    inner: Arc<RecorderInner>,
}

impl ContractSpendingRecorder {
    pub fn new(sink: Arc<dyn SpendingSink>, flush_interval: Duration) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                sink,
                flush_interval,
                state: Mutex::new(RecorderState::default()),
                flushing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Add spending to the buffer, scheduling a flush if none is pending
    pub fn record(&self, contract: ContractId, spending: ContractSpending) {
        let mut state = self.inner.state.lock();
        *state.buffer.entry(contract).or_default() += spending;

        if state.flush_task.is_some() {
            return;
        }
        let inner = self.inner.clone();
        state.flush_task = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.flush_interval).await;
            // from here on the flush is no longer abortable
            inner.state.lock().flush_task = None;
            let _ = inner.flush().await;
        }));
    }

    /// Buffered, not yet flushed spending
    pub fn pending(&self) -> HashMap<ContractId, ContractSpending> {
        self.inner.state.lock().buffer.clone()
    }

    /// Cancel the scheduled flush and flush immediately. Waits for a flush
    /// that is already running to finish first.
    pub async fn stop(&self) -> Result<(), SpendingError> {
        let task = self.inner.state.lock().flush_task.take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.flush().await
    }
}
