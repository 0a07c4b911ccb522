//! Slab worker errors
//!
//! Per-host failures are collected into a [`HostErrorSet`]; they only fail a
//! slab operation when too few hosts succeed.

use crate::locker::LockError;
use std::fmt;
use tessera_core::{HostKey, TesseraError};
use tessera_host::SessionError;
use thiserror::Error;

/// Failure of a single shard operation against one host
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("upload sector timed out")]
    UploadTimeout,

    #[error("download sector timed out")]
    DownloadTimeout,

    #[error("host not used")]
    UnusedHost,

    #[error("no session for host")]
    NoSession,

    #[error("failed to acquire contract: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("shard operation cancelled")]
    Cancelled,

    #[error("shard task failed: {0}")]
    Task(String),
}

impl ShardError {
    /// Whether the error marks a slow host rather than a failed one
    pub fn is_timeout(&self) -> bool {
        matches!(self, ShardError::UploadTimeout | ShardError::DownloadTimeout)
    }
}

/// A shard failure attributed to a host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub host: HostKey,
    pub error: ShardError,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.host, self.error)
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Unordered collection of host failures from one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostErrorSet(Vec<HostError>);

impl HostErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, host: HostKey, error: ShardError) {
        self.0.push(HostError { host, error });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostError> {
        self.0.iter()
    }

    /// Hosts that reported an error, in arrival order
    pub fn hosts(&self) -> Vec<HostKey> {
        self.0.iter().map(|e| e.host).collect()
    }

    /// Hosts that timed out
    pub fn timeouts(&self) -> Vec<HostKey> {
        self.0
            .iter()
            .filter(|e| e.error.is_timeout())
            .map(|e| e.host)
            .collect()
    }
}

impl fmt::Display for HostErrorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} host(s) failed", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for HostErrorSet {}

impl IntoIterator for HostErrorSet {
    type Item = HostError;
    type IntoIter = std::vec::IntoIter<HostError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Migration stage a failure happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    Download,
    Reconstruct,
    Upload,
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            MigrationStep::Download => "download",
            MigrationStep::Reconstruct => "reconstruct",
            MigrationStep::Upload => "upload",
        };
        f.write_str(step)
    }
}

/// Slab-level failures
#[derive(Error, Debug)]
pub enum SlabError {
    #[error("not enough hosts: have {have}, need {need}")]
    NotEnoughHosts { have: usize, need: usize },

    #[error("not enough healthy shards to recover slab: have {have}, need {need}")]
    NotEnoughShards { have: usize, need: usize },

    #[error(transparent)]
    Hosts(#[from] HostErrorSet),

    #[error("codec error: {0}")]
    Codec(#[from] TesseraError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration failed to {step} slab: {source}")]
    Migration {
        step: MigrationStep,
        #[source]
        source: Box<SlabError>,
    },
}

impl SlabError {
    /// Wrap an error with the migration step it happened in
    pub fn migration(step: MigrationStep) -> impl FnOnce(SlabError) -> SlabError {
        move |source| SlabError::Migration {
            step,
            source: Box::new(source),
        }
    }

    /// Host failures behind this error, if any
    pub fn host_errors(&self) -> Option<&HostErrorSet> {
        match self {
            SlabError::Hosts(set) => Some(set),
            SlabError::Migration { source, .. } => source.host_errors(),
            _ => None,
        }
    }
}
