//! Worker configuration
//!
//! Configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;
use tessera_core::RedundancySettings;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Slab worker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Per-sector upload timeout after which a host is marked slow
    /// (`None` disables it)
    pub upload_sector_timeout: Option<Duration>,

    /// Per-sector download timeout after which a host is marked slow
    /// (`None` disables it)
    pub download_sector_timeout: Option<Duration>,

    /// Maximum time to wait for a contract lock
    pub lock_timeout: Duration,

    /// Maximum sector operations running at once across all batches
    pub max_concurrent_sectors: usize,

    /// Delay between the first buffered spending record and its flush
    pub spending_flush_interval: Duration,

    /// Default redundancy for uploaded slabs
    pub redundancy: RedundancySettings,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            upload_sector_timeout: Some(Duration::from_secs(5)),
            download_sector_timeout: Some(Duration::from_secs(3)),
            lock_timeout: Duration::from_secs(30),
            max_concurrent_sectors: 64,
            spending_flush_interval: Duration::from_secs(5),
            redundancy: RedundancySettings::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    /// Unset variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let upload_sector_timeout = match parse::<u64, _>(&lookup, "TESSERA_UPLOAD_SECTOR_TIMEOUT_MS")? {
            Some(ms) => optional_millis(ms),
            None => defaults.upload_sector_timeout,
        };

        let download_sector_timeout =
            match parse::<u64, _>(&lookup, "TESSERA_DOWNLOAD_SECTOR_TIMEOUT_MS")? {
                Some(ms) => optional_millis(ms),
                None => defaults.download_sector_timeout,
            };

        let lock_timeout = parse(&lookup, "TESSERA_LOCK_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.lock_timeout);

        let max_concurrent_sectors = parse(&lookup, "TESSERA_MAX_CONCURRENT_SECTORS")?
            .unwrap_or(defaults.max_concurrent_sectors);
        if max_concurrent_sectors == 0 {
            return Err(ConfigError::InvalidValue(
                "TESSERA_MAX_CONCURRENT_SECTORS".to_string(),
                "must be greater than 0".to_string(),
            ));
        }

        let spending_flush_interval = parse(&lookup, "TESSERA_SPENDING_FLUSH_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.spending_flush_interval);

        let redundancy = RedundancySettings {
            min_shards: parse(&lookup, "TESSERA_MIN_SHARDS")?
                .unwrap_or(defaults.redundancy.min_shards),
            total_shards: parse(&lookup, "TESSERA_TOTAL_SHARDS")?
                .unwrap_or(defaults.redundancy.total_shards),
        };
        redundancy.validate().map_err(|e| {
            ConfigError::InvalidValue("TESSERA_MIN_SHARDS/TESSERA_TOTAL_SHARDS".to_string(), e.to_string())
        })?;

        Ok(Self {
            upload_sector_timeout,
            download_sector_timeout,
            lock_timeout,
            max_concurrent_sectors,
            spending_flush_interval,
            redundancy,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue(key.to_string(), format!("{raw:?}: {e}")))
        })
        .transpose()
}

fn optional_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
