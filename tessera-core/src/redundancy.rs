//! Redundancy settings
//!
//! A slab is coded `min_shards`-of-`total_shards`: any `min_shards` shards
//! are enough to recover the slab, so up to `total_shards - min_shards`
//! hosts may be lost.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Default number of shards required to recover a slab
pub const DEFAULT_MIN_SHARDS: usize = 10;

/// Default total number of shards per slab
pub const DEFAULT_TOTAL_SHARDS: usize = 30;

/// Shard counts that dictate a slab's redundancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedundancySettings {
    pub min_shards: usize,
    pub total_shards: usize,
}

impl Default for RedundancySettings {
    fn default() -> Self {
        Self {
            min_shards: DEFAULT_MIN_SHARDS,
            total_shards: DEFAULT_TOTAL_SHARDS,
        }
    }
}

impl RedundancySettings {
    /// Create validated settings
    pub fn new(min_shards: usize, total_shards: usize) -> Result<Self> {
        let settings = Self {
            min_shards,
            total_shards,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Effective storage redundancy (total / min)
    pub fn redundancy(&self) -> f64 {
        self.total_shards as f64 / self.min_shards as f64
    }

    /// Number of parity shards, i.e. how many host losses a slab survives
    pub fn parity_shards(&self) -> usize {
        self.total_shards.saturating_sub(self.min_shards)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_shards < 1 {
            return Err(TesseraError::InvalidRedundancy(
                "min_shards must be greater than 0".to_string(),
            ));
        }
        if self.total_shards < self.min_shards {
            return Err(TesseraError::InvalidRedundancy(
                "total_shards must be at least min_shards".to_string(),
            ));
        }
        if self.total_shards > 255 {
            return Err(TesseraError::InvalidRedundancy(
                "total_shards must be less than 256".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let rs = RedundancySettings::default();
        assert_eq!(rs.min_shards, 10);
        assert_eq!(rs.total_shards, 30);
        assert_eq!(rs.parity_shards(), 20);
        assert!((rs.redundancy() - 3.0).abs() < f64::EPSILON);
        assert!(rs.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_counts() {
        assert!(RedundancySettings::new(0, 3).is_err());
        assert!(RedundancySettings::new(4, 3).is_err());
        assert!(RedundancySettings::new(10, 256).is_err());
        assert!(RedundancySettings::new(1, 1).is_ok());
        assert!(RedundancySettings::new(10, 255).is_ok());
    }
}
