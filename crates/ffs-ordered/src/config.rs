//! Tracker configuration.

use ffs_error::{FfsError, Result};
use ffs_types::DEFAULT_SECTOR_SIZE;
use serde::{Deserialize, Serialize};

/// Configuration for an [`OrderedTracker`](crate::OrderedTracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderedConfig {
    /// Maximum number of in-flight ordered extents per inode.
    /// Inserting past this limit fails with `FfsError::NoSpace`.
    /// Default: 1_048_576.
    pub max_extents: usize,
    /// Checksum granularity in bytes; must be a power of two in 512..=65536.
    /// Default: 4096.
    pub sector_size: u32,
}

impl Default for OrderedConfig {
    fn default() -> Self {
        Self {
            max_extents: 1 << 20,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

impl OrderedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_extents == 0 {
            return Err(FfsError::InvalidConfig("max_extents must be > 0".to_owned()));
        }
        if !self.sector_size.is_power_of_two() || !(512..=65536).contains(&self.sector_size) {
            return Err(FfsError::InvalidConfig(format!(
                "sector_size={} (must be power of two in 512..=65536)",
                self.sector_size
            )));
        }
        Ok(())
    }
}
