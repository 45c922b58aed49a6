use dray_store::DEFAULT_BLOCK_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Default number of concurrent transfer workers.
pub const DEFAULT_PARALLELISM: usize = 25;

/// Engine tuning, built once at startup and passed to constructors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on transfers in flight.
    pub parallelism: usize,
    /// Block size for staged uploads, in bytes.
    pub block_size: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl SyncConfig {
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.parallelism == 0 {
            return Err(SyncError::Config("parallelism must be at least 1".into()));
        }
        if self.block_size == 0 || self.block_size > DEFAULT_BLOCK_SIZE {
            return Err(SyncError::Config(format!(
                "block size must be between 1 and {DEFAULT_BLOCK_SIZE} bytes, got {}",
                self.block_size
            )));
        }
        Ok(())
    }
}
