use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{StoreError, StoreResult};

/// Default number of shard stores.
pub const DEFAULT_SHARD_COUNT: u32 = 8;

/// Default LMDB map size per shard (1 GiB of address space; the file only
/// grows with data).
pub const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

/// Threshold above which a guarded write path logs its cost.
pub const SLOW_WRITE_THRESHOLD_MS: u64 = 500;

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Directory holding one subdirectory per shard.
    pub data_dir: PathBuf,
    /// Number of shard stores; fixed for the lifetime of the data
    /// directory (shard selection is `hash(uid) % shard_count`).
    pub shard_count: u32,
    /// LMDB map size per shard in bytes.
    pub map_size: usize,
    /// Log writes that exceed [`SLOW_WRITE_THRESHOLD_MS`].
    pub enable_cost: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("quill-data"),
            shard_count: DEFAULT_SHARD_COUNT,
            map_size: DEFAULT_MAP_SIZE,
            enable_cost: false,
        }
    }
}

impl StoreOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> StoreResult<()> {
        if self.shard_count == 0 {
            return Err(StoreError::invalid_config("shard_count must be >= 1"));
        }
        if self.map_size == 0 {
            return Err(StoreError::invalid_config("map_size must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        assert!(StoreOptions::default().validate().is_ok());
    }

    #[test]
    fn zero_shards_rejected() {
        let opts = StoreOptions {
            shard_count: 0,
            ..StoreOptions::default()
        };
        assert!(opts.validate().is_err());
    }
}
