//! Configuration for PMKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{PmkvError, Result};
use crate::pool::{DEFAULT_LANE_COUNT, DEFAULT_MODE};

/// Main configuration for a PMKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Pool Configuration
    // -------------------------------------------------------------------------
    /// Path of the pool file. The file is the entire durable state:
    ///   {path}
    ///     ├── header page   (layout schema, geometry, root)
    ///     ├── lanes         (one undo log per in-flight transaction)
    ///     └── heap          (root object, bucket array, entries)
    pub path: PathBuf,

    /// Size of the pool file in bytes (fixed at creation)
    pub pool_size: u64,

    /// Discard any existing pool at `path` and create a fresh one
    pub force_create: bool,

    /// Unix permission bits for a newly created pool file
    pub mode: u32,

    /// How far a durability barrier pushes written bytes
    pub durability: Durability,

    // -------------------------------------------------------------------------
    // Transaction Configuration
    // -------------------------------------------------------------------------
    /// Number of undo-log lanes, i.e. max concurrent transactions
    pub lane_count: u32,

    // -------------------------------------------------------------------------
    // Key-Value Configuration
    // -------------------------------------------------------------------------
    /// Number of hash buckets (fixed when the pool is first created)
    pub bucket_count: u64,

    /// Max accepted value size in bytes
    pub max_value_len: usize,
}

/// Durability barrier strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// msync the touched pages on every barrier (survives power loss)
    Flush,

    /// Memory fence only; the shared mapping outlives the process, so this
    /// survives process death but not power loss
    Process,
}

/// Default max value size (1 MiB)
pub const DEFAULT_MAX_VALUE_LEN: usize = 1024 * 1024;

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./pmkv.pool"),
            pool_size: 64 * 1024 * 1024, // 64 MB
            force_create: false,
            mode: DEFAULT_MODE,
            durability: Durability::Flush,
            lane_count: DEFAULT_LANE_COUNT,
            bucket_count: 1024,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings no pool can be opened with
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(PmkvError::Config("pool path is empty".to_string()));
        }
        if self.lane_count == 0 {
            return Err(PmkvError::Config("lane_count must be at least 1".to_string()));
        }
        if self.bucket_count == 0 {
            return Err(PmkvError::Config("bucket_count must be at least 1".to_string()));
        }
        if self.max_value_len > u32::MAX as usize {
            return Err(PmkvError::Config(format!(
                "max_value_len {} exceeds the entry format",
                self.max_value_len
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the pool file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the pool size (in bytes)
    pub fn pool_size(mut self, size: u64) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Recreate the pool even if one exists
    pub fn force_create(mut self, force: bool) -> Self {
        self.config.force_create = force;
        self
    }

    /// Set the file mode for a new pool
    pub fn mode(mut self, mode: u32) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the durability strategy
    pub fn durability(mut self, durability: Durability) -> Self {
        self.config.durability = durability;
        self
    }

    /// Set the number of transaction lanes
    pub fn lane_count(mut self, count: u32) -> Self {
        self.config.lane_count = count;
        self
    }

    /// Set the number of hash buckets
    pub fn bucket_count(mut self, count: u64) -> Self {
        self.config.bucket_count = count;
        self
    }

    /// Set the maximum value size (in bytes)
    pub fn max_value_len(mut self, len: usize) -> Self {
        self.config.max_value_len = len;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
