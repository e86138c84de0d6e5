//! Engine Module
//!
//! The key-value store that coordinates all components.
//!
//! ## Responsibilities
//! - Create or open the pool (running crash recovery)
//! - Attach the hash table rooted in the pool
//! - Enforce value limits and route commands
//! - Report every outcome as a [`Status`](crate::protocol::Status)

use std::path::Path;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{PmkvError, Result};
use crate::kv::{self, HashTable};
use crate::pool::{CheckStatus, Pool, PoolOptions};
use crate::protocol::{Command, Response};
use crate::recovery::RecoveryResult;

/// The main key-value engine
///
/// ## Concurrency Model: per-bucket Readers/Writer
///
/// - **Writes** (put/delete): hold the key's bucket write lock for the whole
///   transaction; writes to different buckets run in parallel
/// - **Reads** (get/exists): hold the key's bucket read lock
/// - **count**: takes each bucket's read lock in turn
///
/// `Engine` is `Send + Sync`; share it across threads by reference or `Arc`.
pub struct Engine {
    /// Engine configuration
    config: Config,

    /// Hash table over the pool (owns the pool handle)
    table: HashTable,
}

impl Engine {
    /// Open or create an engine with the given config
    ///
    /// On startup:
    /// 0. Validate the config
    /// 1. Open the pool (recovering it) or create a new one, discarding the
    ///    old pool first if `force_create` is set
    /// 2. Attach or build the hash table
    /// 3. Ready to serve requests
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let options = Self::pool_options(&config);
        let path = config.path.as_path();

        // Step 1: Pool
        let pool = Pool::open_or_create(
            path,
            config.pool_size,
            config.mode,
            config.force_create,
            &options,
        )?;

        // Step 2: Table
        let table = HashTable::open(pool, config.bucket_count)?;
        debug!(
            path = %path.display(),
            buckets = table.bucket_count(),
            "engine ready"
        );

        Ok(Self { config, table })
    }

    /// Open the pool at `path`, creating it with `size` bytes if absent
    ///
    /// Everything else comes from [`Config::default`].
    pub fn open_or_create(path: impl AsRef<Path>, size: u64, force_create: bool) -> Result<Self> {
        let config = Config::builder()
            .path(path.as_ref())
            .pool_size(size)
            .force_create(force_create)
            .build();
        Self::open(config)
    }

    /// Audit a key-value pool file without opening it
    pub fn check(path: impl AsRef<Path>) -> CheckStatus {
        Pool::check(path, &PoolOptions::new(kv::schema()))
    }

    fn pool_options(config: &Config) -> PoolOptions {
        PoolOptions::new(kv::schema())
            .lane_count(config.lane_count)
            .durability(config.durability)
    }

    /// Execute a command
    ///
    /// Routes commands to appropriate handlers; errors become status codes
    pub fn execute(&self, command: Command) -> Response {
        let result = match command {
            Command::Get { key } => self.get(&key).map(|value| match value {
                Some(value) => Response::ok(Some(value)),
                None => Response::not_found(),
            }),
            Command::Put { key, value } => self.put(&key, &value).map(|()| Response::ok(None)),
            Command::Delete { key } => self.delete(&key).map(|deleted| {
                if deleted {
                    Response::ok(None)
                } else {
                    Response::not_found()
                }
            }),
            Command::Exists { key } => self.exists(&key).map(|present| {
                if present {
                    Response::ok(None)
                } else {
                    Response::not_found()
                }
            }),
            Command::Count => self.count().map(Response::count),
        };

        result.unwrap_or_else(|e| Response::error(&e))
    }

    /// Get a value by key
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        trace!(key_len = key.len(), "get");
        Ok(self.table.get(key)?.map(Bytes::from))
    }

    /// Put a key-value pair
    ///
    /// The put is durable when this returns. Any failure leaves the store as
    /// it was.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if value.len() > self.config.max_value_len {
            return Err(PmkvError::ValueTooLarge {
                len: value.len(),
                max: self.config.max_value_len,
            });
        }

        trace!(key_len = key.len(), value_len = value.len(), "put");
        self.table.put(key, value)
    }

    /// Delete a key
    ///
    /// Returns `false` without side effects if the key is absent
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        trace!(key_len = key.len(), "delete");
        self.table.delete(key)
    }

    /// Whether a key is present (no value copy)
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.table.exists(key)
    }

    /// Number of keys in the store
    pub fn count(&self) -> Result<u64> {
        self.table.count()
    }

    /// Close the engine gracefully
    ///
    /// Flushes the whole pool to disk
    pub fn close(self) -> Result<()> {
        self.table.pool().clone().close()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the pool file path
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &Pool {
        self.table.pool()
    }

    /// Get what recovery did when the pool was opened
    pub fn recovery(&self) -> &RecoveryResult {
        self.table.pool().recovery()
    }

    /// Get the number of hash buckets
    pub fn bucket_count(&self) -> u64 {
        self.table.bucket_count()
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }
}
