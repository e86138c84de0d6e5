//! # PMKV
//!
//! A crash-consistent persistent key-value store with:
//! - A single memory-mapped pool file holding all durable state
//! - Typed persistent objects with crash-atomic allocation
//! - Undo-logged transactions (begin / register / commit / abort)
//! - Recovery on open that rolls back interrupted transactions
//! - Per-bucket locking for concurrent multi-threaded access
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Engine  (Command → Response)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │               Hash Table (per-bucket RwLock)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ Transaction │ ───────► │  Allocator  │
//!   │ (undo lane) │          │   (heap)    │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌──────────────────────────────────────┐
//!   │     Pool (mmap file) + Recovery      │
//!   └──────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod pool;
pub mod alloc;
pub mod tx;
pub mod recovery;
pub mod kv;
pub mod protocol;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorClass, PmkvError, Result};
pub use config::{Config, Durability};
pub use engine::Engine;
pub use pool::{CheckStatus, Pool, PoolOptions};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of PMKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
