//! Error types for PMKV
//!
//! Provides a unified error type for all operations, plus the mapping of
//! every error onto the caller-facing [`Status`] codes and onto the broad
//! error classes callers use to decide whether a failure is retryable.

use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::Status;

/// Result type alias using PmkvError
pub type Result<T> = std::result::Result<T, PmkvError>;

/// Unified error type for PMKV operations
#[derive(Debug, Error)]
pub enum PmkvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Pool Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Pool already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Pool not found: {0}")]
    NotFound(PathBuf),

    #[error("Pool is closed")]
    PoolClosed,

    // -------------------------------------------------------------------------
    // Consistency Errors
    // -------------------------------------------------------------------------
    #[error("Layout mismatch: expected {expected:?}, found {found:?}")]
    LayoutMismatch { expected: String, found: String },

    #[error("Pool corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Argument Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Value too large: {len} bytes (max {max})")]
    ValueTooLarge { len: usize, max: usize },

    #[error("Transaction already active on this pool in the calling thread")]
    NestedTransaction,

    // -------------------------------------------------------------------------
    // Resource Errors
    // -------------------------------------------------------------------------
    #[error("Out of pool memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("Undo log full: {needed} bytes needed, {available} available")]
    UndoLogFull { needed: usize, available: usize },

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    // -------------------------------------------------------------------------
    // Reference Errors
    // -------------------------------------------------------------------------
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Range not registered for mutation: {0}")]
    NotRegistered(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Broad classes of failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input: bad path, oversized value, nested transaction
    Argument,
    /// Pool full, allocation failure, filesystem failure
    Resource,
    /// Layout mismatch or corruption found at open/check time
    Consistency,
    /// Misuse of a reference, of the pool lifecycle, or mutation of an
    /// unregistered range
    Concurrency,
}

impl PmkvError {
    /// Map this error to the status code reported at the boundary
    pub fn status(&self) -> Status {
        match self {
            PmkvError::InvalidArgument(_)
            | PmkvError::ValueTooLarge { .. }
            | PmkvError::NestedTransaction
            | PmkvError::Config(_) => Status::InvalidArgument,
            PmkvError::OutOfMemory { .. }
            | PmkvError::UndoLogFull { .. }
            | PmkvError::AllocationFailed(_) => Status::OutOfMemory,
            PmkvError::Corrupted(_) | PmkvError::LayoutMismatch { .. } => Status::Corrupted,
            _ => Status::UnknownError,
        }
    }

    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            PmkvError::InvalidArgument(_)
            | PmkvError::ValueTooLarge { .. }
            | PmkvError::NestedTransaction
            | PmkvError::Config(_) => ErrorClass::Argument,
            PmkvError::Io(_)
            | PmkvError::AlreadyExists(_)
            | PmkvError::NotFound(_)
            | PmkvError::OutOfMemory { .. }
            | PmkvError::UndoLogFull { .. }
            | PmkvError::AllocationFailed(_) => ErrorClass::Resource,
            PmkvError::Corrupted(_)
            | PmkvError::LayoutMismatch { .. }
            | PmkvError::Serialization(_) => ErrorClass::Consistency,
            PmkvError::InvalidReference(_)
            | PmkvError::NotRegistered(_)
            | PmkvError::PoolClosed => ErrorClass::Concurrency,
        }
    }
}

impl From<bincode::Error> for PmkvError {
    fn from(err: bincode::Error) -> Self {
        PmkvError::Serialization(err.to_string())
    }
}
