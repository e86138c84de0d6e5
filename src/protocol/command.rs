//! Command definitions
//!
//! Represents requests against the store.

/// A parsed command
#[derive(Debug, Clone)]
pub enum Command {
    /// Get a value by key
    Get { key: Vec<u8> },

    /// Put a key-value pair
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Delete a key
    Delete { key: Vec<u8> },

    /// Check a key is present
    Exists { key: Vec<u8> },

    /// Count keys
    Count,
}
