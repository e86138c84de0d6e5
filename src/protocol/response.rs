//! Response definitions
//!
//! Represents the outcome of a command.

use bytes::Bytes;

use crate::error::PmkvError;

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    NotFound = 0x01,
    InvalidArgument = 0x02,
    OutOfMemory = 0x03,
    Corrupted = 0x04,
    UnknownError = 0x05,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }
}

/// A response to a command
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code
    pub status: Status,

    /// Optional payload (value for GET, big-endian u64 for COUNT, error
    /// message for failures)
    pub payload: Option<Bytes>,
}

impl Response {
    /// Create an OK response with optional payload
    pub fn ok(payload: Option<Bytes>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    /// Create a NOT_FOUND response
    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: None,
        }
    }

    /// Create an OK response carrying a count
    pub fn count(count: u64) -> Self {
        Self::ok(Some(Bytes::copy_from_slice(&count.to_be_bytes())))
    }

    /// Create a failure response from an error
    pub fn error(err: &PmkvError) -> Self {
        Self {
            status: err.status(),
            payload: Some(Bytes::from(err.to_string())),
        }
    }

    /// Decode the payload of a COUNT response
    pub fn as_count(&self) -> Option<u64> {
        let payload = self.payload.as_ref()?;
        let raw: [u8; 8] = payload.as_ref().try_into().ok()?;
        Some(u64::from_be_bytes(raw))
    }
}
