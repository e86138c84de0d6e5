//! Protocol Module
//!
//! The boundary surface of the store: typed commands in, status-coded
//! responses out. Collaborators (the CLI, test harnesses) talk to an
//! [`Engine`](crate::Engine) only through these types.
//!
//! ### Commands
//! - GET    - key → value
//! - PUT    - key, value
//! - DELETE - key
//! - EXISTS - key → present or not, no value copy
//! - COUNT  - number of keys
//!
//! ### Status Codes
//! - 0x00: OK
//! - 0x01: NOT_FOUND
//! - 0x02: INVALID_ARGUMENT
//! - 0x03: OUT_OF_MEMORY
//! - 0x04: CORRUPTED
//! - 0x05: UNKNOWN_ERROR

mod command;
mod response;

pub use command::Command;
pub use response::{Response, Status};
