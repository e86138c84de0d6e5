//! Transaction Engine Module
//!
//! Atomic, crash-consistent groups of mutations over pool objects.
//!
//! ## Responsibilities
//! - Snapshot registered ranges into a per-transaction undo log (a lane)
//! - Tie allocations and frees to the outcome of the transaction
//! - Commit with a single durable state flip
//! - Roll back on abort, on error, on drop, and on the next open after a crash
//!
//! ## Undo Log Layout
//! ```text
//! ┌──────────────┬────────────────────────────────────────────────────┐
//! │ Lane header  │ Record │ Record │ Record │ ...                      │
//! │ state, count │ kind, len, offset, crc, pre-image                  │
//! └──────────────┴────────────────────────────────────────────────────┘
//! ```

mod lane;
mod record;
mod transaction;

pub use lane::{LaneState, LANE_HEADER_SIZE};
pub use record::{RecordKind, UndoRecord, RECORD_HEADER_SIZE};
pub use transaction::Transaction;

pub(crate) use lane::{Lane, LaneSet};

/// Where a transaction is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No transaction, or one whose final hooks have run
    None,
    Active,
    Committed,
    Aborted,
}
