//! Storage Pool Module
//!
//! A pool is a single fixed-size file mapped into memory. It holds all
//! durable state: a self-describing header, one undo-log lane per concurrent
//! transaction, and the object heap.
//!
//! ## File Layout
//! ```text
//! 0          4 KiB                    4 KiB + lanes x 64 KiB         size
//! ┌──────────┬────────┬────────┬─────┬──────────────────────────────────┐
//! │  Header  │ Lane 0 │ Lane 1 │ ... │ Heap                             │
//! └──────────┴────────┴────────┴─────┴──────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//! - `create`: format a new file; fails if one already exists
//! - `open`: verify header and layout, run recovery
//! - `close`: flush everything; the handle becomes unusable
//! - `check`: read-only audit, never modifies the file

mod check;
mod handle;
pub(crate) mod header;
pub(crate) mod map;
mod schema;

pub use check::CheckStatus;
pub use handle::{Pool, PoolOptions, DEFAULT_LANE_COUNT, DEFAULT_MODE};
pub use header::{HEADER_SIZE, LANE_SIZE, MIN_HEAP_SIZE};
pub use schema::{Schema, TypeDesc, TypeTag};
