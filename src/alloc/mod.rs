//! Persistent Allocator Module
//!
//! Carves typed objects out of the pool heap and hands out stable references.
//!
//! ## Responsibilities
//! - Reserve, initialize and commit blocks so that a crash never exposes a
//!   half-initialized object
//! - Free blocks only once the free itself is durable
//! - Rebuild free lists by walking the heap at open
//! - Validate every dereference (pool open, block committed, type matches)
//!
//! ## Heap Layout
//! ```text
//! heap_offset                                            heap top     pool end
//! ┌────────┬─────────────┬────────┬──────────────────┬──────┬─ ─ ─ ─ ─ ─ ─┐
//! │ hdr 32 │ payload     │ hdr 32 │ payload          │ ...  │   unused     │
//! └────────┴─────────────┴────────┴──────────────────┴──────┴─ ─ ─ ─ ─ ─ ─┘
//!  block size 2^k ≥ 64     block size 2^j
//! ```

mod block;
mod heap;
mod object;
mod oid;

pub use block::{BlockState, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE};
pub use heap::HeapStats;
pub use object::Object;
pub use oid::ObjRef;

pub(crate) use block::BlockHeader;
pub(crate) use heap::{Heap, HeapScan};
