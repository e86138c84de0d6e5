//! Key-Value Module
//!
//! A persistent hash table built from pool objects and transactions.
//!
//! ## Object Graph
//! ```text
//! root ──► ┌───────────────┐
//!          │ magic         │      buckets ──► ┌──────┬───────┐
//!          │ bucket count  │                  │ head │ count │ ─► entry ─► entry ─► 0
//!          │ buckets ──────┼────────────────► │ head │ count │ ─► 0
//!          └───────────────┘                  │ ...  │       │
//!                                             └──────┴───────┘
//! ```
//!
//! ## Entry Layout
//! ```text
//! ┌──────────┬─────────────┬─────────────┬───────────┬─────────────┐
//! │ Next (8) │ Key Len (4) │ Val Len (4) │    Key    │    Value    │
//! └──────────┴─────────────┴─────────────┴───────────┴─────────────┘
//! ```

mod table;

pub use table::HashTable;

use crate::pool::{Schema, TypeTag};

/// Layout name stored in every key-value pool
pub const LAYOUT: &str = "pmkv-hashmap";

/// Version of the object graph under [`LAYOUT`]
pub const LAYOUT_VERSION: u32 = 1;

pub const ROOT_TYPE: TypeTag = TypeTag(1);
pub const BUCKETS_TYPE: TypeTag = TypeTag(2);
pub const ENTRY_TYPE: TypeTag = TypeTag(3);

/// "KVROOT01"
pub(crate) const ROOT_MAGIC: u64 = u64::from_le_bytes(*b"KVROOT01");

pub(crate) const ROOT_SIZE: u64 = 32;
pub(crate) const ROOT_MAGIC_FIELD: u64 = 0;
pub(crate) const ROOT_BUCKET_COUNT_FIELD: u64 = 8;
pub(crate) const ROOT_BUCKETS_FIELD: u64 = 16;

pub(crate) const BUCKET_SIZE: u64 = 16;
pub(crate) const BUCKET_HEAD_FIELD: u64 = 0;
pub(crate) const BUCKET_COUNT_FIELD: u64 = 8;

pub(crate) const ENTRY_NEXT_FIELD: u64 = 0;
pub(crate) const ENTRY_KEY_LEN_FIELD: u64 = 8;
pub(crate) const ENTRY_VAL_LEN_FIELD: u64 = 12;
pub(crate) const ENTRY_HEADER_SIZE: u64 = 16;

/// Largest value overwritten in place; bigger values get a fresh entry
pub const IN_PLACE_MAX: usize = 4096;

/// The layout every key-value pool is created with
pub fn schema() -> Schema {
    Schema::new(LAYOUT, LAYOUT_VERSION)
        .with_type(ROOT_TYPE, "root", ROOT_SIZE, 8)
        .with_type(BUCKETS_TYPE, "buckets", BUCKET_SIZE, 8)
        .with_type(ENTRY_TYPE, "entry", ENTRY_HEADER_SIZE, 8)
}
