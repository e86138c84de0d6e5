//! Persistent object references

use std::hash::{Hash, Hasher};

use crate::pool::TypeTag;

/// Stable, typed handle to an object inside a pool.
///
/// A reference is `(pool identity, payload offset, type tag)`. It stays valid
/// across close/reopen of the same pool for as long as the object is not
/// freed. References do not own anything: freeing through one invalidates
/// every alias, and later dereferences fail with `InvalidReference`.
#[derive(Debug, Clone, Copy)]
pub struct ObjRef {
    pool_id: u64,
    offset: u64,
    type_tag: TypeTag,
}

impl ObjRef {
    pub(crate) fn new(pool_id: u64, offset: u64, type_tag: TypeTag) -> Self {
        Self {
            pool_id,
            offset,
            type_tag,
        }
    }

    /// The reference that denotes "no object"
    pub const fn null() -> Self {
        Self {
            pool_id: 0,
            offset: 0,
            type_tag: TypeTag::NONE,
        }
    }

    pub fn is_null(&self) -> bool {
        self.offset == 0
    }

    /// Identity of the pool this reference points into
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Byte offset of the object payload within the pool
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }
}

impl Default for ObjRef {
    fn default() -> Self {
        Self::null()
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.pool_id == other.pool_id && self.offset == other.offset
    }
}

impl Eq for ObjRef {}

impl Hash for ObjRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pool_id.hash(state);
        self.offset.hash(state);
    }
}
