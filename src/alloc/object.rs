//! Validated read access to a persistent object

use crate::error::{PmkvError, Result};
use crate::pool::map::PoolMap;

use super::block::BlockHeader;
use super::ObjRef;

/// A dereferenced [`ObjRef`].
///
/// Obtained from [`Pool::object`](crate::pool::Pool::object), which checks
/// the pool is open, the reference belongs to it, and the block is committed
/// with the expected type. All reads are bounds-checked against the block's
/// usable size and copy out of the pool.
pub struct Object<'p> {
    map: &'p PoolMap,
    oid: ObjRef,
    header: BlockHeader,
}

impl<'p> Object<'p> {
    pub(crate) fn new(map: &'p PoolMap, oid: ObjRef, header: BlockHeader) -> Self {
        Self { map, oid, header }
    }

    pub fn oid(&self) -> ObjRef {
        self.oid
    }

    /// Usable size of the object in bytes
    pub fn len(&self) -> u64 {
        self.header.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size requested when the object was allocated
    pub fn requested_len(&self) -> u64 {
        self.header.requested
    }

    pub fn read_u64(&self, at: u64) -> Result<u64> {
        let abs = self.check(at, 8)?;
        if abs % 8 == 0 {
            return Ok(self.map.read_u64(abs));
        }
        let mut raw = [0u8; 8];
        self.map.read_into(abs, &mut raw);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_u32(&self, at: u64) -> Result<u32> {
        let abs = self.check(at, 4)?;
        if abs % 4 == 0 {
            return Ok(self.map.read_u32(abs));
        }
        let mut raw = [0u8; 4];
        self.map.read_into(abs, &mut raw);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_into(&self, at: u64, buf: &mut [u8]) -> Result<()> {
        let abs = self.check(at, buf.len() as u64)?;
        self.map.read_into(abs, buf);
        Ok(())
    }

    pub fn read_vec(&self, at: u64, len: u64) -> Result<Vec<u8>> {
        let abs = self.check(at, len)?;
        Ok(self.map.read_vec(abs, len))
    }

    /// Copy of the first `requested_len()` bytes
    pub fn to_vec(&self) -> Vec<u8> {
        self.map.read_vec(self.oid.offset(), self.header.requested)
    }

    /// Compare a byte range of the object with `bytes`
    pub fn matches(&self, at: u64, bytes: &[u8]) -> Result<bool> {
        let abs = self.check(at, bytes.len() as u64)?;
        Ok(self.map.eq_bytes(abs, bytes))
    }

    fn check(&self, at: u64, len: u64) -> Result<u64> {
        match at.checked_add(len) {
            Some(end) if end <= self.len() => Ok(self.oid.offset() + at),
            _ => Err(PmkvError::InvalidArgument(format!(
                "range {}+{} outside object of {} bytes",
                at,
                len,
                self.len()
            ))),
        }
    }
}
