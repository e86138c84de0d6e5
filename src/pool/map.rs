//! Mapped pool memory
//!
//! All access to pool bytes goes through [`PoolMap`]. Word-sized fields are
//! read and written as little-endian atomics so a crash never tears a link;
//! everything else is a plain copy guarded by the caller's locks.

use std::fs::File;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use memmap2::MmapRaw;

use crate::config::Durability;
use crate::error::Result;

/// Shared, writable view of a pool file
pub(crate) struct PoolMap {
    map: MmapRaw,
    len: u64,
    durability: Durability,
}

impl PoolMap {
    /// Map the whole file read/write, shared with the page cache
    pub fn new(file: &File, durability: Durability) -> Result<Self> {
        let map = MmapRaw::map_raw(file)?;
        let len = map.len() as u64;
        Ok(Self {
            map,
            len,
            durability,
        })
    }

    /// Mapped length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// Whether `[offset, offset + len)` lies inside the mapping
    pub fn contains(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map_or(false, |end| end <= self.len)
    }

    fn ptr(&self, offset: u64, len: u64) -> *mut u8 {
        assert!(
            self.contains(offset, len),
            "pool access out of bounds: {}+{} > {}",
            offset,
            len,
            self.len
        );
        // Safety: bounds checked above; the mapping lives as long as `self`
        unsafe { self.map.as_mut_ptr().add(offset as usize) }
    }

    pub fn read_u64(&self, offset: u64) -> u64 {
        debug_assert_eq!(offset % 8, 0, "unaligned u64 read at {}", offset);
        // Safety: in bounds, 8-byte aligned (page-aligned base), and every
        // bit pattern is a valid u64
        let word = unsafe { &*(self.ptr(offset, 8) as *const AtomicU64) };
        u64::from_le(word.load(Ordering::Acquire))
    }

    pub fn write_u64(&self, offset: u64, value: u64) {
        debug_assert_eq!(offset % 8, 0, "unaligned u64 write at {}", offset);
        let word = unsafe { &*(self.ptr(offset, 8) as *const AtomicU64) };
        word.store(value.to_le(), Ordering::Release);
    }

    pub fn read_u32(&self, offset: u64) -> u32 {
        debug_assert_eq!(offset % 4, 0, "unaligned u32 read at {}", offset);
        let word = unsafe { &*(self.ptr(offset, 4) as *const AtomicU32) };
        u32::from_le(word.load(Ordering::Acquire))
    }

    pub fn write_u32(&self, offset: u64, value: u32) {
        debug_assert_eq!(offset % 4, 0, "unaligned u32 write at {}", offset);
        let word = unsafe { &*(self.ptr(offset, 4) as *const AtomicU32) };
        word.store(value.to_le(), Ordering::Release);
    }

    /// Copy pool bytes into `buf`
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) {
        let src = self.ptr(offset, buf.len() as u64);
        unsafe { std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    pub fn read_vec(&self, offset: u64, len: u64) -> Vec<u8> {
        let mut buf = vec![0u8; len as usize];
        self.read_into(offset, &mut buf);
        buf
    }

    /// Compare pool bytes against `other` without copying
    pub fn eq_bytes(&self, offset: u64, other: &[u8]) -> bool {
        let src = self.ptr(offset, other.len() as u64);
        // Safety: in bounds; caller holds the lock that orders writers of
        // this range
        let bytes = unsafe { std::slice::from_raw_parts(src as *const u8, other.len()) };
        bytes == other
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) {
        let dst = self.ptr(offset, data.len() as u64);
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    pub fn fill(&self, offset: u64, len: u64, byte: u8) {
        let dst = self.ptr(offset, len);
        unsafe { std::ptr::write_bytes(dst, byte, len as usize) };
    }

    /// Borrow a range mutably.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive use of the range for the lifetime of
    /// the slice (e.g. a freshly reserved block).
    pub unsafe fn slice_mut(&self, offset: u64, len: u64) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr(offset, len), len as usize)
    }

    /// Durability barrier over `[offset, offset + len)`
    pub fn persist(&self, offset: u64, len: u64) -> Result<()> {
        if len > 0 && self.durability == Durability::Flush {
            assert!(self.contains(offset, len));
            self.map.flush_range(offset as usize, len as usize)?;
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Durability barrier over the whole pool
    pub fn persist_all(&self) -> Result<()> {
        if self.durability == Durability::Flush {
            self.map.flush()?;
        }
        fence(Ordering::SeqCst);
        Ok(())
    }
}
