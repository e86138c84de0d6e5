//! Allocation block headers
//!
//! ```text
//! ┌───────────┬───────────┬───────────┬─────────┬────────────────┬────────────────┐
//! │ Magic (4) │ State (4) │  Type (4) │ Pad (4) │ Block size (8) │ Requested (8)  │
//! └───────────┴───────────┴───────────┴─────────┴────────────────┴────────────────┘
//! ```
//!
//! The payload follows the 32-byte header. Block sizes are powers of two, so
//! a heap walk can step from one header to the next.

use crate::error::{PmkvError, Result};
use crate::pool::header::{le_u32, le_u64};
use crate::pool::TypeTag;

pub const BLOCK_HEADER_SIZE: u64 = 32;
pub const BLOCK_MAGIC: u32 = u32::from_le_bytes(*b"PBLK");
pub const MIN_BLOCK_SIZE: u64 = 64;

/// Offset of the state word inside the header
pub const STATE_FIELD: u64 = 4;

/// Allocation state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockState {
    /// Reusable
    Free = 1,
    /// Handed to an initializer, not yet committed. Reclaimed on recovery.
    Reserved = 2,
    /// Committed and visible
    Allocated = 3,
}

impl BlockState {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(BlockState::Free),
            2 => Some(BlockState::Reserved),
            3 => Some(BlockState::Allocated),
            _ => None,
        }
    }
}

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub state: BlockState,
    pub type_tag: TypeTag,
    /// Total size including the header
    pub block_size: u64,
    /// Size asked for by the allocator's caller
    pub requested: u64,
}

impl BlockHeader {
    pub fn encode(&self) -> [u8; BLOCK_HEADER_SIZE as usize] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&BLOCK_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&(self.state as u32).to_le_bytes());
        buf[8..12].copy_from_slice(&self.type_tag.0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.block_size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.requested.to_le_bytes());
        buf
    }

    /// Decode a header found at `at`. `limit` is the end of the heap.
    pub fn decode(buf: &[u8], at: u64, limit: u64) -> Result<Self> {
        if buf.len() < BLOCK_HEADER_SIZE as usize {
            return Err(PmkvError::Corrupted(format!("short block header at {}", at)));
        }

        if le_u32(buf, 0) != BLOCK_MAGIC {
            return Err(PmkvError::Corrupted(format!("bad block magic at {}", at)));
        }

        let state = BlockState::from_raw(le_u32(buf, 4)).ok_or_else(|| {
            PmkvError::Corrupted(format!("bad block state {} at {}", le_u32(buf, 4), at))
        })?;

        let block_size = le_u64(buf, 16);
        let requested = le_u64(buf, 24);
        let fits = at.checked_add(block_size).map_or(false, |end| end <= limit);
        if block_size < MIN_BLOCK_SIZE
            || !block_size.is_power_of_two()
            || !fits
            || requested > block_size - BLOCK_HEADER_SIZE
        {
            return Err(PmkvError::Corrupted(format!(
                "bad block geometry at {}: size {}, requested {}",
                at, block_size, requested
            )));
        }

        Ok(Self {
            state,
            type_tag: TypeTag(le_u32(buf, 8)),
            block_size,
            requested,
        })
    }

    /// Usable payload bytes
    pub fn capacity(&self) -> u64 {
        self.block_size - BLOCK_HEADER_SIZE
    }
}

/// Block size class for a payload of `size` bytes
pub fn size_class(size: u64) -> Option<u64> {
    size.checked_add(BLOCK_HEADER_SIZE)?
        .max(MIN_BLOCK_SIZE)
        .checked_next_power_of_two()
}
