//! Heap allocator
//!
//! Carves blocks out of the pool's heap region.
//!
//! ## Crash protocol
//! - Reserve: the block header is persisted as `Reserved` before the heap top
//!   moves past it, so a heap walk always finds well-formed headers.
//! - Commit: payload zeroed, initializer run, payload persisted, then the
//!   state flips to `Allocated` and is persisted.
//! - Free: the state flips to `Free` and is persisted before the block is put
//!   back on a free list.
//!
//! A crash anywhere in between leaves a `Reserved` block, which recovery
//! turns back into a free one.
//!
//! ## Reuse policy
//! Power-of-two size classes with one free list per class. Exact class
//! first, then the bump pointer, then any larger free block.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::error::{PmkvError, Result};
use crate::pool::header::HEAP_TOP_FIELD;
use crate::pool::map::PoolMap;
use crate::pool::TypeTag;

use super::block::{
    size_class, BlockHeader, BlockState, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE, STATE_FIELD,
};

/// Occupancy snapshot of the heap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Reserved or allocated blocks
    pub live_blocks: u64,
    /// Blocks on the free lists
    pub free_blocks: u64,
    /// Bytes held by free blocks
    pub free_bytes: u64,
    /// Bytes below the bump pointer
    pub heap_used: u64,
    /// Total heap bytes
    pub heap_size: u64,
}

/// Result of walking the heap at open time
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HeapScan {
    pub allocated: u64,
    pub free: u64,
    pub reclaimed: u64,
}

struct HeapState {
    /// Bump pointer (mirrors the persistent heap top)
    top: u64,
    /// Block size → block offsets
    free: BTreeMap<u64, Vec<u64>>,
    live: u64,
}

impl HeapState {
    fn take(&mut self, class: u64) -> Option<(u64, u64)> {
        let list = self.free.get_mut(&class)?;
        let block = list.pop()?;
        if list.is_empty() {
            self.free.remove(&class);
        }
        Some((block, class))
    }

    fn take_larger(&mut self, class: u64) -> Option<(u64, u64)> {
        let size = *self.free.range(class..).next()?.0;
        self.take(size)
    }

    fn put(&mut self, block: u64, size: u64) {
        self.free.entry(size).or_default().push(block);
    }
}

/// Volatile allocator state over the persistent heap
pub(crate) struct Heap {
    start: u64,
    end: u64,
    state: Mutex<HeapState>,
}

impl Heap {
    /// Allocator for a freshly created (empty) heap
    pub fn empty(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            state: Mutex::new(HeapState {
                top: start,
                free: BTreeMap::new(),
                live: 0,
            }),
        }
    }

    /// Rebuild the allocator by walking every block below the heap top.
    ///
    /// `Reserved` blocks belong to allocations that never committed; they are
    /// persisted as `Free`. Any malformed header fails the walk.
    pub fn scan(map: &PoolMap, start: u64, end: u64) -> Result<(Self, HeapScan)> {
        let top = map.read_u64(HEAP_TOP_FIELD);
        if top < start || top > end || (top - start) % MIN_BLOCK_SIZE != 0 {
            return Err(PmkvError::Corrupted(format!(
                "heap top {} is not a block boundary in heap [{}, {})",
                top, start, end
            )));
        }

        let mut state = HeapState {
            top,
            free: BTreeMap::new(),
            live: 0,
        };
        let mut scan = HeapScan::default();
        let mut cursor = start;
        let mut raw = [0u8; BLOCK_HEADER_SIZE as usize];

        while cursor < top {
            if cursor + BLOCK_HEADER_SIZE > top {
                return Err(PmkvError::Corrupted(format!(
                    "block header at {} runs past the heap top {}",
                    cursor, top
                )));
            }
            map.read_into(cursor, &mut raw);
            let header = BlockHeader::decode(&raw, cursor, top)?;

            match header.state {
                BlockState::Allocated => {
                    state.live += 1;
                    scan.allocated += 1;
                }
                BlockState::Reserved => {
                    map.write_u32(cursor + STATE_FIELD, BlockState::Free as u32);
                    map.persist(cursor, BLOCK_HEADER_SIZE)?;
                    state.put(cursor, header.block_size);
                    scan.reclaimed += 1;
                    scan.free += 1;
                }
                BlockState::Free => {
                    state.put(cursor, header.block_size);
                    scan.free += 1;
                }
            }

            cursor += header.block_size;
        }

        Ok((
            Self {
                start,
                end,
                state: Mutex::new(state),
            },
            scan,
        ))
    }

    /// Reserve a block for a `size`-byte object of type `tag`.
    ///
    /// Returns the payload offset. The header is persisted as `Reserved`.
    pub fn reserve(&self, map: &PoolMap, tag: TypeTag, size: u64) -> Result<u64> {
        let class = size_class(size).ok_or(PmkvError::OutOfMemory { requested: size })?;

        let mut state = self.state.lock();

        let (block, block_size) = if let Some(found) = state.take(class) {
            found
        } else if state.top.checked_add(class).map_or(false, |end| end <= self.end) {
            let block = state.top;
            let header = BlockHeader {
                state: BlockState::Reserved,
                type_tag: tag,
                block_size: class,
                requested: size,
            };

            // Header first, then move the top past it
            map.write_bytes(block, &header.encode());
            map.persist(block, BLOCK_HEADER_SIZE)?;
            map.write_u64(HEAP_TOP_FIELD, block + class);
            map.persist(HEAP_TOP_FIELD, 8)?;
            state.top = block + class;
            state.live += 1;

            return Ok(block + BLOCK_HEADER_SIZE);
        } else if let Some(found) = state.take_larger(class) {
            found
        } else {
            return Err(PmkvError::OutOfMemory { requested: size });
        };

        let header = BlockHeader {
            state: BlockState::Reserved,
            type_tag: tag,
            block_size,
            requested: size,
        };
        let raw = header.encode();

        // State word last so a torn update still reads as Free or Reserved
        map.write_bytes(block + 8, &raw[8..]);
        map.write_u32(block + STATE_FIELD, BlockState::Reserved as u32);
        if let Err(e) = map.persist(block, BLOCK_HEADER_SIZE) {
            state.put(block, block_size);
            return Err(e);
        }
        state.live += 1;

        Ok(block + BLOCK_HEADER_SIZE)
    }

    /// Initialize and commit a reserved block.
    ///
    /// On initializer failure the block is persisted as `Free` but NOT put
    /// back on a free list; the caller decides when it may be reused.
    pub fn commit<F>(&self, map: &PoolMap, payload: u64, init: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let block = payload - BLOCK_HEADER_SIZE;
        let header = self.header(map, payload)?;
        debug_assert_eq!(header.state, BlockState::Reserved);

        map.fill(payload, header.capacity(), 0);

        // Safety: a reserved block is owned exclusively by its reserver
        let buf = unsafe { map.slice_mut(payload, header.requested) };
        if let Err(e) = init(buf) {
            map.write_u32(block + STATE_FIELD, BlockState::Free as u32);
            map.persist(block, BLOCK_HEADER_SIZE)?;
            return Err(PmkvError::AllocationFailed(e.to_string()));
        }

        map.persist(payload, header.capacity())?;
        map.write_u32(block + STATE_FIELD, BlockState::Allocated as u32);
        map.persist(block, BLOCK_HEADER_SIZE)?;

        Ok(())
    }

    /// Free an allocated block and make it reusable
    pub fn free(&self, map: &PoolMap, payload: u64) -> Result<()> {
        let header = self.header(map, payload)?;

        let mut state = self.state.lock();
        let current = BlockState::from_raw(map.read_u32(payload - BLOCK_HEADER_SIZE + STATE_FIELD));
        if current != Some(BlockState::Allocated) {
            return Err(PmkvError::InvalidReference(format!(
                "object at {} is not allocated",
                payload
            )));
        }

        Self::mark_free(map, payload)?;
        state.put(payload - BLOCK_HEADER_SIZE, header.block_size);
        state.live = state.live.saturating_sub(1);

        Ok(())
    }

    /// Persist a block as `Free` without making it reusable.
    ///
    /// Returns `false` if it already was free. Idempotent, which recovery
    /// relies on when a crash interrupts a replay.
    pub fn mark_free(map: &PoolMap, payload: u64) -> Result<bool> {
        let field = payload - BLOCK_HEADER_SIZE + STATE_FIELD;
        match BlockState::from_raw(map.read_u32(field)) {
            Some(BlockState::Free) => Ok(false),
            Some(_) => {
                map.write_u32(field, BlockState::Free as u32);
                map.persist(payload - BLOCK_HEADER_SIZE, BLOCK_HEADER_SIZE)?;
                Ok(true)
            }
            None => Err(PmkvError::Corrupted(format!(
                "bad block state at {}",
                payload - BLOCK_HEADER_SIZE
            ))),
        }
    }

    /// Put blocks already persisted as `Free` back on the free lists
    pub fn release(&self, map: &PoolMap, payloads: &[u64]) {
        if payloads.is_empty() {
            return;
        }

        let mut state = self.state.lock();
        for &payload in payloads {
            let block = payload - BLOCK_HEADER_SIZE;
            let size = map.read_u64(block + 16);
            state.put(block, size);
            state.live = state.live.saturating_sub(1);
        }
    }

    /// Read and validate the header of the block holding `payload`
    pub fn header(&self, map: &PoolMap, payload: u64) -> Result<BlockHeader> {
        let top = map.read_u64(HEAP_TOP_FIELD);
        if payload < self.start + BLOCK_HEADER_SIZE
            || payload % 8 != 0
            || payload > top
        {
            return Err(PmkvError::InvalidReference(format!(
                "offset {} is outside the heap",
                payload
            )));
        }

        let block = payload - BLOCK_HEADER_SIZE;
        let mut raw = [0u8; BLOCK_HEADER_SIZE as usize];
        map.read_into(block, &mut raw);
        BlockHeader::decode(&raw, block, top)
            .map_err(|e| PmkvError::InvalidReference(format!("no block at {}: {}", payload, e)))
    }

    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        let (free_blocks, free_bytes) = state
            .free
            .iter()
            .fold((0, 0), |(n, bytes), (size, list)| {
                (n + list.len() as u64, bytes + size * list.len() as u64)
            });

        HeapStats {
            live_blocks: state.live,
            free_blocks,
            free_bytes,
            heap_used: state.top - self.start,
            heap_size: self.end - self.start,
        }
    }
}
