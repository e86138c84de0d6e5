//! Crash Recovery
//!
//! Runs on every open, before the pool is handed to the caller.
//!
//! This will:
//! 1. Roll back every lane left `Active` (transaction never reached its
//!    commit point)
//! 2. Finish the deferred frees of every lane left `Committed`
//! 3. Discard a root reference whose block never committed
//! 4. Walk the heap, reclaim `Reserved` blocks and rebuild the free lists
//!
//! Every step is idempotent, so a crash during recovery is repaired by the
//! next open.

use tracing::{info, warn};

use crate::alloc::{BlockHeader, BlockState, Heap, BLOCK_HEADER_SIZE};
use crate::error::{PmkvError, Result};
use crate::pool::header::{PoolHeader, HEAP_TOP_FIELD, ROOT_FIELD};
use crate::pool::map::PoolMap;
use crate::tx::{Lane, LaneState};

/// What recovery did while opening a pool
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Interrupted transactions undone
    pub transactions_rolled_back: u64,

    /// Committed transactions whose frees were finished
    pub transactions_completed: u64,

    /// Undo records applied
    pub records_replayed: u64,

    /// Whether a root reference to an uncommitted block was cleared
    pub root_discarded: bool,

    /// Reserved blocks returned to the free lists
    pub blocks_reclaimed: u64,

    /// Live objects found by the heap walk
    pub blocks_allocated: u64,

    /// Free blocks found by the heap walk
    pub blocks_free: u64,
}

impl RecoveryResult {
    /// True if the pool was closed cleanly (nothing to repair)
    pub fn was_clean(&self) -> bool {
        self.transactions_rolled_back == 0
            && self.transactions_completed == 0
            && !self.root_discarded
            && self.blocks_reclaimed == 0
    }
}

/// Bring a mapped pool back to a consistent state and rebuild its allocator
pub(crate) fn recover(map: &PoolMap, header: &PoolHeader) -> Result<(Heap, RecoveryResult)> {
    let mut result = RecoveryResult::default();

    // Step 1: undo logs
    for lane in Lane::all(header) {
        match lane.state(map)? {
            LaneState::Idle => {}
            LaneState::Active => {
                let replay = lane.rollback(map)?;
                warn!(lane = lane.id, records = replay.records, "rolled back interrupted transaction");
                result.transactions_rolled_back += 1;
                result.records_replayed += replay.records;
            }
            LaneState::Committed => {
                let replay = lane.complete(map)?;
                info!(lane = lane.id, records = replay.records, "completed committed transaction");
                result.transactions_completed += 1;
                result.records_replayed += replay.records;
            }
        }
    }

    // Step 2: root
    let root = map.read_u64(ROOT_FIELD);
    if root != 0 && !root_committed(map, header, root)? {
        warn!(root, "discarding root that never committed");
        map.write_u64(ROOT_FIELD, 0);
        map.persist(ROOT_FIELD, 8)?;
        result.root_discarded = true;
    }

    // Step 3: heap
    let (heap, scan) = Heap::scan(map, header.heap_offset, header.heap_end())?;
    result.blocks_reclaimed = scan.reclaimed;
    result.blocks_allocated = scan.allocated;
    result.blocks_free = scan.free;

    if result.was_clean() {
        info!(objects = scan.allocated, "pool opened cleanly");
    } else {
        info!(?result, "pool recovered");
    }

    Ok((heap, result))
}

fn root_committed(map: &PoolMap, header: &PoolHeader, root: u64) -> Result<bool> {
    let top = map.read_u64(HEAP_TOP_FIELD);
    if root < header.heap_offset + BLOCK_HEADER_SIZE || root > top || root % 8 != 0 {
        return Err(PmkvError::Corrupted(format!(
            "root offset {} outside the heap",
            root
        )));
    }

    let block = root - BLOCK_HEADER_SIZE;
    let mut raw = [0u8; BLOCK_HEADER_SIZE as usize];
    map.read_into(block, &mut raw);
    let block_header = BlockHeader::decode(&raw, block, top)?;

    Ok(block_header.state == BlockState::Allocated)
}
