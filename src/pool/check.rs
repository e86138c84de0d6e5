//! Read-only consistency audit
//!
//! Examines a pool file without opening it for writing and without running
//! recovery, so a damaged pool is never made worse by looking at it.
//!
//! The audit checks:
//! - header magic, version, checksum and geometry
//! - the stored layout against the caller's
//! - every lane state and every counted undo record
//! - the root reference
//! - that the heap walks cleanly from its start to the heap top
//!
//! A lane holding an interrupted transaction is NOT an inconsistency: the
//! next open rolls it back.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::alloc::{BlockHeader, BlockState, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE};
use crate::pool::header::{le_u64, PoolHeader, HEADER_SIZE, HEAP_TOP_FIELD, ROOT_FIELD};
use crate::tx::{LaneState, UndoRecord, LANE_HEADER_SIZE};

use super::PoolOptions;

/// Outcome of [`Pool::check`](super::Pool::check)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// The pool opens (possibly after recovery) with intact metadata
    Consistent,
    /// Metadata is damaged or belongs to another layout
    Inconsistent,
    /// The file could not be examined at all
    CheckFailed,
}

/// Counters gathered by a successful audit
#[derive(Debug, Default)]
struct AuditReport {
    pending_transactions: u64,
    allocated: u64,
    reserved: u64,
    free: u64,
}

pub(crate) fn audit(path: &Path, options: &PoolOptions) -> CheckStatus {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "pool check could not open file");
            return CheckStatus::CheckFailed;
        }
    };

    let len = match file.metadata() {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "pool check could not stat file");
            return CheckStatus::CheckFailed;
        }
    };
    if len < HEADER_SIZE {
        warn!(path = %path.display(), len, "pool file shorter than its header");
        return CheckStatus::Inconsistent;
    }

    // Safety: read-only view; the file is not resized while the audit runs
    let map = match unsafe { Mmap::map(&file) } {
        Ok(map) => map,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "pool check could not map file");
            return CheckStatus::CheckFailed;
        }
    };

    match inspect(&map, options) {
        Ok(report) => {
            debug!(path = %path.display(), ?report, "pool is consistent");
            CheckStatus::Consistent
        }
        Err(reason) => {
            warn!(path = %path.display(), %reason, "pool is inconsistent");
            CheckStatus::Inconsistent
        }
    }
}

fn inspect(bytes: &[u8], options: &PoolOptions) -> std::result::Result<AuditReport, String> {
    let mut report = AuditReport::default();

    // Step 1: header
    let header = PoolHeader::decode(&bytes[..HEADER_SIZE as usize]).map_err(|e| e.to_string())?;
    if header.pool_size != bytes.len() as u64 {
        return Err(format!(
            "header says {} bytes, file has {}",
            header.pool_size,
            bytes.len()
        ));
    }
    options
        .schema
        .expect_matches(&header.schema)
        .map_err(|e| e.to_string())?;

    // Step 2: lanes
    for id in 0..header.lane_count as u64 {
        let base = (header.lane_offset + id * header.lane_size as u64) as usize;
        let state = LaneState::from_raw(le_u64(bytes, base))
            .ok_or_else(|| format!("lane {} has unknown state", id))?;
        if state == LaneState::Idle {
            continue;
        }

        let area = &bytes[base + LANE_HEADER_SIZE as usize..base + header.lane_size as usize];
        let count = le_u64(bytes, base + 8);
        let mut pos = 0;
        for _ in 0..count {
            let (record, next) =
                UndoRecord::decode(area, pos).map_err(|e| format!("lane {}: {}", id, e))?;
            let end = record.offset.checked_add(record.data.len() as u64);
            if end.map_or(true, |end| end > header.pool_size) {
                return Err(format!("lane {}: record outside the pool", id));
            }
            pos = next;
        }
        if count > 0 {
            report.pending_transactions += 1;
        }
    }

    // Step 3: heap walk
    let top = le_u64(bytes, HEAP_TOP_FIELD as usize);
    if top < header.heap_offset || top > header.heap_end() {
        return Err(format!("heap top {} outside the heap", top));
    }
    if (top - header.heap_offset) % MIN_BLOCK_SIZE != 0 {
        return Err(format!("heap top {} is not a block boundary", top));
    }

    let mut cursor = header.heap_offset;
    while cursor < top {
        if cursor + BLOCK_HEADER_SIZE > top {
            return Err(format!("block header at {} runs past the heap top", cursor));
        }
        let at = cursor as usize;
        let block = BlockHeader::decode(&bytes[at..at + BLOCK_HEADER_SIZE as usize], cursor, top)
            .map_err(|e| e.to_string())?;
        match block.state {
            BlockState::Allocated => report.allocated += 1,
            BlockState::Reserved => report.reserved += 1,
            BlockState::Free => report.free += 1,
        }
        cursor += block.block_size;
    }

    // Step 4: root
    let root = le_u64(bytes, ROOT_FIELD as usize);
    if root != 0 {
        if root < header.heap_offset + BLOCK_HEADER_SIZE || root > top || root % 8 != 0 {
            return Err(format!("root offset {} outside the heap", root));
        }
        let at = (root - BLOCK_HEADER_SIZE) as usize;
        BlockHeader::decode(&bytes[at..at + BLOCK_HEADER_SIZE as usize], at as u64, top)
            .map_err(|e| format!("root: {}", e))?;
    }

    Ok(report)
}
