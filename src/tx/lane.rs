//! Transaction lanes
//!
//! A lane is a fixed slice of the pool holding the undo log of one in-flight
//! transaction. Lanes are handed out by [`LaneSet`]; their count caps the
//! number of concurrent transactions.
//!
//! ```text
//! ┌───────────┬───────────┬──────────┬──────────────────────────────────┐
//! │ State (8) │ Count (8) │ Pad (48) │ Records ...                      │
//! └───────────┴───────────┴──────────┴──────────────────────────────────┘
//! ```
//!
//! A record is durable before the count that covers it, so recovery never
//! reads a half-written record.

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::alloc::{Heap, BLOCK_HEADER_SIZE};
use crate::error::{PmkvError, Result};
use crate::pool::header::PoolHeader;
use crate::pool::map::PoolMap;

use super::record::{RecordKind, UndoRecord};

pub const LANE_HEADER_SIZE: u64 = 64;

const STATE_FIELD: u64 = 0;
const COUNT_FIELD: u64 = 8;

/// Persistent state of a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum LaneState {
    /// No transaction
    Idle = 0,
    /// Transaction in flight; recovery rolls it back
    Active = 1,
    /// Past the commit point; recovery finishes its deferred frees
    Committed = 2,
}

impl LaneState {
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(LaneState::Idle),
            1 => Some(LaneState::Active),
            2 => Some(LaneState::Committed),
            _ => None,
        }
    }
}

/// What replaying a lane did
#[derive(Debug, Default)]
pub(crate) struct LaneReplay {
    pub records: u64,
    /// Blocks persisted as free; reusable once the lane is idle
    pub released: Vec<u64>,
}

/// Location of one lane in the pool
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lane {
    pub id: u32,
    offset: u64,
    size: u64,
}

impl Lane {
    /// Every lane described by a header
    pub fn all(header: &PoolHeader) -> impl Iterator<Item = Lane> + '_ {
        (0..header.lane_count).map(move |id| Lane {
            id,
            offset: header.lane_offset + id as u64 * header.lane_size as u64,
            size: header.lane_size as u64,
        })
    }

    /// Bytes available for records
    pub fn capacity(&self) -> u64 {
        self.size - LANE_HEADER_SIZE
    }

    pub fn state(&self, map: &PoolMap) -> Result<LaneState> {
        let raw = map.read_u64(self.offset + STATE_FIELD);
        LaneState::from_raw(raw).ok_or_else(|| {
            PmkvError::Corrupted(format!("lane {} has unknown state {}", self.id, raw))
        })
    }

    pub fn set_state(&self, map: &PoolMap, state: LaneState) -> Result<()> {
        map.write_u64(self.offset + STATE_FIELD, state as u64);
        map.persist(self.offset + STATE_FIELD, 8)
    }

    /// Append `record` at byte `used` of the record area.
    ///
    /// Returns the new number of used bytes.
    pub fn append(&self, map: &PoolMap, used: u64, count: u64, record: &UndoRecord) -> Result<u64> {
        let at = self.offset + LANE_HEADER_SIZE + used;
        let bytes = record.encode();

        // Step 1: record bytes durable
        map.write_bytes(at, &bytes);
        map.persist(at, bytes.len() as u64)?;

        // Step 2: count covers the record
        map.write_u64(self.offset + COUNT_FIELD, count + 1);
        map.persist(self.offset + COUNT_FIELD, 8)?;

        Ok(used + bytes.len() as u64)
    }

    /// Read back every counted record, oldest first
    pub fn records(&self, map: &PoolMap) -> Result<Vec<UndoRecord>> {
        let count = map.read_u64(self.offset + COUNT_FIELD);
        if count == 0 {
            return Ok(Vec::new());
        }

        let area = map.read_vec(self.offset + LANE_HEADER_SIZE, self.capacity());
        let mut records = Vec::with_capacity(count as usize);
        let mut pos = 0;

        for _ in 0..count {
            let (record, next) = UndoRecord::decode(&area, pos).map_err(|e| {
                PmkvError::Corrupted(format!("lane {}: {}", self.id, e))
            })?;

            let names_block = record.kind != RecordKind::Snapshot;
            if !map.contains(record.offset, record.data.len() as u64)
                || (names_block && record.offset < BLOCK_HEADER_SIZE)
            {
                return Err(PmkvError::Corrupted(format!(
                    "lane {}: record targets {}+{} outside the pool",
                    self.id,
                    record.offset,
                    record.data.len()
                )));
            }

            records.push(record);
            pos = next;
        }

        Ok(records)
    }

    /// Undo everything the lane's transaction did, newest record first,
    /// then return the lane to idle.
    ///
    /// Idempotent: a crash during rollback is repaired by rolling back again.
    pub fn rollback(&self, map: &PoolMap) -> Result<LaneReplay> {
        let records = self.records(map)?;
        let mut replay = LaneReplay::default();

        for record in records.iter().rev() {
            match record.kind {
                RecordKind::Snapshot => {
                    map.write_bytes(record.offset, &record.data);
                    map.persist(record.offset, record.data.len() as u64)?;
                }
                RecordKind::Alloc => {
                    if Heap::mark_free(map, record.offset)? {
                        replay.released.push(record.offset);
                    }
                }
                RecordKind::Free => {}
            }
            replay.records += 1;
        }

        self.reset(map)?;
        Ok(replay)
    }

    /// Perform the deferred frees of a committed transaction, then return
    /// the lane to idle.
    pub fn complete(&self, map: &PoolMap) -> Result<LaneReplay> {
        let records = self.records(map)?;
        let mut replay = LaneReplay::default();

        for record in records.iter().filter(|r| r.kind == RecordKind::Free) {
            if Heap::mark_free(map, record.offset)? {
                replay.released.push(record.offset);
            }
            replay.records += 1;
        }

        self.reset(map)?;
        Ok(replay)
    }

    fn reset(&self, map: &PoolMap) -> Result<()> {
        map.write_u64(self.offset + COUNT_FIELD, 0);
        map.write_u64(self.offset + STATE_FIELD, LaneState::Idle as u64);
        map.persist(self.offset, 16)
    }
}

/// Hands out idle lanes to transactions
pub(crate) struct LaneSet {
    slots: Mutex<LaneSlots>,
    available: Condvar,
}

struct LaneSlots {
    idle: Vec<Lane>,
    /// Set once an undo log failed to replay; cleared only by reopening
    damaged: bool,
}

impl LaneSet {
    pub fn new(header: &PoolHeader) -> Self {
        // Reverse so lane 0 is handed out first
        let mut lanes: Vec<Lane> = Lane::all(header).collect();
        lanes.reverse();

        Self {
            slots: Mutex::new(LaneSlots {
                idle: lanes,
                damaged: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Take an idle lane, blocking while every lane is busy
    pub fn acquire(&self) -> Result<Lane> {
        let mut slots = self.slots.lock();
        loop {
            if slots.damaged {
                return Err(damaged());
            }
            if let Some(lane) = slots.idle.pop() {
                return Ok(lane);
            }
            self.available.wait(&mut slots);
        }
    }

    pub fn release(&self, lane: Lane) {
        self.slots.lock().idle.push(lane);
        self.available.notify_one();
    }

    /// Retire `lane` after its undo log failed to replay.
    ///
    /// The lane keeps its log for the next open. Every later `acquire`,
    /// including ones already waiting, fails with `Corrupted`.
    pub fn poison(&self, lane: Lane) {
        let mut slots = self.slots.lock();
        slots.damaged = true;
        drop(slots);
        self.available.notify_all();
        warn!(lane = lane.id, "lane retired, pool needs a reopen");
    }

    pub fn check(&self) -> Result<()> {
        if self.slots.lock().damaged {
            return Err(damaged());
        }
        Ok(())
    }
}

fn damaged() -> PmkvError {
    PmkvError::Corrupted("an undo log failed to replay; reopen the pool to recover".to_string())
}
