//! Undo log records
//!
//! Defines the structure of individual records in a transaction lane.

use crate::error::{PmkvError, Result};
use crate::pool::header::{le_u32, le_u64};

/// Fixed part of every record: kind (4) + len (4) + offset (8) + crc (4) + pad (4)
pub const RECORD_HEADER_SIZE: u64 = 24;

/// What a record asks recovery to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordKind {
    /// Pre-image of `[offset, offset + data.len())`, restored on rollback
    Snapshot = 1,

    /// Block allocated by the transaction, freed on rollback
    Alloc = 2,

    /// Block freed by the transaction, freed for real after the commit point
    Free = 3,
}

impl RecordKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RecordKind::Snapshot),
            2 => Some(RecordKind::Alloc),
            3 => Some(RecordKind::Free),
            _ => None,
        }
    }
}

/// A single entry in a lane's undo log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub kind: RecordKind,

    /// Absolute pool offset the record applies to
    pub offset: u64,

    /// Pre-image bytes (snapshots only)
    pub data: Vec<u8>,
}

impl UndoRecord {
    pub fn snapshot(offset: u64, data: Vec<u8>) -> Self {
        Self {
            kind: RecordKind::Snapshot,
            offset,
            data,
        }
    }

    pub fn alloc(offset: u64) -> Self {
        Self {
            kind: RecordKind::Alloc,
            offset,
            data: Vec::new(),
        }
    }

    pub fn free(offset: u64) -> Self {
        Self {
            kind: RecordKind::Free,
            offset,
            data: Vec::new(),
        }
    }

    /// Bytes this record occupies in a lane (8-byte aligned)
    pub fn encoded_len(&self) -> u64 {
        RECORD_HEADER_SIZE + padded(self.data.len() as u64)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len() as usize);
        buf.extend_from_slice(&(self.kind as u32).to_le_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.compute_crc().to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf.resize(self.encoded_len() as usize, 0);
        buf
    }

    /// Decode the record at `pos` in a lane's record area.
    ///
    /// Returns the record and the position of the next one.
    pub fn decode(area: &[u8], pos: usize) -> Result<(Self, usize)> {
        let header_end = pos + RECORD_HEADER_SIZE as usize;
        if header_end > area.len() {
            return Err(PmkvError::Corrupted(format!(
                "undo record at {} runs past the lane",
                pos
            )));
        }

        let kind = RecordKind::from_raw(le_u32(area, pos)).ok_or_else(|| {
            PmkvError::Corrupted(format!("unknown undo record kind at {}", pos))
        })?;
        let len = le_u32(area, pos + 4) as usize;
        let offset = le_u64(area, pos + 8);
        let stored_crc = le_u32(area, pos + 16);

        let next = header_end + padded(len as u64) as usize;
        if next > area.len() {
            return Err(PmkvError::Corrupted(format!(
                "undo record at {} claims {} bytes past the lane",
                pos, len
            )));
        }

        let record = Self {
            kind,
            offset,
            data: area[header_end..header_end + len].to_vec(),
        };

        if record.compute_crc() != stored_crc {
            return Err(PmkvError::Corrupted(format!(
                "undo record at {} failed its checksum",
                pos
            )));
        }

        Ok((record, next))
    }

    fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&(self.kind as u32).to_le_bytes());
        hasher.update(&(self.data.len() as u32).to_le_bytes());
        hasher.update(&self.offset.to_le_bytes());
        hasher.update(&self.data);
        hasher.finalize()
    }
}

fn padded(len: u64) -> u64 {
    (len + 7) & !7
}
