//! Pool header
//!
//! The first page of every pool file.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Static area (written once at create, CRC protected)      │
//! │  0  magic "PMKVPOOL" (8)   8 version (4)  12 hdr len (4) │
//! │ 16  pool id (8)           24 pool size (8)               │
//! │ 32  lane offset (8)       40 lane count (4) 44 lane sz(4)│
//! │ 48  heap offset (8)       56 schema len (4) 60 crc (4)   │
//! │ 64  schema (bincode)                                     │
//! ├──────────────────────────────────────────────────────────┤
//! │ Mutable area (offset 2048)                               │
//! │  root offset (8) │ heap top (8)                          │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{PmkvError, Result};

use super::schema::Schema;

/// Pool file magic
pub const POOL_MAGIC: &[u8; 8] = b"PMKVPOOL";

/// On-media format version
pub const POOL_VERSION: u32 = 1;

/// Size of the header page
pub const HEADER_SIZE: u64 = 4096;

/// Where the serialized schema starts
pub const SCHEMA_OFFSET: u64 = 64;

/// Max serialized schema size
pub const SCHEMA_MAX: usize = (MUTABLE_OFFSET - SCHEMA_OFFSET) as usize;

/// Start of the fields that change after creation
pub const MUTABLE_OFFSET: u64 = 2048;

/// Offset of the root object reference (0 = null)
pub const ROOT_FIELD: u64 = MUTABLE_OFFSET;

/// Offset of the heap bump pointer
pub const HEAP_TOP_FIELD: u64 = MUTABLE_OFFSET + 8;

/// Size of one undo-log lane
pub const LANE_SIZE: u64 = 64 * 1024;

/// Smallest heap a pool may be created with
pub const MIN_HEAP_SIZE: u64 = 64 * 1024;

const CRC_FIELD: usize = 60;

/// Decoded static header
#[derive(Debug, Clone)]
pub struct PoolHeader {
    /// Identity shared by every reference into this pool
    pub pool_id: u64,
    pub pool_size: u64,
    pub lane_offset: u64,
    pub lane_count: u32,
    pub lane_size: u32,
    pub heap_offset: u64,
    pub schema: Schema,
}

impl PoolHeader {
    /// Lay out a new pool of `pool_size` bytes
    pub fn layout(pool_size: u64, lane_count: u32, schema: Schema) -> Result<Self> {
        if lane_count == 0 {
            return Err(PmkvError::InvalidArgument(
                "lane count must be at least 1".to_string(),
            ));
        }

        let lane_offset = HEADER_SIZE;
        let heap_offset = lane_offset + lane_count as u64 * LANE_SIZE;
        let min_size = heap_offset + MIN_HEAP_SIZE;

        if pool_size < min_size {
            return Err(PmkvError::InvalidArgument(format!(
                "pool size {} is below the minimum of {} bytes for {} lanes",
                pool_size, min_size, lane_count
            )));
        }

        Ok(Self {
            pool_id: generate_pool_id(),
            pool_size,
            lane_offset,
            lane_count,
            lane_size: LANE_SIZE as u32,
            heap_offset,
            schema,
        })
    }

    /// End of the heap (exclusive)
    pub fn heap_end(&self) -> u64 {
        self.pool_size
    }

    /// Encode the static area. The magic is included at bytes 0..8 but is
    /// written to the pool last.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let schema = bincode::serialize(&self.schema)?;
        if schema.len() > SCHEMA_MAX {
            return Err(PmkvError::InvalidArgument(format!(
                "schema too large: {} bytes (max {})",
                schema.len(),
                SCHEMA_MAX
            )));
        }

        let mut buf = Vec::with_capacity(SCHEMA_OFFSET as usize + schema.len());
        buf.extend_from_slice(POOL_MAGIC);
        buf.extend_from_slice(&POOL_VERSION.to_le_bytes());
        buf.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        buf.extend_from_slice(&self.pool_id.to_le_bytes());
        buf.extend_from_slice(&self.pool_size.to_le_bytes());
        buf.extend_from_slice(&self.lane_offset.to_le_bytes());
        buf.extend_from_slice(&self.lane_count.to_le_bytes());
        buf.extend_from_slice(&self.lane_size.to_le_bytes());
        buf.extend_from_slice(&self.heap_offset.to_le_bytes());
        buf.extend_from_slice(&(schema.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // CRC placeholder
        buf.extend_from_slice(&schema);

        let crc = header_crc(&buf);
        buf[CRC_FIELD..CRC_FIELD + 4].copy_from_slice(&crc.to_le_bytes());

        Ok(buf)
    }

    /// Decode and verify the header page
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < HEADER_SIZE as usize {
            return Err(PmkvError::Corrupted(format!(
                "header truncated: {} bytes",
                page.len()
            )));
        }

        if &page[0..8] != POOL_MAGIC {
            return Err(PmkvError::Corrupted("bad pool magic".to_string()));
        }

        let version = le_u32(page, 8);
        if version != POOL_VERSION {
            return Err(PmkvError::Corrupted(format!(
                "unsupported pool version {} (expected {})",
                version, POOL_VERSION
            )));
        }

        let schema_len = le_u32(page, 56) as usize;
        if schema_len > SCHEMA_MAX {
            return Err(PmkvError::Corrupted(format!(
                "schema length {} out of range",
                schema_len
            )));
        }

        let end = SCHEMA_OFFSET as usize + schema_len;
        let stored_crc = le_u32(page, CRC_FIELD);
        let mut image = page[..end].to_vec();
        image[CRC_FIELD..CRC_FIELD + 4].copy_from_slice(&0u32.to_le_bytes());
        if header_crc(&image) != stored_crc {
            return Err(PmkvError::Corrupted("header checksum mismatch".to_string()));
        }

        let schema: Schema = bincode::deserialize(&page[SCHEMA_OFFSET as usize..end])
            .map_err(|e| PmkvError::Corrupted(format!("unreadable schema: {}", e)))?;

        let header = Self {
            pool_id: le_u64(page, 16),
            pool_size: le_u64(page, 24),
            lane_offset: le_u64(page, 32),
            lane_count: le_u32(page, 40),
            lane_size: le_u32(page, 44),
            heap_offset: le_u64(page, 48),
            schema,
        };
        header.check_geometry()?;

        Ok(header)
    }

    fn check_geometry(&self) -> Result<()> {
        let lanes_end = self.lane_count as u64 * self.lane_size as u64 + self.lane_offset;
        if self.lane_offset < HEADER_SIZE
            || self.lane_size as u64 != LANE_SIZE
            || self.heap_offset < lanes_end
            || self.heap_offset > self.pool_size
        {
            return Err(PmkvError::Corrupted(format!(
                "inconsistent geometry: lanes at {} ({} x {}), heap at {}, size {}",
                self.lane_offset, self.lane_count, self.lane_size, self.heap_offset, self.pool_size
            )));
        }
        Ok(())
    }
}

fn header_crc(image: &[u8]) -> u32 {
    // Magic excluded: it is written after everything else
    crc32fast::hash(&image[8..])
}

pub(crate) fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

pub(crate) fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn generate_pool_id() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(nanos);
    hasher.write_u32(std::process::id());

    // 0 is reserved for the null reference
    hasher.finish().max(1)
}
