//! Persistent hash table
//!
//! Every mutation runs in one transaction confined to one bucket, under that
//! bucket's write lock. Readers take the bucket's read lock, so a reader
//! never sees a chain in the middle of a relink.

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::alloc::ObjRef;
use crate::error::{PmkvError, Result};
use crate::pool::Pool;
use crate::tx::Transaction;

use super::{
    BUCKETS_TYPE, BUCKET_COUNT_FIELD, BUCKET_HEAD_FIELD, BUCKET_SIZE, ENTRY_HEADER_SIZE,
    ENTRY_KEY_LEN_FIELD, ENTRY_NEXT_FIELD, ENTRY_TYPE, ENTRY_VAL_LEN_FIELD, IN_PLACE_MAX,
    ROOT_BUCKETS_FIELD, ROOT_BUCKET_COUNT_FIELD, ROOT_MAGIC, ROOT_MAGIC_FIELD, ROOT_SIZE,
    ROOT_TYPE,
};

/// Where a key lives in its bucket chain
struct Located {
    entry: ObjRef,
    /// Entry linking to `entry`, or `None` if it is the bucket head
    prev: Option<ObjRef>,
    next: u64,
    key_len: u64,
    capacity: u64,
}

/// Hash table over a pool's root object
pub struct HashTable {
    pool: Pool,
    buckets: ObjRef,
    bucket_count: u64,
    locks: Box<[CachePadded<RwLock<()>>]>,
}

impl HashTable {
    /// Attach to the table rooted in `pool`, creating it with `bucket_count`
    /// buckets if the pool is new.
    ///
    /// An existing table keeps the bucket count it was created with.
    pub fn open(pool: Pool, bucket_count: u64) -> Result<Self> {
        if bucket_count == 0 {
            return Err(PmkvError::InvalidArgument(
                "bucket count must be at least 1".to_string(),
            ));
        }

        let root = pool.root(ROOT_TYPE, ROOT_SIZE)?;
        let (magic, stored_count, buckets_at) = {
            let object = pool.object(&root)?;
            (
                object.read_u64(ROOT_MAGIC_FIELD)?,
                object.read_u64(ROOT_BUCKET_COUNT_FIELD)?,
                object.read_u64(ROOT_BUCKETS_FIELD)?,
            )
        };

        let (bucket_count, buckets) = if buckets_at == 0 {
            let buckets = Self::initialize(&pool, &root, bucket_count)?;
            debug!(bucket_count, "hash table created");
            (bucket_count, buckets)
        } else {
            if magic != ROOT_MAGIC || stored_count == 0 {
                return Err(PmkvError::Corrupted(format!(
                    "hash table root has magic {:#x} and {} buckets",
                    magic, stored_count
                )));
            }
            if stored_count != bucket_count {
                debug!(stored_count, requested = bucket_count, "keeping stored bucket count");
            }
            (stored_count, pool.resolve(buckets_at, BUCKETS_TYPE))
        };

        let array_len = pool
            .object(&buckets)
            .map_err(|e| PmkvError::Corrupted(format!("bucket array: {}", e)))?
            .len();
        if array_len < bucket_count * BUCKET_SIZE {
            return Err(PmkvError::Corrupted(format!(
                "bucket array of {} bytes cannot hold {} buckets",
                array_len, bucket_count
            )));
        }

        let locks = (0..bucket_count)
            .map(|_| CachePadded::new(RwLock::new(())))
            .collect();

        Ok(Self {
            pool,
            buckets,
            bucket_count,
            locks,
        })
    }

    fn initialize(pool: &Pool, root: &ObjRef, bucket_count: u64) -> Result<ObjRef> {
        let array_size = bucket_count.checked_mul(BUCKET_SIZE).ok_or_else(|| {
            PmkvError::InvalidArgument(format!("bucket count {} too large", bucket_count))
        })?;

        pool.transaction(|tx| {
            let buckets = tx.alloc(BUCKETS_TYPE, array_size, |_| Ok(()))?;
            tx.add(root)?;
            tx.write_u64(root, ROOT_MAGIC_FIELD, ROOT_MAGIC)?;
            tx.write_u64(root, ROOT_BUCKET_COUNT_FIELD, bucket_count)?;
            tx.write_u64(root, ROOT_BUCKETS_FIELD, buckets.offset())?;
            Ok(buckets)
        })
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Insert or overwrite a key
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        check_len("key", key)?;
        check_len("value", value)?;

        let bucket = self.bucket_of(key);
        let _guard = self.locks[bucket as usize].write();
        let found = self.locate(bucket, key)?;
        let val_len = value.len() as u64;

        self.pool.transaction(|tx| match found {
            Some(found)
                if value.len() <= IN_PLACE_MAX
                    && ENTRY_HEADER_SIZE + found.key_len + val_len <= found.capacity =>
            {
                trace!(bucket, "overwrite in place");
                let value_at = ENTRY_HEADER_SIZE + found.key_len;
                tx.add_range(&found.entry, ENTRY_VAL_LEN_FIELD, 4)?;
                tx.add_range(&found.entry, value_at, val_len)?;
                tx.write_u32(&found.entry, ENTRY_VAL_LEN_FIELD, val_len as u32)?;
                tx.write(&found.entry, value_at, value)
            }
            Some(found) => {
                trace!(bucket, "replace entry");
                let replacement = Self::alloc_entry(tx, found.next, key, value)?;
                self.relink(tx, bucket, found.prev.as_ref(), replacement.offset())?;
                tx.free(&found.entry)
            }
            None => {
                trace!(bucket, "insert");
                let at = bucket * BUCKET_SIZE;
                let (head, count) = {
                    let buckets = self.pool.object(&self.buckets)?;
                    (
                        buckets.read_u64(at + BUCKET_HEAD_FIELD)?,
                        buckets.read_u64(at + BUCKET_COUNT_FIELD)?,
                    )
                };

                let entry = Self::alloc_entry(tx, head, key, value)?;
                tx.add_range(&self.buckets, at, BUCKET_SIZE)?;
                tx.write_u64(&self.buckets, at + BUCKET_HEAD_FIELD, entry.offset())?;
                tx.write_u64(&self.buckets, at + BUCKET_COUNT_FIELD, count + 1)
            }
        })
    }

    /// Value stored under `key`, if any
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let bucket = self.bucket_of(key);
        let _guard = self.locks[bucket as usize].read();

        let found = match self.locate(bucket, key)? {
            Some(found) => found,
            None => return Ok(None),
        };

        let entry = self.pool.object(&found.entry)?;
        let val_len = entry.read_u32(ENTRY_VAL_LEN_FIELD)? as u64;
        Ok(Some(entry.read_vec(ENTRY_HEADER_SIZE + found.key_len, val_len)?))
    }

    /// Whether `key` is present, without copying its value
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let bucket = self.bucket_of(key);
        let _guard = self.locks[bucket as usize].read();
        Ok(self.locate(bucket, key)?.is_some())
    }

    /// Remove `key`. Returns `false` (and changes nothing) if it is absent.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let bucket = self.bucket_of(key);
        let _guard = self.locks[bucket as usize].write();

        let found = match self.locate(bucket, key)? {
            Some(found) => found,
            None => return Ok(false),
        };

        let count_at = bucket * BUCKET_SIZE + BUCKET_COUNT_FIELD;
        let count = self.pool.object(&self.buckets)?.read_u64(count_at)?;

        self.pool.transaction(|tx| {
            self.relink(tx, bucket, found.prev.as_ref(), found.next)?;
            tx.add_range(&self.buckets, count_at, 8)?;
            tx.write_u64(&self.buckets, count_at, count.saturating_sub(1))?;
            tx.free(&found.entry)
        })?;

        trace!(bucket, "deleted");
        Ok(true)
    }

    /// Number of keys, summed bucket by bucket
    pub fn count(&self) -> Result<u64> {
        let buckets = self.pool.object(&self.buckets)?;
        let mut total = 0;

        for (bucket, lock) in self.locks.iter().enumerate() {
            let _guard = lock.read();
            total += buckets.read_u64(bucket as u64 * BUCKET_SIZE + BUCKET_COUNT_FIELD)?;
        }

        Ok(total)
    }

    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn bucket_of(&self, key: &[u8]) -> u64 {
        crc32fast::hash(key) as u64 % self.bucket_count
    }

    fn locate(&self, bucket: u64, key: &[u8]) -> Result<Option<Located>> {
        let buckets = self.pool.object(&self.buckets)?;
        let at = bucket * BUCKET_SIZE;
        let chain_len = buckets.read_u64(at + BUCKET_COUNT_FIELD)?;

        let mut prev = None;
        let mut cursor = buckets.read_u64(at + BUCKET_HEAD_FIELD)?;
        let mut steps = 0;

        while cursor != 0 {
            if steps >= chain_len {
                return Err(PmkvError::Corrupted(format!(
                    "bucket {} chain is longer than its count of {}",
                    bucket, chain_len
                )));
            }

            let oid = self.pool.resolve(cursor, ENTRY_TYPE);
            let entry = self.pool.object(&oid)?;
            let key_len = entry.read_u32(ENTRY_KEY_LEN_FIELD)? as u64;
            let next = entry.read_u64(ENTRY_NEXT_FIELD)?;

            if key_len == key.len() as u64 && entry.matches(ENTRY_HEADER_SIZE, key)? {
                return Ok(Some(Located {
                    entry: oid,
                    prev,
                    next,
                    key_len,
                    capacity: entry.len(),
                }));
            }

            prev = Some(oid);
            cursor = next;
            steps += 1;
        }

        Ok(None)
    }

    fn alloc_entry(tx: &mut Transaction<'_>, next: u64, key: &[u8], value: &[u8]) -> Result<ObjRef> {
        let size = ENTRY_HEADER_SIZE + key.len() as u64 + value.len() as u64;

        tx.alloc(ENTRY_TYPE, size, |buf| {
            let key_at = ENTRY_HEADER_SIZE as usize;
            let value_at = key_at + key.len();

            buf[0..8].copy_from_slice(&next.to_le_bytes());
            buf[8..12].copy_from_slice(&(key.len() as u32).to_le_bytes());
            buf[12..16].copy_from_slice(&(value.len() as u32).to_le_bytes());
            buf[key_at..value_at].copy_from_slice(key);
            buf[value_at..].copy_from_slice(value);
            Ok(())
        })
    }

    /// Point whatever links to the located entry at `target`
    fn relink(
        &self,
        tx: &mut Transaction<'_>,
        bucket: u64,
        prev: Option<&ObjRef>,
        target: u64,
    ) -> Result<()> {
        match prev {
            Some(prev) => {
                tx.add_range(prev, ENTRY_NEXT_FIELD, 8)?;
                tx.write_u64(prev, ENTRY_NEXT_FIELD, target)
            }
            None => {
                let at = bucket * BUCKET_SIZE + BUCKET_HEAD_FIELD;
                tx.add_range(&self.buckets, at, 8)?;
                tx.write_u64(&self.buckets, at, target)
            }
        }
    }
}

fn check_len(what: &str, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u32::MAX as usize {
        return Err(PmkvError::InvalidArgument(format!(
            "{} of {} bytes exceeds the entry format",
            what,
            bytes.len()
        )));
    }
    Ok(())
}
