//! Pool handle
//!
//! [`Pool`] is the entry point to a pool file: lifecycle (create, open,
//! close, check), the root object, atomic allocation outside transactions and
//! the transaction factory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::alloc::{BlockState, Heap, HeapStats, ObjRef, Object};
use crate::config::Durability;
use crate::error::{PmkvError, Result};
use crate::recovery::{self, RecoveryResult};
use crate::tx::{LaneSet, Transaction};

use super::check::{self, CheckStatus};
use super::header::{PoolHeader, HEADER_SIZE, HEAP_TOP_FIELD, POOL_MAGIC, ROOT_FIELD};
use super::map::PoolMap;
use super::schema::{Schema, TypeTag};

/// Permission bits used by [`Pool::open_or_create`]
pub const DEFAULT_MODE: u32 = 0o666;

/// Default number of transaction lanes
pub const DEFAULT_LANE_COUNT: u32 = 64;

/// Distinguishes open pools for nested-transaction detection
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// How to create or open a pool
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Layout the pool must carry
    pub schema: Schema,

    /// Lanes to lay out at creation (ignored on open)
    pub lane_count: u32,

    pub durability: Durability,
}

impl PoolOptions {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            lane_count: DEFAULT_LANE_COUNT,
            durability: Durability::Flush,
        }
    }

    pub fn lane_count(mut self, count: u32) -> Self {
        self.lane_count = count;
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

pub(crate) struct PoolInner {
    pub path: PathBuf,
    pub session: u64,
    pub header: PoolHeader,
    pub map: PoolMap,
    pub heap: Heap,
    pub lanes: LaneSet,
    recovery: RecoveryResult,
    root_lock: Mutex<()>,
    closed: AtomicBool,
    file: File,
}

impl PoolInner {
    /// Fails once the pool is closed, or damaged by a failed undo replay
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PmkvError::PoolClosed);
        }
        self.lanes.check()
    }

    /// Validate an allocation request against the layout
    pub fn check_type(&self, tag: TypeTag, size: u64) -> Result<()> {
        self.ensure_open()?;

        let desc = self.header.schema.describe(tag).ok_or_else(|| {
            PmkvError::InvalidArgument(format!(
                "type tag {} is not part of layout {:?}",
                tag.0, self.header.schema.layout
            ))
        })?;

        if size == 0 || size < desc.min_size {
            return Err(PmkvError::InvalidArgument(format!(
                "{} bytes is below the minimum of {} for type {:?}",
                size,
                desc.min_size.max(1),
                desc.name
            )));
        }

        Ok(())
    }
}

/// An open pool.
///
/// Cloning is cheap and shares the mapping. Closing through any clone closes
/// the pool for all of them.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a new pool file of `size` bytes.
    ///
    /// Fails with `AlreadyExists` if a pool is already at `path`. An empty
    /// file, or one left by a create that died before writing the magic, is
    /// formatted over.
    pub fn create(path: impl AsRef<Path>, size: u64, mode: u32, options: &PoolOptions) -> Result<Self> {
        let path = path.as_ref();
        check_path(path)?;
        options.schema.validate()?;
        let header = PoolHeader::layout(size, options.lane_count, options.schema.clone())?;

        let file = match create_file(path, mode) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !is_unformatted(path)? {
                    return Err(PmkvError::AlreadyExists(path.to_path_buf()));
                }
                warn!(path = %path.display(), "formatting over an unformatted pool file");
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                // Drop stale bytes; format zero-fills back up to size
                file.set_len(0)?;
                file
            }
            Err(e) => return Err(e.into()),
        };

        match Self::format(path, file, header, options.durability) {
            Ok(pool) => Ok(pool),
            Err(e) => {
                // Never leave a half-formatted pool behind
                let _ = fs::remove_file(path);
                Err(e)
            }
        }
    }

    fn format(path: &Path, file: File, header: PoolHeader, durability: Durability) -> Result<Self> {
        file.set_len(header.pool_size)?;
        let map = PoolMap::new(&file, durability)?;

        // Step 1: static area (everything but the magic) and mutable fields
        let image = header.encode()?;
        map.write_bytes(8, &image[8..]);
        map.write_u64(ROOT_FIELD, 0);
        map.write_u64(HEAP_TOP_FIELD, header.heap_offset);
        map.persist(0, HEADER_SIZE)?;

        // Step 2: magic last, so a torn create is never mistaken for a pool
        map.write_bytes(0, &image[..8]);
        map.persist(0, 8)?;
        if durability == Durability::Flush {
            file.sync_all()?;
        }

        info!(
            path = %path.display(),
            size = header.pool_size,
            lanes = header.lane_count,
            layout = %header.schema.layout,
            "pool created"
        );

        let heap = Heap::empty(header.heap_offset, header.heap_end());
        Ok(Self::assemble(path, file, header, map, heap, RecoveryResult::default()))
    }

    /// Open an existing pool, running recovery first.
    ///
    /// Fails with `LayoutMismatch` if the pool was created with another
    /// layout, and with `Corrupted` if its metadata is damaged.
    pub fn open(path: impl AsRef<Path>, options: &PoolOptions) -> Result<Self> {
        let path = path.as_ref();
        check_path(path)?;

        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PmkvError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata()?.len();
        if len < HEADER_SIZE {
            return Err(PmkvError::Corrupted(format!(
                "file is {} bytes, smaller than a pool header",
                len
            )));
        }

        let map = PoolMap::new(&file, options.durability)?;
        let header = PoolHeader::decode(&map.read_vec(0, HEADER_SIZE))?;
        if header.pool_size != map.len() {
            return Err(PmkvError::Corrupted(format!(
                "header says {} bytes, file has {}",
                header.pool_size,
                map.len()
            )));
        }
        options.schema.expect_matches(&header.schema)?;

        let (heap, recovery) = recovery::recover(&map, &header)?;

        info!(
            path = %path.display(),
            size = header.pool_size,
            objects = recovery.blocks_allocated,
            "pool opened"
        );

        Ok(Self::assemble(path, file, header, map, heap, recovery))
    }

    /// Open the pool at `path` if there is one, create it otherwise.
    ///
    /// An unformatted file counts as no pool. With `force_create`, any
    /// existing file is discarded first.
    pub fn open_or_create(
        path: impl AsRef<Path>,
        size: u64,
        mode: u32,
        force_create: bool,
        options: &PoolOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        check_path(path)?;

        if force_create {
            match fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "removed existing pool"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Self::create(path, size, mode, options);
        }

        if path.exists() && !is_unformatted(path)? {
            Self::open(path, options)
        } else {
            Self::create(path, size, mode, options)
        }
    }

    /// Flush and close the pool. Later use of any clone fails with `PoolClosed`.
    pub fn close(self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(PmkvError::PoolClosed);
        }

        self.inner.map.persist_all()?;
        if self.inner.map.durability() == Durability::Flush {
            self.inner.file.sync_all()?;
        }

        info!(path = %self.inner.path.display(), "pool closed");
        Ok(())
    }

    /// Audit a pool file without opening it
    pub fn check(path: impl AsRef<Path>, options: &PoolOptions) -> CheckStatus {
        check::audit(path.as_ref(), options)
    }

    fn assemble(
        path: &Path,
        file: File,
        header: PoolHeader,
        map: PoolMap,
        heap: Heap,
        recovery: RecoveryResult,
    ) -> Self {
        let lanes = LaneSet::new(&header);
        Self {
            inner: Arc::new(PoolInner {
                path: path.to_path_buf(),
                session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
                header,
                map,
                heap,
                lanes,
                recovery,
                root_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                file,
            }),
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Begin a transaction on the calling thread.
    ///
    /// Fails with `NestedTransaction` if this thread already has one open on
    /// this pool. Blocks while every lane is in use.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        Transaction::begin(self)
    }

    /// Run `body` in a transaction: commit if it returns `Ok`, abort if it
    /// returns `Err`.
    pub fn transaction<'a, T, F>(&'a self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'a>) -> Result<T>,
    {
        let mut tx = self.begin()?;
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = tx.abort() {
                    warn!(error = %abort_err, "abort after failed transaction body");
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Atomically allocate and initialize an object outside a transaction.
    ///
    /// The initializer sees `size` zeroed bytes. The object is visible only
    /// if the initializer succeeds and the allocation becomes durable.
    pub fn allocate<F>(&self, tag: TypeTag, size: u64, init: F) -> Result<ObjRef>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let inner = &self.inner;
        inner.check_type(tag, size)?;

        let payload = inner.heap.reserve(&inner.map, tag, size)?;
        if let Err(e) = inner.heap.commit(&inner.map, payload, init) {
            inner.heap.release(&inner.map, &[payload]);
            return Err(e);
        }

        Ok(ObjRef::new(inner.header.pool_id, payload, tag))
    }

    /// Atomically free an object outside a transaction
    pub fn free(&self, oid: &ObjRef) -> Result<()> {
        self.object(oid)?;
        self.inner.heap.free(&self.inner.map, oid.offset())
    }

    /// The pool's root object, allocated zeroed on first use.
    ///
    /// Repeated calls return the same reference.
    pub fn root(&self, tag: TypeTag, size: u64) -> Result<ObjRef> {
        let inner = &self.inner;
        inner.check_type(tag, size)?;

        let _guard = inner.root_lock.lock();

        let current = inner.map.read_u64(ROOT_FIELD);
        if current != 0 {
            let oid = ObjRef::new(inner.header.pool_id, current, tag);
            let object = self.object(&oid)?;
            if size > object.len() {
                return Err(PmkvError::InvalidArgument(format!(
                    "root is {} bytes, {} requested",
                    object.len(),
                    size
                )));
            }
            return Ok(oid);
        }

        // Published before it commits; recovery clears a root that never did
        let payload = inner.heap.reserve(&inner.map, tag, size)?;
        inner.map.write_u64(ROOT_FIELD, payload);
        inner.map.persist(ROOT_FIELD, 8)?;

        if let Err(e) = inner.heap.commit(&inner.map, payload, |_| Ok(())) {
            inner.map.write_u64(ROOT_FIELD, 0);
            inner.map.persist(ROOT_FIELD, 8)?;
            inner.heap.release(&inner.map, &[payload]);
            return Err(e);
        }

        debug!(offset = payload, "root object allocated");
        Ok(ObjRef::new(inner.header.pool_id, payload, tag))
    }

    /// Dereference an object for reading.
    ///
    /// Fails with `InvalidReference` if the reference is null, belongs to
    /// another pool, points at a freed block or names another type.
    pub fn object(&self, oid: &ObjRef) -> Result<Object<'_>> {
        let inner = &self.inner;
        inner.ensure_open()?;

        if oid.is_null() {
            return Err(PmkvError::InvalidReference("null reference".to_string()));
        }
        if oid.pool_id() != inner.header.pool_id {
            return Err(PmkvError::InvalidReference(format!(
                "reference belongs to pool {:#x}",
                oid.pool_id()
            )));
        }

        let header = inner.heap.header(&inner.map, oid.offset())?;
        if header.state != BlockState::Allocated {
            return Err(PmkvError::InvalidReference(format!(
                "object at {} is not allocated",
                oid.offset()
            )));
        }
        if header.type_tag != oid.type_tag() {
            return Err(PmkvError::InvalidReference(format!(
                "object at {} has type {}, not {}",
                oid.offset(),
                header.type_tag.0,
                oid.type_tag().0
            )));
        }

        Ok(Object::new(&inner.map, *oid, header))
    }

    /// Rebuild a reference from an offset stored inside another object.
    ///
    /// Returns the null reference for offset 0. Not validated until used.
    pub fn resolve(&self, offset: u64, tag: TypeTag) -> ObjRef {
        if offset == 0 {
            return ObjRef::null();
        }
        ObjRef::new(self.inner.header.pool_id, offset, tag)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn pool_id(&self) -> u64 {
        self.inner.header.pool_id
    }

    /// Size of the pool file in bytes
    pub fn size(&self) -> u64 {
        self.inner.header.pool_size
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.header.schema
    }

    pub fn lane_count(&self) -> u32 {
        self.inner.header.lane_count
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.inner.heap.stats()
    }

    /// What recovery did when this pool was opened
    pub fn recovery(&self) -> &RecoveryResult {
        &self.inner.recovery
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn inner(&self) -> &PoolInner {
        &self.inner
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("path", &self.inner.path)
            .field("pool_id", &format_args!("{:#x}", self.inner.header.pool_id))
            .field("size", &self.inner.header.pool_size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn check_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(PmkvError::InvalidArgument("empty pool path".to_string()));
    }
    Ok(())
}

/// True if `path` holds no pool magic: empty, or a create that never
/// reached its last step
fn is_unformatted(path: &Path) -> Result<bool> {
    let mut magic = Vec::with_capacity(POOL_MAGIC.len());
    File::open(path)?
        .take(POOL_MAGIC.len() as u64)
        .read_to_end(&mut magic)?;
    Ok(magic.iter().all(|&b| b == 0))
}

#[cfg(unix)]
fn create_file(path: &Path, mode: u32) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn create_file(path: &Path, _mode: u32) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
}
