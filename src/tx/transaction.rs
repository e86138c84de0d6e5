//! Undo-log transactions
//!
//! A [`Transaction`] groups mutations of persistent objects so that after a
//! crash either all of them are visible or none are.
//!
//! ## Lifecycle
//! ```text
//!            begin                 commit
//!   None ───────────► Active ─────────────────► Committed ──┐
//!                       │                                    │ finally
//!                       │  abort / error / drop              ▼
//!                       └───────────────────────► Aborted ─► None
//! ```
//!
//! ## Commit protocol
//! 1. Every registered range is persisted
//! 2. The lane state flips to `Committed` (the commit point)
//! 3. Deferred frees are persisted
//! 4. The lane is reset to `Idle` and handed back
//!
//! A crash before step 2 rolls the transaction back on the next open; a crash
//! after it only has step 3 left to redo.

use std::cell::RefCell;
use std::marker::PhantomData;

use tracing::{debug, trace, warn};

use crate::alloc::{Heap, ObjRef};
use crate::error::{PmkvError, Result};
use crate::pool::{Pool, TypeTag};

use super::lane::{Lane, LaneReplay, LaneState};
use super::record::UndoRecord;
use super::TxState;

thread_local! {
    /// Pool sessions with a transaction open on this thread
    static OPEN_SESSIONS: RefCell<Vec<u64>> = RefCell::new(Vec::new());
}

type Hook<'p> = Box<dyn FnOnce() + 'p>;

/// An in-flight transaction on one pool.
///
/// Not `Send`: a transaction belongs to the thread that began it. Dropping an
/// active transaction aborts it.
pub struct Transaction<'p> {
    pool: &'p Pool,
    lane: Lane,
    state: TxState,

    /// Bytes of the lane's record area in use
    used: u64,
    /// Records appended so far
    count: u64,

    /// Absolute ranges registered for mutation
    ranges: Vec<(u64, u64)>,
    /// Payloads allocated by this transaction
    allocated: Vec<u64>,
    /// Payloads freed by this transaction (deferred to commit)
    freed: Vec<u64>,
    /// Payloads persisted as free that may be reused once the lane is idle
    orphaned: Vec<u64>,

    on_commit: Vec<Hook<'p>>,
    on_abort: Vec<Hook<'p>>,
    finally: Vec<Hook<'p>>,

    _not_send: PhantomData<*const ()>,
}

impl<'p> Transaction<'p> {
    pub(crate) fn begin(pool: &'p Pool) -> Result<Self> {
        let inner = pool.inner();
        inner.ensure_open()?;

        let session = inner.session;
        let nested = OPEN_SESSIONS.with(|open| {
            let mut open = open.borrow_mut();
            if open.contains(&session) {
                true
            } else {
                open.push(session);
                false
            }
        });
        if nested {
            return Err(PmkvError::NestedTransaction);
        }

        let lane = match inner.lanes.acquire() {
            Ok(lane) => lane,
            Err(e) => {
                leave_session(session);
                return Err(e);
            }
        };
        if let Err(e) = lane.set_state(&inner.map, LaneState::Active) {
            inner.lanes.release(lane);
            leave_session(session);
            return Err(e);
        }

        trace!(lane = lane.id, "transaction begin");

        Ok(Self {
            pool,
            lane,
            state: TxState::Active,
            used: 0,
            count: 0,
            ranges: Vec::new(),
            allocated: Vec::new(),
            freed: Vec::new(),
            orphaned: Vec::new(),
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            finally: Vec::new(),
            _not_send: PhantomData,
        })
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    // =========================================================================
    // Mutation Registration
    // =========================================================================

    /// Register a whole object for mutation
    pub fn add(&mut self, oid: &ObjRef) -> Result<()> {
        let len = self.pool.object(oid)?.len();
        self.add_range(oid, 0, len)
    }

    /// Register `[at, at + len)` of an object for mutation.
    ///
    /// Snapshots the current contents into the undo log, unless the range is
    /// already covered or the object was allocated by this transaction.
    pub fn add_range(&mut self, oid: &ObjRef, at: u64, len: u64) -> Result<()> {
        let abs = self.resolve(oid, at, len)?;
        if len == 0 || self.covers(abs, len) {
            return Ok(());
        }

        if !self.allocated.contains(&oid.offset()) {
            let pre_image = self.pool.inner().map.read_vec(abs, len);
            self.log(UndoRecord::snapshot(abs, pre_image))?;
        }

        self.ranges.push((abs, len));
        Ok(())
    }

    /// Write bytes into a registered range
    pub fn write(&mut self, oid: &ObjRef, at: u64, data: &[u8]) -> Result<()> {
        let abs = self.writable(oid, at, data.len() as u64)?;
        self.pool.inner().map.write_bytes(abs, data);
        Ok(())
    }

    /// Write a little-endian u64 into a registered range
    pub fn write_u64(&mut self, oid: &ObjRef, at: u64, value: u64) -> Result<()> {
        let abs = self.writable(oid, at, 8)?;
        let map = &self.pool.inner().map;
        if abs % 8 == 0 {
            map.write_u64(abs, value);
        } else {
            map.write_bytes(abs, &value.to_le_bytes());
        }
        Ok(())
    }

    /// Write a little-endian u32 into a registered range
    pub fn write_u32(&mut self, oid: &ObjRef, at: u64, value: u32) -> Result<()> {
        let abs = self.writable(oid, at, 4)?;
        let map = &self.pool.inner().map;
        if abs % 4 == 0 {
            map.write_u32(abs, value);
        } else {
            map.write_bytes(abs, &value.to_le_bytes());
        }
        Ok(())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate an object whose existence is tied to this transaction.
    ///
    /// The initializer sees zeroed bytes. If the transaction aborts, the
    /// object is freed again. The new object is writable without a snapshot.
    pub fn alloc<F>(&mut self, tag: TypeTag, size: u64, init: F) -> Result<ObjRef>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let pool = self.pool;
        let inner = pool.inner();
        inner.check_type(tag, size)?;

        let payload = inner.heap.reserve(&inner.map, tag, size)?;

        if let Err(e) = self.log(UndoRecord::alloc(payload)) {
            // Unlogged, so nobody else can reach the block
            Heap::mark_free(&inner.map, payload)?;
            inner.heap.release(&inner.map, &[payload]);
            return Err(e);
        }
        self.allocated.push(payload);

        if let Err(e) = inner.heap.commit(&inner.map, payload, init) {
            // Persisted as free already; reusable once the log is discarded
            self.orphaned.push(payload);
            return Err(e);
        }

        let oid = ObjRef::new(inner.header.pool_id, payload, tag);
        self.ranges.push((payload, inner.heap.header(&inner.map, payload)?.capacity()));
        Ok(oid)
    }

    /// Free an object when (and only if) this transaction commits
    pub fn free(&mut self, oid: &ObjRef) -> Result<()> {
        self.pool.object(oid)?;

        if self.freed.contains(&oid.offset()) {
            return Err(PmkvError::InvalidReference(format!(
                "object at {} already freed in this transaction",
                oid.offset()
            )));
        }

        self.log(UndoRecord::free(oid.offset()))?;
        self.freed.push(oid.offset());
        Ok(())
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Run `action` after a successful commit
    pub fn on_commit(&mut self, action: impl FnOnce() + 'p) {
        self.on_commit.push(Box::new(action));
    }

    /// Run `action` after an abort
    pub fn on_abort(&mut self, action: impl FnOnce() + 'p) {
        self.on_abort.push(Box::new(action));
    }

    /// Run `action` once the transaction has ended either way
    pub fn finally(&mut self, action: impl FnOnce() + 'p) {
        self.finally.push(Box::new(action));
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Make every registered mutation durable atomically.
    ///
    /// If the commit cannot reach its commit point, the transaction is rolled
    /// back and the error returned.
    pub fn commit(mut self) -> Result<()> {
        let pool = self.pool;
        let inner = pool.inner();

        // Step 1: registered ranges durable
        let mut result = self
            .ranges
            .iter()
            .try_for_each(|&(offset, len)| inner.map.persist(offset, len));

        // Step 2: commit point
        if result.is_ok() {
            result = self.lane.set_state(&inner.map, LaneState::Committed);
        }

        if let Err(e) = result {
            warn!(lane = self.lane.id, error = %e, "commit failed, rolling back");
            let _ = self.end(TxState::Aborted);
            return Err(e);
        }

        // Steps 3 and 4
        self.end(TxState::Committed)
    }

    /// Roll back every registered mutation and allocation
    pub fn abort(mut self) -> Result<()> {
        self.end(TxState::Aborted)
    }

    fn end(&mut self, outcome: TxState) -> Result<()> {
        let pool = self.pool;
        let inner = pool.inner();

        let replay = match outcome {
            TxState::Committed => self.lane.complete(&inner.map),
            _ => self.lane.rollback(&inner.map),
        };

        let result = match replay {
            Ok(LaneReplay { records, mut released }) => {
                released.append(&mut self.orphaned);
                inner.heap.release(&inner.map, &released);
                inner.lanes.release(self.lane);
                debug!(lane = self.lane.id, records, outcome = ?outcome, "transaction ended");
                Ok(())
            }
            Err(e) => {
                warn!(lane = self.lane.id, error = %e, "undo log replay failed");
                inner.lanes.poison(self.lane);
                Err(e)
            }
        };

        self.state = outcome;
        leave_session(inner.session);

        let hooks = match outcome {
            TxState::Committed => std::mem::take(&mut self.on_commit),
            _ => std::mem::take(&mut self.on_abort),
        };
        for hook in hooks {
            hook();
        }
        for hook in std::mem::take(&mut self.finally) {
            hook();
        }

        self.state = TxState::None;
        result
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn log(&mut self, record: UndoRecord) -> Result<()> {
        let needed = record.encoded_len();
        let available = self.lane.capacity() - self.used;
        if needed > available {
            return Err(PmkvError::UndoLogFull {
                needed: needed as usize,
                available: available as usize,
            });
        }

        self.used = self
            .lane
            .append(&self.pool.inner().map, self.used, self.count, &record)?;
        self.count += 1;
        Ok(())
    }

    /// Absolute offset of `[at, at + len)` inside a live object
    fn resolve(&self, oid: &ObjRef, at: u64, len: u64) -> Result<u64> {
        let object = self.pool.object(oid)?;
        match at.checked_add(len) {
            Some(end) if end <= object.len() => Ok(oid.offset() + at),
            _ => Err(PmkvError::InvalidArgument(format!(
                "range {}+{} outside object of {} bytes",
                at,
                len,
                object.len()
            ))),
        }
    }

    fn writable(&self, oid: &ObjRef, at: u64, len: u64) -> Result<u64> {
        let abs = self.resolve(oid, at, len)?;
        if len > 0 && !self.covers(abs, len) {
            return Err(PmkvError::NotRegistered(format!(
                "range {}+{} of object {} written without add_range",
                at,
                len,
                oid.offset()
            )));
        }
        Ok(abs)
    }

    fn covers(&self, abs: u64, len: u64) -> bool {
        self.ranges
            .iter()
            .any(|&(offset, size)| offset <= abs && abs + len <= offset + size)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            debug!(lane = self.lane.id, "active transaction dropped, aborting");
            let _ = self.end(TxState::Aborted);
        }
    }
}

fn leave_session(session: u64) {
    OPEN_SESSIONS.with(|open| open.borrow_mut().retain(|&s| s != session));
}
