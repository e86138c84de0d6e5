//! Tests for the persistent allocator
//!
//! These tests verify:
//! - Atomic allocation with initializers
//! - Validated dereferencing (type, liveness, pool identity)
//! - Free and reuse of blocks
//! - Pool exhaustion
//! - The root object

use pmkv::alloc::{ObjRef, BLOCK_HEADER_SIZE};
use pmkv::pool::{Schema, TypeTag, DEFAULT_MODE, HEADER_SIZE, LANE_SIZE, MIN_HEAP_SIZE};
use pmkv::{Durability, PmkvError, Pool, PoolOptions};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const NODE: TypeTag = TypeTag(1);
const LEAF: TypeTag = TypeTag(2);
const ROOT: TypeTag = TypeTag(3);

fn options() -> PoolOptions {
    let schema = Schema::new("alloc-tests", 1)
        .with_type(NODE, "node", 8, 8)
        .with_type(LEAF, "leaf", 1, 8)
        .with_type(ROOT, "root", 64, 8);
    PoolOptions::new(schema)
        .lane_count(1)
        .durability(Durability::Process)
}

fn setup_pool(size: u64) -> (TempDir, Pool) {
    let temp = TempDir::new().unwrap();
    let pool = Pool::create(temp.path().join("alloc.pool"), size, DEFAULT_MODE, &options()).unwrap();
    (temp, pool)
}

fn reopen(temp: &TempDir, pool: Pool) -> Pool {
    pool.close().unwrap();
    Pool::open(temp.path().join("alloc.pool"), &options()).unwrap()
}

/// Smallest pool with one lane: exactly 64 KiB of heap
fn minimal_size() -> u64 {
    HEADER_SIZE + LANE_SIZE + MIN_HEAP_SIZE
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_allocate_initializer_sees_zeroed_memory() {
    let (_temp, pool) = setup_pool(1024 * 1024);

    let oid = pool
        .allocate(NODE, 100, |buf| {
            assert_eq!(buf.len(), 100);
            assert!(buf.iter().all(|&b| b == 0));
            buf[..5].copy_from_slice(b"hello");
            Ok(())
        })
        .unwrap();

    let object = pool.object(&oid).unwrap();
    assert_eq!(object.requested_len(), 100);
    assert!(object.len() >= 100);
    assert_eq!(object.read_vec(0, 5).unwrap(), b"hello");
    assert_eq!(object.read_vec(5, 95).unwrap(), vec![0u8; 95]);
    assert_eq!(oid.type_tag(), NODE);
    assert_eq!(oid.pool_id(), pool.pool_id());
}

#[test]
fn test_allocate_word_reads() {
    let (_temp, pool) = setup_pool(1024 * 1024);

    let oid = pool
        .allocate(NODE, 16, |buf| {
            buf[0..8].copy_from_slice(&0xDEAD_BEEF_u64.to_le_bytes());
            buf[8..12].copy_from_slice(&7u32.to_le_bytes());
            Ok(())
        })
        .unwrap();

    let object = pool.object(&oid).unwrap();
    assert_eq!(object.read_u64(0).unwrap(), 0xDEAD_BEEF);
    assert_eq!(object.read_u32(8).unwrap(), 7);
}

#[test]
fn test_object_reads_are_bounds_checked() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let oid = pool.allocate(NODE, 8, |_| Ok(())).unwrap();
    let object = pool.object(&oid).unwrap();

    assert!(matches!(
        object.read_vec(object.len() - 4, 8),
        Err(PmkvError::InvalidArgument(_))
    ));
    assert!(matches!(object.read_u64(u64::MAX), Err(PmkvError::InvalidArgument(_))));
}

#[test]
fn test_allocate_unknown_type_fails() {
    let (_temp, pool) = setup_pool(1024 * 1024);

    let result = pool.allocate(TypeTag(99), 8, |_| Ok(()));

    assert!(matches!(result, Err(PmkvError::InvalidArgument(_))));
}

#[test]
fn test_allocate_below_type_minimum_fails() {
    let (_temp, pool) = setup_pool(1024 * 1024);

    assert!(matches!(
        pool.allocate(NODE, 4, |_| Ok(())),
        Err(PmkvError::InvalidArgument(_))
    ));
    assert!(matches!(
        pool.allocate(LEAF, 0, |_| Ok(())),
        Err(PmkvError::InvalidArgument(_))
    ));
}

#[test]
fn test_initializer_failure_leaves_nothing_behind() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let before = pool.heap_stats();

    let result = pool.allocate(NODE, 64, |_| {
        Err(PmkvError::InvalidArgument("refused".to_string()))
    });

    assert!(matches!(result, Err(PmkvError::AllocationFailed(_))));
    let after = pool.heap_stats();
    assert_eq!(after.live_blocks, before.live_blocks);

    // The block went back on a free list and is reused
    let first = pool.allocate(NODE, 64, |_| Ok(())).unwrap();
    assert_eq!(pool.heap_stats().heap_used, after.heap_used);
    assert!(pool.object(&first).is_ok());
}

// =============================================================================
// Free Tests
// =============================================================================

#[test]
fn test_free_invalidates_reference() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let oid = pool.allocate(NODE, 8, |_| Ok(())).unwrap();

    pool.free(&oid).unwrap();

    assert!(matches!(pool.object(&oid), Err(PmkvError::InvalidReference(_))));
}

#[test]
fn test_double_free_fails() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let oid = pool.allocate(NODE, 8, |_| Ok(())).unwrap();
    pool.free(&oid).unwrap();

    assert!(matches!(pool.free(&oid), Err(PmkvError::InvalidReference(_))));
}

#[test]
fn test_free_null_fails() {
    let (_temp, pool) = setup_pool(1024 * 1024);

    assert!(ObjRef::null().is_null());
    assert!(matches!(
        pool.free(&ObjRef::null()),
        Err(PmkvError::InvalidReference(_))
    ));
}

#[test]
fn test_freed_block_is_reused_for_same_class() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let first = pool.allocate(NODE, 200, |_| Ok(())).unwrap();
    pool.free(&first).unwrap();

    let second = pool.allocate(LEAF, 150, |_| Ok(())).unwrap();

    assert_eq!(second.offset(), first.offset());
    assert_eq!(second.type_tag(), LEAF);
}

#[test]
fn test_freed_reference_does_not_alias_reused_block_type() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let first = pool.allocate(NODE, 200, |_| Ok(())).unwrap();
    pool.free(&first).unwrap();
    let _second = pool.allocate(LEAF, 150, |_| Ok(())).unwrap();

    // Same offset, different type: the stale reference is rejected
    assert!(matches!(pool.object(&first), Err(PmkvError::InvalidReference(_))));
}

#[test]
fn test_free_survives_reopen() {
    let (temp, pool) = setup_pool(1024 * 1024);
    let kept = pool.allocate(NODE, 8, |_| Ok(())).unwrap();
    let dropped = pool.allocate(NODE, 8, |_| Ok(())).unwrap();
    pool.free(&dropped).unwrap();

    let pool = reopen(&temp, pool);

    assert!(pool.object(&kept).is_ok());
    assert!(matches!(pool.object(&dropped), Err(PmkvError::InvalidReference(_))));
    assert_eq!(pool.recovery().blocks_allocated, 1);
    assert_eq!(pool.recovery().blocks_free, 1);
}

// =============================================================================
// Reference Validation Tests
// =============================================================================

#[test]
fn test_reference_from_other_pool_rejected() {
    let (_temp_a, pool_a) = setup_pool(1024 * 1024);
    let (_temp_b, pool_b) = setup_pool(1024 * 1024);
    let oid = pool_a.allocate(NODE, 8, |_| Ok(())).unwrap();

    assert!(matches!(pool_b.object(&oid), Err(PmkvError::InvalidReference(_))));
}

#[test]
fn test_resolve_with_wrong_type_rejected() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let oid = pool.allocate(NODE, 8, |_| Ok(())).unwrap();

    let wrong = pool.resolve(oid.offset(), LEAF);
    let right = pool.resolve(oid.offset(), NODE);

    assert!(matches!(pool.object(&wrong), Err(PmkvError::InvalidReference(_))));
    assert!(pool.object(&right).is_ok());
    assert!(pool.resolve(0, NODE).is_null());
}

#[test]
fn test_resolve_garbage_offset_rejected() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let oid = pool.allocate(NODE, 8, |_| Ok(())).unwrap();

    // Inside the payload, not at a block boundary
    let inside = pool.resolve(oid.offset() + 8, NODE);
    // Beyond the heap top
    let beyond = pool.resolve(pool.size() - 64, NODE);

    assert!(matches!(pool.object(&inside), Err(PmkvError::InvalidReference(_))));
    assert!(matches!(pool.object(&beyond), Err(PmkvError::InvalidReference(_))));
}

// =============================================================================
// Exhaustion Tests
// =============================================================================

#[test]
fn test_out_of_memory() {
    let (_temp, pool) = setup_pool(minimal_size());

    // One block of exactly the whole heap
    let big = pool
        .allocate(NODE, MIN_HEAP_SIZE - BLOCK_HEADER_SIZE, |_| Ok(()))
        .unwrap();

    assert!(matches!(
        pool.allocate(NODE, 8, |_| Ok(())),
        Err(PmkvError::OutOfMemory { .. })
    ));

    // Freeing makes room again (a larger free block is used)
    pool.free(&big).unwrap();
    assert!(pool.allocate(NODE, 8, |_| Ok(())).is_ok());
}

#[test]
fn test_request_larger_than_heap() {
    let (_temp, pool) = setup_pool(minimal_size());

    assert!(matches!(
        pool.allocate(NODE, MIN_HEAP_SIZE, |_| Ok(())),
        Err(PmkvError::OutOfMemory { .. })
    ));
}

// =============================================================================
// Root Tests
// =============================================================================

#[test]
fn test_root_is_zeroed_and_idempotent() {
    let (_temp, pool) = setup_pool(1024 * 1024);

    let first = pool.root(ROOT, 64).unwrap();
    let second = pool.root(ROOT, 64).unwrap();

    assert_eq!(first, second);
    let object = pool.object(&first).unwrap();
    assert_eq!(object.read_vec(0, 64).unwrap(), vec![0u8; 64]);
}

#[test]
fn test_root_survives_reopen() {
    let (temp, pool) = setup_pool(1024 * 1024);
    let root = pool.root(ROOT, 64).unwrap();

    let pool = reopen(&temp, pool);

    assert_eq!(pool.root(ROOT, 64).unwrap(), root);
}

#[test]
fn test_root_with_other_type_fails() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    pool.root(ROOT, 64).unwrap();

    assert!(matches!(pool.root(NODE, 64), Err(PmkvError::InvalidReference(_))));
}

#[test]
fn test_root_larger_than_stored_fails() {
    let (_temp, pool) = setup_pool(1024 * 1024);
    let root = pool.root(ROOT, 64).unwrap();
    let capacity = pool.object(&root).unwrap().len();

    assert!(matches!(
        pool.root(ROOT, capacity + 1),
        Err(PmkvError::InvalidArgument(_))
    ));
}
