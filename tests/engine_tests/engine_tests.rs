//! Tests for Engine
//!
//! These tests verify:
//! - Basic get/put/delete/exists/count operations
//! - Overwrite paths (in place and by replacement)
//! - Command execution and status codes
//! - Engine lifecycle (open/close/reopen/force_create/check)
//! - Out-of-space behavior
//! - Agreement with an in-memory model over a random workload

use std::collections::HashMap;
use std::path::Path;

use pmkv::kv::IN_PLACE_MAX;
use pmkv::pool::{HEADER_SIZE, LANE_SIZE, MIN_HEAP_SIZE};
use pmkv::protocol::{Command, Status};
use pmkv::{CheckStatus, Config, Durability, Engine, PmkvError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(path: &Path) -> Config {
    Config::builder()
        .path(path)
        .pool_size(8 * 1024 * 1024)
        .lane_count(4)
        .bucket_count(64)
        .durability(Durability::Process)
        .build()
}

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = Engine::open(test_config(&temp_dir.path().join("kv.pool"))).unwrap();
    (temp_dir, engine)
}

fn get(engine: &Engine, key: &[u8]) -> Option<Vec<u8>> {
    engine.get(key).unwrap().map(|value| value.to_vec())
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_engine_open_creates_pool() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    let engine = Engine::open(test_config(&path)).unwrap();

    assert!(path.exists());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 8 * 1024 * 1024);
    assert_eq!(engine.count().unwrap(), 0);
    assert_eq!(engine.bucket_count(), 64);
}

#[test]
fn test_engine_put_get() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key1", b"value1").unwrap();

    assert_eq!(get(&engine, b"key1"), Some(b"value1".to_vec()));
}

#[test]
fn test_engine_get_nonexistent_key() {
    let (_temp, engine) = setup_temp_engine();

    assert_eq!(get(&engine, b"nonexistent"), None);
}

#[test]
fn test_engine_keys_with_embedded_nul() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"a\0b", b"stuff").unwrap();
    engine.put(b"a", b"should_not_change").unwrap();
    assert_eq!(engine.count().unwrap(), 2);

    assert!(engine.delete(b"a\0b").unwrap());

    assert_eq!(engine.count().unwrap(), 1);
    assert_eq!(get(&engine, b"a\0b"), None);
    assert_eq!(get(&engine, b"a"), Some(b"should_not_change".to_vec()));
}

#[test]
fn test_engine_empty_key_and_value() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"", b"empty key").unwrap();
    engine.put(b"empty value", b"").unwrap();

    assert_eq!(get(&engine, b""), Some(b"empty key".to_vec()));
    assert_eq!(get(&engine, b"empty value"), Some(Vec::new()));
    assert!(engine.exists(b"empty value").unwrap());
    assert_eq!(engine.count().unwrap(), 2);
}

#[test]
fn test_engine_keys_are_exact_bytes() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"plain").unwrap();
    engine.put(b"key ", b"trailing space").unwrap();
    engine.put(b"KEY", b"upper").unwrap();

    assert_eq!(get(&engine, b"key"), Some(b"plain".to_vec()));
    assert_eq!(get(&engine, b"key "), Some(b"trailing space".to_vec()));
    assert_eq!(get(&engine, b"KEY"), Some(b"upper".to_vec()));
    assert_eq!(get(&engine, b"ke"), None);
    assert_eq!(engine.count().unwrap(), 3);
}

#[test]
fn test_engine_whitespace_keys_and_values() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");
    let engine = Engine::open(test_config(&path)).unwrap();

    engine.put(b"   ", b"three spaces").unwrap();
    engine.put(b"\t\n", b" ").unwrap();
    engine.put(b" ", b"\t\n").unwrap();
    engine.put(b"blank", b"   ").unwrap();
    engine.close().unwrap();

    // Whitespace is never trimmed, before or after a reopen
    let engine = Engine::open(test_config(&path)).unwrap();
    assert_eq!(get(&engine, b"   "), Some(b"three spaces".to_vec()));
    assert_eq!(get(&engine, b"\t\n"), Some(b" ".to_vec()));
    assert_eq!(get(&engine, b" "), Some(b"\t\n".to_vec()));
    assert_eq!(get(&engine, b"blank"), Some(b"   ".to_vec()));
    assert_eq!(get(&engine, b""), None);
    assert_eq!(get(&engine, b"  "), None);
    assert_eq!(engine.count().unwrap(), 4);

    assert!(engine.delete(b"   ").unwrap());
    assert!(engine.exists(b" ").unwrap());
    assert_eq!(get(&engine, b"   "), None);
}

#[test]
fn test_engine_binary_values() {
    let (_temp, engine) = setup_temp_engine();
    let value: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

    engine.put(&[0xff, 0x00, 0xfe], &value).unwrap();

    assert_eq!(get(&engine, &[0xff, 0x00, 0xfe]), Some(value));
}

#[test]
fn test_engine_exists() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"present", b"x").unwrap();

    assert!(engine.exists(b"present").unwrap());
    assert!(!engine.exists(b"absent").unwrap());
}

// =============================================================================
// Overwrite Tests
// =============================================================================

#[test]
fn test_engine_overwrite_same_length() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"aaaa").unwrap();
    engine.put(b"key", b"bbbb").unwrap();

    assert_eq!(get(&engine, b"key"), Some(b"bbbb".to_vec()));
    assert_eq!(engine.count().unwrap(), 1);
}

#[test]
fn test_engine_overwrite_shorter() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"a much longer value").unwrap();
    engine.put(b"key", b"short").unwrap();

    assert_eq!(get(&engine, b"key"), Some(b"short".to_vec()));
}

#[test]
fn test_engine_overwrite_longer() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"short").unwrap();
    let long = vec![b'x'; 3000];
    engine.put(b"key", &long).unwrap();

    assert_eq!(get(&engine, b"key"), Some(long));
    assert_eq!(engine.count().unwrap(), 1);
}

#[test]
fn test_engine_overwrite_large_values() {
    let (_temp, engine) = setup_temp_engine();
    let first = vec![1u8; IN_PLACE_MAX * 3];
    let second = vec![2u8; IN_PLACE_MAX * 2];
    let third = vec![3u8; 10];

    engine.put(b"big", &first).unwrap();
    engine.put(b"big", &second).unwrap();
    assert_eq!(get(&engine, b"big"), Some(second));

    engine.put(b"big", &third).unwrap();
    assert_eq!(get(&engine, b"big"), Some(third));
    assert_eq!(engine.count().unwrap(), 1);
}

#[test]
fn test_engine_overwrite_does_not_leak() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"v").unwrap();
    let live = engine.pool().heap_stats().live_blocks;

    for i in 0..200 {
        let value = vec![b'v'; (i * 37) % 6000];
        engine.put(b"key", &value).unwrap();
    }

    assert_eq!(engine.pool().heap_stats().live_blocks, live);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[test]
fn test_engine_delete() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"value").unwrap();
    assert!(engine.delete(b"key").unwrap());

    assert_eq!(get(&engine, b"key"), None);
    assert!(!engine.exists(b"key").unwrap());
    assert_eq!(engine.count().unwrap(), 0);
}

#[test]
fn test_engine_delete_absent_key_is_noop() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"other", b"value").unwrap();

    assert!(!engine.delete(b"missing").unwrap());
    assert_eq!(engine.count().unwrap(), 1);
}

#[test]
fn test_engine_delete_from_chain_middle() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("kv.pool"))
        .pool_size(4 * 1024 * 1024)
        .lane_count(2)
        .bucket_count(1)
        .durability(Durability::Process)
        .build();
    let engine = Engine::open(config).unwrap();

    // One bucket: every key shares a chain
    for i in 0..10 {
        engine.put(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes()).unwrap();
    }
    assert!(engine.delete(b"k5").unwrap());
    assert!(engine.delete(b"k0").unwrap());
    assert!(engine.delete(b"k9").unwrap());

    assert_eq!(engine.count().unwrap(), 7);
    for i in [1, 2, 3, 4, 6, 7, 8] {
        assert_eq!(
            get(&engine, format!("k{}", i).as_bytes()),
            Some(format!("v{}", i).into_bytes())
        );
    }
}

#[test]
fn test_engine_put_after_delete() {
    let (_temp, engine) = setup_temp_engine();

    engine.put(b"key", b"first").unwrap();
    engine.delete(b"key").unwrap();
    engine.put(b"key", b"second").unwrap();

    assert_eq!(get(&engine, b"key"), Some(b"second".to_vec()));
    assert_eq!(engine.count().unwrap(), 1);
}

// =============================================================================
// Limit Tests
// =============================================================================

#[test]
fn test_engine_value_too_large() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("kv.pool"))
        .pool_size(4 * 1024 * 1024)
        .lane_count(2)
        .max_value_len(1024)
        .durability(Durability::Process)
        .build();
    let engine = Engine::open(config).unwrap();

    let result = engine.put(b"key", &vec![0u8; 1025]);
    assert!(matches!(result, Err(PmkvError::ValueTooLarge { len: 1025, max: 1024 })));

    let response = engine.execute(Command::Put {
        key: b"key".to_vec(),
        value: vec![0u8; 1025],
    });
    assert_eq!(response.status, Status::InvalidArgument);
    assert_eq!(engine.count().unwrap(), 0);

    engine.put(b"key", &vec![0u8; 1024]).unwrap();
}

#[test]
fn test_engine_out_of_space_leaves_store_unchanged() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("kv.pool"))
        .pool_size(HEADER_SIZE + 2 * LANE_SIZE + MIN_HEAP_SIZE)
        .lane_count(2)
        .bucket_count(16)
        .durability(Durability::Process)
        .build();
    let engine = Engine::open(config).unwrap();
    let value = vec![b'v'; 10 * 1024];

    let mut stored = 0;
    let failure = loop {
        match engine.put(format!("key{}", stored).as_bytes(), &value) {
            Ok(()) => stored += 1,
            Err(e) => break e,
        }
        assert!(stored < 100, "pool never filled up");
    };

    assert!(matches!(failure, PmkvError::OutOfMemory { .. }));
    assert!(stored > 0);
    assert_eq!(engine.count().unwrap(), stored);
    assert_eq!(get(&engine, format!("key{}", stored).as_bytes()), None);

    // Growing an existing value needs space too; the old one stays
    let response = engine.execute(Command::Put {
        key: b"key0".to_vec(),
        value: vec![b'w'; 40 * 1024],
    });
    assert_eq!(response.status, Status::OutOfMemory);
    assert_eq!(get(&engine, b"key0"), Some(value));

    // Deleting makes room again
    assert!(engine.delete(b"key0").unwrap());
    engine.put(b"again", &vec![b'a'; 10 * 1024]).unwrap();
}

// =============================================================================
// Command Execution Tests
// =============================================================================

#[test]
fn test_execute_put_get() {
    let (_temp, engine) = setup_temp_engine();

    let response = engine.execute(Command::Put {
        key: b"key".to_vec(),
        value: b"value".to_vec(),
    });
    assert!(response.status.is_ok());

    let response = engine.execute(Command::Get { key: b"key".to_vec() });
    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.payload.as_deref(), Some(&b"value"[..]));
}

#[test]
fn test_execute_get_missing() {
    let (_temp, engine) = setup_temp_engine();

    let response = engine.execute(Command::Get { key: b"missing".to_vec() });

    assert_eq!(response.status, Status::NotFound);
    assert!(response.payload.is_none());
}

#[test]
fn test_execute_delete() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"key", b"value").unwrap();

    let first = engine.execute(Command::Delete { key: b"key".to_vec() });
    let second = engine.execute(Command::Delete { key: b"key".to_vec() });

    assert_eq!(first.status, Status::Ok);
    assert_eq!(second.status, Status::NotFound);
}

#[test]
fn test_execute_exists() {
    let (_temp, engine) = setup_temp_engine();
    engine.put(b"key", b"value").unwrap();

    let hit = engine.execute(Command::Exists { key: b"key".to_vec() });
    let miss = engine.execute(Command::Exists { key: b"nope".to_vec() });

    assert_eq!(hit.status, Status::Ok);
    assert!(hit.payload.is_none());
    assert_eq!(miss.status, Status::NotFound);
}

#[test]
fn test_execute_count() {
    let (_temp, engine) = setup_temp_engine();
    for i in 0..7 {
        engine.put(format!("k{}", i).as_bytes(), b"v").unwrap();
    }

    let response = engine.execute(Command::Count);

    assert_eq!(response.status, Status::Ok);
    assert_eq!(response.as_count(), Some(7));
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_engine_reopen_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    {
        let engine = Engine::open(test_config(&path)).unwrap();
        for i in 0..100 {
            engine.put(format!("key{}", i).as_bytes(), format!("{}!", i).as_bytes()).unwrap();
        }
        engine.delete(b"key50").unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(test_config(&path)).unwrap();
    assert_eq!(engine.count().unwrap(), 99);
    assert_eq!(get(&engine, b"key7"), Some(b"7!".to_vec()));
    assert_eq!(get(&engine, b"key50"), None);
}

#[test]
fn test_engine_reopen_keeps_bucket_count() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    let engine = Engine::open(test_config(&path)).unwrap();
    engine.put(b"key", b"value").unwrap();
    engine.close().unwrap();

    let mut config = test_config(&path);
    config.bucket_count = 4096;
    let engine = Engine::open(config).unwrap();

    assert_eq!(engine.bucket_count(), 64);
    assert_eq!(get(&engine, b"key"), Some(b"value".to_vec()));
}

#[test]
fn test_engine_force_create_discards_data() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    let engine = Engine::open(test_config(&path)).unwrap();
    engine.put(b"key", b"value").unwrap();
    engine.close().unwrap();

    let mut config = test_config(&path);
    config.force_create = true;
    let engine = Engine::open(config).unwrap();

    assert_eq!(engine.count().unwrap(), 0);
}

#[test]
fn test_engine_open_or_create() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    let engine = Engine::open_or_create(&path, 8 * 1024 * 1024, false).unwrap();
    engine.put(b"key", b"value").unwrap();
    engine.close().unwrap();

    let engine = Engine::open_or_create(&path, 8 * 1024 * 1024, false).unwrap();
    assert_eq!(get(&engine, b"key"), Some(b"value".to_vec()));
    engine.close().unwrap();

    let engine = Engine::open_or_create(&path, 8 * 1024 * 1024, true).unwrap();
    assert_eq!(engine.count().unwrap(), 0);
}

#[test]
fn test_engine_default_lanes_match_pool_default() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    let engine = Engine::open_or_create(&path, 8 * 1024 * 1024, false).unwrap();

    assert_eq!(Config::default().lane_count, pmkv::pool::DEFAULT_LANE_COUNT);
    assert_eq!(engine.pool().lane_count(), pmkv::pool::DEFAULT_LANE_COUNT);
}

#[test]
fn test_engine_formats_torn_create() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    // Sized, never stamped with the magic
    let file = std::fs::File::create(&path).unwrap();
    file.set_len(8 * 1024 * 1024).unwrap();
    drop(file);
    assert_eq!(Engine::check(&path), CheckStatus::Inconsistent);

    let engine = Engine::open(test_config(&path)).unwrap();
    engine.put(b"key", b"value").unwrap();
    engine.close().unwrap();

    let engine = Engine::open(test_config(&path)).unwrap();
    assert_eq!(get(&engine, b"key"), Some(b"value".to_vec()));
}

#[test]
fn test_engine_check() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("kv.pool");

    assert_eq!(Engine::check(&path), CheckStatus::CheckFailed);

    let engine = Engine::open(test_config(&path)).unwrap();
    engine.put(b"key", b"value").unwrap();
    engine.close().unwrap();

    assert_eq!(Engine::check(&path), CheckStatus::Consistent);
}

#[test]
fn test_engine_rejects_foreign_pool() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("other.pool");
    let schema = pmkv::pool::Schema::new("something-else", 1).with_type(
        pmkv::pool::TypeTag(1),
        "thing",
        8,
        8,
    );
    pmkv::Pool::create(&path, 8 * 1024 * 1024, pmkv::pool::DEFAULT_MODE, &pmkv::PoolOptions::new(schema))
        .unwrap()
        .close()
        .unwrap();

    let result = Engine::open(test_config(&path));

    assert!(matches!(result, Err(PmkvError::LayoutMismatch { .. })));
    assert_eq!(Engine::check(&path), CheckStatus::Inconsistent);
}

// =============================================================================
// Model Tests
// =============================================================================

/// Linear congruential generator; deterministic without extra dependencies
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[test]
fn test_engine_matches_model() {
    let (_temp, engine) = setup_temp_engine();
    let mut model: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
    let mut rng = Lcg(0x5eed);

    for step in 0..3000 {
        let key = format!("key-{}", rng.next() % 150).into_bytes();
        match rng.next() % 10 {
            0..=5 => {
                let len = match rng.next() % 20 {
                    0 => IN_PLACE_MAX + (rng.next() % 3000) as usize,
                    _ => (rng.next() % 200) as usize,
                };
                let value = vec![(step % 251) as u8; len];
                engine.put(&key, &value).unwrap();
                model.insert(key, value);
            }
            6..=7 => {
                let deleted = engine.delete(&key).unwrap();
                assert_eq!(deleted, model.remove(&key).is_some());
            }
            _ => {
                assert_eq!(get(&engine, &key), model.get(&key).cloned());
            }
        }
    }

    assert_eq!(engine.count().unwrap(), model.len() as u64);
    for (key, value) in &model {
        assert_eq!(get(&engine, key).as_ref(), Some(value));
    }
}
