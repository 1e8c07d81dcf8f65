//! Extra integration tests targeting less obvious code paths of the
//! `Engine` API: recovery through a populated WAL, manifest compaction,
//! multiple background flush/compaction cycles, and config boundary
//! values.

use levronkv::engine::{Engine, EngineConfig, ReadOptions};
use levronkv::sstable::CompressionType;
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Tiny memtable limit to force frequent freezes and background flushes.
fn tiny_config() -> EngineConfig {
    EngineConfig {
        memtable_size_limit: 1024,
        l0_compaction_trigger: 2,
        sync_writes: false,
        ..EngineConfig::default()
    }
}

// ================================================================================================
// WAL recovery
// ================================================================================================

/// Writes that are never flushed must still be recovered from the WAL on
/// the next open, without relying on a clean `close()`.
#[test]
fn unflushed_writes_recovered_from_wal() {
    let tmp = TempDir::new().unwrap();

    {
        let engine = Engine::open(tmp.path(), EngineConfig::default()).unwrap();
        engine.put(b"key1", b"val1").unwrap();
        engine.put(b"key2", b"val2").unwrap();
        engine.close().unwrap();
    }

    {
        let engine = Engine::open(tmp.path(), EngineConfig::default()).unwrap();
        assert_eq!(engine.get(b"key1", ReadOptions::default()).unwrap(), b"val1");
        assert_eq!(engine.get(b"key2", ReadOptions::default()).unwrap(), b"val2");
        engine.close().unwrap();
    }
}

/// Recovery must replay only records past the manifest's recorded WAL
/// cutoff, so a flush followed by further unflushed writes recovers
/// exactly the unflushed tail.
#[test]
fn recovery_applies_only_records_past_wal_cutoff() {
    let tmp = TempDir::new().unwrap();

    {
        let engine = Engine::open(tmp.path(), tiny_config()).unwrap();
        for i in 0..200u32 {
            let key = format!("k{i:04}");
            let val = format!("v{i:04}");
            engine.put(key.as_bytes(), val.as_bytes()).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(200));

        // More writes after the flush, never flushed themselves.
        for i in 200..220u32 {
            let key = format!("k{i:04}");
            let val = format!("v{i:04}");
            engine.put(key.as_bytes(), val.as_bytes()).unwrap();
        }
        engine.close().unwrap();
    }

    let engine = Engine::open(tmp.path(), tiny_config()).unwrap();
    for i in 0..220u32 {
        let key = format!("k{i:04}");
        let val = format!("v{i:04}");
        assert_eq!(
            engine.get(key.as_bytes(), ReadOptions::default()).unwrap(),
            val.into_bytes(),
            "key {key} should exist after recovery"
        );
    }
    engine.close().unwrap();
}

// ================================================================================================
// Manifest compaction
// ================================================================================================

/// `compact_manifest` rewrites the manifest to a fresh snapshot; visible
/// state must be identical before and after, including across a reopen.
#[test]
fn compact_manifest_survives_reopen() {
    let tmp = TempDir::new().unwrap();

    {
        let engine = Engine::open(tmp.path(), tiny_config()).unwrap();
        for i in 0..100u32 {
            let key = format!("m{i:04}");
            engine.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
        engine.compact_manifest().unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(tmp.path(), tiny_config()).unwrap();
    for i in 0..100u32 {
        let key = format!("m{i:04}");
        assert_eq!(engine.get(key.as_bytes(), ReadOptions::default()).unwrap(), key.as_bytes());
    }
    engine.close().unwrap();
}

// ================================================================================================
// Background flush/compaction cycles
// ================================================================================================

/// Sustained writes through several freeze/flush/compaction cycles with
/// interleaved deletes must leave exactly the live keys visible.
#[test]
fn background_cycle_with_interleaved_deletes() {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(tmp.path(), tiny_config()).unwrap();

    for i in 0..200u32 {
        let key = format!("k{i:04}");
        let val = format!("v{i:04}");
        engine.put(key.as_bytes(), val.as_bytes()).unwrap();
    }
    for i in 0..100u32 {
        let key = format!("k{i:04}");
        engine.delete(key.as_bytes()).unwrap();
    }
    for i in 200..300u32 {
        let key = format!("k{i:04}");
        let val = format!("v{i:04}");
        engine.put(key.as_bytes(), val.as_bytes()).unwrap();
    }

    std::thread::sleep(std::time::Duration::from_millis(300));

    for i in 0..100u32 {
        let key = format!("k{i:04}");
        assert!(engine.get(key.as_bytes(), ReadOptions::default()).is_err(), "{key} should be deleted");
    }
    for i in 100..300u32 {
        let key = format!("k{i:04}");
        let val = format!("v{i:04}");
        assert_eq!(
            engine.get(key.as_bytes(), ReadOptions::default()).unwrap(),
            val.into_bytes(),
            "key {key} should exist"
        );
    }

    engine.close().unwrap();
}

// ================================================================================================
// Compression
// ================================================================================================

/// Zlib-compressed tables round-trip identically to uncompressed ones.
#[test]
fn zlib_compressed_tables_roundtrip_after_flush() {
    let tmp = TempDir::new().unwrap();
    let config = EngineConfig {
        memtable_size_limit: 1024,
        compression_type: CompressionType::Zlib,
        sync_writes: false,
        ..EngineConfig::default()
    };

    {
        let engine = Engine::open(tmp.path(), config.clone()).unwrap();
        for i in 0..150u32 {
            let key = format!("z{i:04}");
            let val = "x".repeat(64);
            engine.put(key.as_bytes(), val.as_bytes()).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(200));
        engine.close().unwrap();
    }

    let engine = Engine::open(tmp.path(), config).unwrap();
    for i in 0..150u32 {
        let key = format!("z{i:04}");
        let val = "x".repeat(64);
        assert_eq!(engine.get(key.as_bytes(), ReadOptions::default()).unwrap(), val.into_bytes());
    }
    engine.close().unwrap();
}

// ================================================================================================
// Reopen after deleting everything
// ================================================================================================

/// Writing keys, deleting all of them, then reopening must leave no live
/// data visible through `get` or a full scan.
#[test]
fn reopen_after_delete_all_keys() {
    let dir = TempDir::new().unwrap();
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.delete(b"a").unwrap();
        engine.delete(b"b").unwrap();
        engine.close().unwrap();
    }
    {
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        assert!(engine.get(b"a", ReadOptions::default()).is_err());
        assert!(engine.get(b"b", ReadOptions::default()).is_err());
        let scan: Vec<_> = engine.iterator(ReadOptions::default()).unwrap().collect();
        assert!(scan.is_empty());
        engine.close().unwrap();
    }
}

// ================================================================================================
// Atomic batch writes
// ================================================================================================

/// A multi-record `write` batch becomes visible as a single atomic unit.
#[test]
fn batch_write_is_atomic_and_contiguous() {
    use levronkv::wal::WalLogicalRecord;

    let dir = TempDir::new().unwrap();
    let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();

    engine
        .write(vec![
            WalLogicalRecord::Put { key: b"x".to_vec(), value: b"1".to_vec() },
            WalLogicalRecord::Put { key: b"y".to_vec(), value: b"2".to_vec() },
            WalLogicalRecord::Delete { key: b"x".to_vec() },
        ])
        .unwrap();

    assert!(engine.get(b"x", ReadOptions::default()).is_err());
    assert_eq!(engine.get(b"y", ReadOptions::default()).unwrap(), b"2");

    engine.close().unwrap();
}
