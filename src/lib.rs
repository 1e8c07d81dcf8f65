//! # levronkv
//!
//! An embeddable, persistent key-value storage engine built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture: fast writes
//! through an append-only log and an in-memory index, with background
//! flush and compaction keeping read amplification bounded.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Engine                           │
//! │  ┌────────────┐  ┌──────────────┐  ┌─────────────┐  │
//! │  │  Active     │  │   Frozen     │  │  SSTables   │  │
//! │  │  Memtable   │  │  Memtables   │  │  (on disk)  │  │
//! │  │  + WAL      │  │              │  │  L0..L6     │  │
//! │  └─────┬───────┘  └──────┬───────┘  └──────┬──────┘  │
//! │        │   rotate         │   flush         │         │
//! │        └─────────►       └────────►        │         │
//! │                                            │         │
//! │  ┌──────────────────────────────────────────┘         │
//! │  │  Leveled compaction + tombstone GC                │
//! │  └───────────────────────────────────────────────────┘│
//! │                                                      │
//! │  ┌──────────────────────────────────────────────────┐ │
//! │  │     Manifest journal (which tables, WAL cutoff)  │ │
//! │  └──────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core storage engine — open, read, write, scan, flush, compact |
//! | [`memtable`] | In-memory sorted write buffer |
//! | [`wal`] | Segmented, CRC-protected write-ahead log for crash recovery |
//! | [`sstable`] | Immutable, sorted, on-disk tables with Bloom filters and block indices |
//! | [`manifest`] | Append-only journal of which tables exist and the WAL cutoff |
//! | [`version`] | In-memory level layout and compaction scoring |
//! | [`cache`] | Process-wide LRU cache over decoded data blocks |
//! | [`iterator`] | Merging, snapshot-filtering, and range/prefix iterator adapters |
//! | [`internal_key`] | The `(user key, sequence, type)` encoding every comparator uses |
//! | [`error`] | The crate-wide error type |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is persisted to the WAL
//!   before being acknowledged, guaranteeing durability and crash
//!   recovery.
//! - **Multi-version concurrency** — multiple versions per key, ordered
//!   by sequence number; snapshots give repeatable, isolated reads.
//! - **Point tombstones** — deletes are markers collapsed away by
//!   compaction once no open snapshot can still see them.
//! - **Bloom filter lookups** — each sorted table carries a Bloom filter
//!   for fast negative point-lookup responses.
//! - **Block-level CRC32 integrity** — every on-disk block is
//!   checksummed and a truncated tail is recovered from, not treated as
//!   fatal corruption.
//! - **Leveled compaction** — seven levels, each roughly an order of
//!   magnitude larger than the last, background flush/compaction run on
//!   a small worker pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use levronkv::engine::{Engine, EngineConfig, ReadOptions};
//!
//! let engine = Engine::open("/tmp/my_db", EngineConfig::default()).unwrap();
//!
//! engine.put(b"hello", b"world").unwrap();
//! assert_eq!(engine.get(b"hello", ReadOptions::default()).unwrap(), b"world");
//!
//! engine.delete(b"hello").unwrap();
//! assert!(engine.get(b"hello", ReadOptions::default()).is_err());
//!
//! engine.put(b"a", b"1").unwrap();
//! engine.put(b"b", b"2").unwrap();
//! let results: Vec<_> = engine.range_iterator(b"a", b"c", ReadOptions::default())
//!     .unwrap()
//!     .collect();
//!
//! engine.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod cache;
pub mod engine;
pub mod error;
pub mod internal_key;
pub mod iterator;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod version;
pub mod wal;
