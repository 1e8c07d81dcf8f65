//! Process-wide LRU cache over decoded data blocks.
//!
//! Keyed by `(table_path, block_offset)` so that the same physical block
//! read through two different table readers (e.g. before and after a
//! table is reopened) still shares one cache slot. Eviction is strict
//! least-recently-used by access, bounded by total retained bytes rather
//! than entry count, since block sizes vary with compression.

use std::path::PathBuf;
use std::sync::Mutex;

use lru::LruCache;

/// Default total-byte capacity for the block cache (8 MiB).
pub const DEFAULT_CAPACITY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub table_path: PathBuf,
    pub block_offset: u64,
}

impl CacheKey {
    pub fn new(table_path: PathBuf, block_offset: u64) -> Self {
        CacheKey {
            table_path,
            block_offset,
        }
    }
}

struct Entry {
    bytes: std::sync::Arc<Vec<u8>>,
}

/// Thread-safe, byte-capacity-bounded LRU cache of decoded block payloads.
pub struct BlockCache {
    capacity_bytes: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    map: LruCache<CacheKey, Entry>,
    used_bytes: usize,
}

impl BlockCache {
    pub fn new(capacity_bytes: usize) -> Self {
        // `LruCache` wants a nonzero entry-count bound; since we evict on
        // byte budget ourselves, an oversized entry-count cap just means
        // the byte budget is the real constraint.
        let cap = std::num::NonZeroUsize::new(capacity_bytes.max(1)).expect("nonzero");
        BlockCache {
            capacity_bytes,
            inner: Mutex::new(Inner {
                map: LruCache::new(cap),
                used_bytes: 0,
            }),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<std::sync::Arc<Vec<u8>>> {
        let mut guard = self.inner.lock().expect("block cache mutex poisoned");
        guard.map.get(key).map(|e| e.bytes.clone())
    }

    /// Inserts `bytes` under `key`. Entries larger than the cache's total
    /// capacity are not retained (a no-op insert).
    pub fn put(&self, key: CacheKey, bytes: std::sync::Arc<Vec<u8>>) {
        if bytes.len() > self.capacity_bytes {
            return;
        }
        let mut guard = self.inner.lock().expect("block cache mutex poisoned");
        if let Some(old) = guard.map.put(key, Entry { bytes: bytes.clone() }) {
            guard.used_bytes -= old.bytes.len();
        }
        guard.used_bytes += bytes.len();
        while guard.used_bytes > self.capacity_bytes {
            match guard.map.pop_lru() {
                Some((_, evicted)) => guard.used_bytes -= evicted.bytes.len(),
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn used_bytes(&self) -> usize {
        self.inner.lock().expect("block cache mutex poisoned").used_bytes
    }
}
