//! In-memory sorted index over internal keys.
//!
//! The memtable is the write target for every `put`/`delete`: a single
//! writer inserts under a brief write-lock while any number of readers
//! may iterate concurrently. Readers that open an iterator take a
//! snapshot of the sorted keys under a read lock, so their view stays
//! stable even while the writer continues to mutate the live map.

#[cfg(test)]
mod tests;

use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::internal_key::{self, InternalKey, InternalKeyError, ValueType};

/// Errors produced by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    #[error(transparent)]
    InternalKey(#[from] InternalKeyError),
}

type Result<T> = std::result::Result<T, MemtableError>;

/// Outcome of a point lookup against the memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemtableLookup {
    Value(Vec<u8>),
    Tombstone,
    NotFound,
}

/// A sorted, concurrently-readable map from internal key to value bytes.
///
/// Values are stored without the type tag (that lives in the key's
/// trailer); a tombstone stores an empty value.
pub struct Memtable {
    inner: RwLock<std::collections::BTreeMap<InternalKey, Vec<u8>>>,
    approximate_size: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Memtable {
            inner: RwLock::new(std::collections::BTreeMap::new()),
            approximate_size: AtomicUsize::new(0),
        }
    }

    /// Inserts one internal-key entry. `value` is ignored (treated as
    /// empty) for `ValueType::Tombstone`.
    pub fn insert(
        &self,
        user_key: &[u8],
        seq: u64,
        kind: ValueType,
        value: &[u8],
    ) -> Result<()> {
        let ikey = InternalKey::new(user_key, seq, kind)?;
        let stored = match kind {
            ValueType::Value => value.to_vec(),
            ValueType::Tombstone => Vec::new(),
        };
        let added = ikey.as_ref().as_bytes().len() + stored.len();
        let mut guard = self.inner.write().expect("memtable lock poisoned");
        guard.insert(ikey, stored);
        drop(guard);
        self.approximate_size.fetch_add(added, Ordering::Relaxed);
        Ok(())
    }

    /// Looks up the newest version of `user_key` visible at `read_seq`
    /// (inclusive). Returns `NotFound` if no version is visible.
    pub fn get(&self, user_key: &[u8], read_seq: u64) -> Result<MemtableLookup> {
        let guard = self.inner.read().expect("memtable lock poisoned");
        // The lower bound of this user key at the highest possible
        // sequence number is the first internal key we can legally see;
        // walk forward until the user key changes or we find a visible
        // entry.
        let lower = InternalKey::new(user_key, internal_key::MAX_SEQUENCE_NUMBER, ValueType::Value)?;
        for (ikey, value) in guard.range(lower..) {
            let (uk, seq, kind) = internal_key::decode(&ikey.0)?;
            if uk != user_key {
                break;
            }
            if seq > read_seq {
                continue;
            }
            return Ok(match kind {
                ValueType::Value => MemtableLookup::Value(value.clone()),
                ValueType::Tombstone => MemtableLookup::Tombstone,
            });
        }
        Ok(MemtableLookup::NotFound)
    }

    /// Approximate size in bytes of all stored keys and values.
    pub fn approximate_size(&self) -> usize {
        self.approximate_size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().expect("memtable lock poisoned").is_empty()
    }

    /// Snapshots the current sorted contents for iteration.
    pub fn snapshot(&self) -> MemtableIterator {
        let guard = self.inner.read().expect("memtable lock poisoned");
        let entries: Vec<(InternalKey, Vec<u8>)> =
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        MemtableIterator { entries, pos: 0 }
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward iterator over a point-in-time snapshot of a memtable's sorted
/// internal keys.
pub struct MemtableIterator {
    entries: Vec<(InternalKey, Vec<u8>)>,
    pos: usize,
}

impl MemtableIterator {
    pub fn seek_to_first(&mut self) {
        self.pos = 0;
    }

    /// Positions at the first entry whose internal key is `>= target`.
    pub fn seek(&mut self, target: &InternalKey) {
        self.pos = self
            .entries
            .partition_point(|(k, _)| k < target);
    }

    pub fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    pub fn next(&mut self) {
        if self.valid() {
            self.pos += 1;
        }
    }

    pub fn key(&self) -> Option<&InternalKey> {
        self.entries.get(self.pos).map(|(k, _)| k)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.entries.get(self.pos).map(|(_, v)| v.as_slice())
    }
}
