//! Iteration over internal-key-ordered data: a common trait implemented by
//! every concrete source (memtable, data block, sorted table), plus three
//! composable wrappers — a merging iterator that fans many sources into
//! one ordered stream, a snapshot filter that hides versions newer than a
//! read point, and a range/prefix filter that bounds the user-facing scan.

use std::cmp::Ordering;

use crate::internal_key::{InternalKey, InternalKeyRef};
use crate::memtable::MemtableIterator;
use crate::sstable::SSTableError;
use crate::sstable::block::BlockIterator;
use crate::sstable::reader::TableIterator;

/// Common shape every iterator in the engine exposes.
pub trait KvIterator {
    fn seek_to_first(&mut self);
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];

    /// Takes any error that made this iterator (or one of its sources) go
    /// permanently invalid, distinguishing a corrupt or undecodable block
    /// from a source that is simply exhausted. Default: no error channel.
    fn take_error(&mut self) -> Option<SSTableError> {
        None
    }
}

impl KvIterator for MemtableIterator {
    fn seek_to_first(&mut self) {
        MemtableIterator::seek_to_first(self)
    }

    fn seek(&mut self, target: &[u8]) {
        MemtableIterator::seek(self, &InternalKey(target.to_vec()))
    }

    fn next(&mut self) {
        MemtableIterator::next(self)
    }

    fn valid(&self) -> bool {
        MemtableIterator::valid(self)
    }

    fn key(&self) -> &[u8] {
        self.key().expect("valid() must be true before key()").as_ref().as_bytes()
    }

    fn value(&self) -> &[u8] {
        self.value().expect("valid() must be true before value()")
    }
}

impl KvIterator for BlockIterator {
    fn seek_to_first(&mut self) {
        BlockIterator::seek_to_first(self)
    }

    fn seek(&mut self, target: &[u8]) {
        BlockIterator::seek(self, target)
    }

    fn next(&mut self) {
        BlockIterator::next(self)
    }

    fn valid(&self) -> bool {
        BlockIterator::valid(self)
    }

    fn key(&self) -> &[u8] {
        self.key()
    }

    fn value(&self) -> &[u8] {
        self.value()
    }
}

impl KvIterator for TableIterator {
    fn seek_to_first(&mut self) {
        TableIterator::seek_to_first(self)
    }

    fn seek(&mut self, target: &[u8]) {
        TableIterator::seek(self, target)
    }

    fn next(&mut self) {
        TableIterator::next(self)
    }

    fn valid(&self) -> bool {
        TableIterator::valid(self)
    }

    fn key(&self) -> &[u8] {
        self.key()
    }

    fn value(&self) -> &[u8] {
        self.value()
    }

    fn take_error(&mut self) -> Option<SSTableError> {
        TableIterator::take_error(self)
    }
}

/// Fans multiple already-sorted children into one internal-key-ordered
/// stream by a linear scan for the smallest current key (cheap for the
/// small fan-ins typical of a read or a compaction's input set).
///
/// In "read mode" (`collapse = true`) the iterator additionally advances
/// past every older version of a user key once it has emitted the
/// newest one, so a consumer sees each user key at most once. In
/// compaction mode (`collapse = false`) every version from every child is
/// preserved in order, since compaction must not discard a version some
/// snapshot can still see.
pub struct MergingIterator {
    children: Vec<Box<dyn KvIterator + Send>>,
    collapse: bool,
    current: Option<usize>,
    last_emitted_user_key: Option<Vec<u8>>,
}

impl MergingIterator {
    pub fn new(children: Vec<Box<dyn KvIterator + Send>>, collapse: bool) -> Self {
        MergingIterator {
            children,
            collapse,
            current: None,
            last_emitted_user_key: None,
        }
    }

    fn find_smallest(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            best = match best {
                None => Some(i),
                Some(b) => {
                    if InternalKeyRef::new(child.key()) < InternalKeyRef::new(self.children[b].key())
                    {
                        Some(i)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        best
    }

    fn settle(&mut self) {
        self.current = self.find_smallest();
        if self.collapse && self.current.is_some() {
            self.skip_stale_versions();
        }
    }

    fn skip_stale_versions(&mut self) {
        loop {
            let Some(idx) = self.current else { return };
            let user_key = InternalKeyRef::new(self.children[idx].key())
                .user_key()
                .unwrap_or(self.children[idx].key())
                .to_vec();
            if self.last_emitted_user_key.as_deref() == Some(user_key.as_slice()) {
                self.children[idx].next();
                self.current = self.find_smallest();
                continue;
            }
            self.last_emitted_user_key = Some(user_key);
            return;
        }
    }
}

impl KvIterator for MergingIterator {
    fn seek_to_first(&mut self) {
        self.last_emitted_user_key = None;
        for child in self.children.iter_mut() {
            child.seek_to_first();
        }
        self.settle();
    }

    fn seek(&mut self, target: &[u8]) {
        self.last_emitted_user_key = None;
        for child in self.children.iter_mut() {
            child.seek(target);
        }
        self.settle();
    }

    fn next(&mut self) {
        if let Some(idx) = self.current {
            self.children[idx].next();
        }
        self.settle();
    }

    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.children[self.current.expect("valid() must be true before key()")].key()
    }

    fn value(&self) -> &[u8] {
        self.children[self.current.expect("valid() must be true before value()")].value()
    }

    fn take_error(&mut self) -> Option<SSTableError> {
        for child in self.children.iter_mut() {
            if let Some(e) = child.take_error() {
                return Some(e);
            }
        }
        None
    }
}

/// Wraps a child iterator and hides every entry whose sequence number
/// exceeds `read_seq`.
pub struct SnapshotFilter<I> {
    inner: I,
    read_seq: u64,
}

impl<I: KvIterator> SnapshotFilter<I> {
    pub fn new(inner: I, read_seq: u64) -> Self {
        SnapshotFilter { inner, read_seq }
    }

    fn skip_invisible(&mut self) {
        while self.inner.valid() {
            match InternalKeyRef::new(self.inner.key()).seq_and_type() {
                Ok((seq, _)) if seq <= self.read_seq => return,
                _ => self.inner.next(),
            }
        }
    }
}

impl<I: KvIterator> KvIterator for SnapshotFilter<I> {
    fn seek_to_first(&mut self) {
        self.inner.seek_to_first();
        self.skip_invisible();
    }

    fn seek(&mut self, target: &[u8]) {
        self.inner.seek(target);
        self.skip_invisible();
    }

    fn next(&mut self) {
        self.inner.next();
        self.skip_invisible();
    }

    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn take_error(&mut self) -> Option<SSTableError> {
        self.inner.take_error()
    }
}

/// The bound an iterator may be restricted to.
#[derive(Debug, Clone)]
pub enum Bound {
    /// `[start, end)` over user keys.
    Range(Vec<u8>, Vec<u8>),
    /// All user keys sharing `prefix`.
    Prefix(Vec<u8>),
    Unbounded,
}

/// Wraps a child iterator, suppressing keys outside the configured bound
/// and going permanently invalid once the bound is crossed.
pub struct BoundedIterator<I> {
    inner: I,
    bound: Bound,
    exhausted: bool,
}

impl<I: KvIterator> BoundedIterator<I> {
    pub fn new(inner: I, bound: Bound) -> Self {
        BoundedIterator {
            inner,
            bound,
            exhausted: false,
        }
    }

    fn in_bounds(&self, user_key: &[u8]) -> Ordering {
        match &self.bound {
            Bound::Unbounded => Ordering::Equal,
            Bound::Range(start, end) => {
                if user_key < start.as_slice() {
                    Ordering::Less
                } else if user_key >= end.as_slice() {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
            Bound::Prefix(prefix) => {
                if user_key.starts_with(prefix.as_slice()) {
                    Ordering::Equal
                } else if user_key < prefix.as_slice() {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
        }
    }

    fn settle(&mut self) {
        while self.inner.valid() {
            let user_key = InternalKeyRef::new(self.inner.key())
                .user_key()
                .unwrap_or(self.inner.key());
            match self.in_bounds(user_key) {
                Ordering::Equal => return,
                Ordering::Less => self.inner.next(),
                Ordering::Greater => {
                    self.exhausted = true;
                    return;
                }
            }
        }
        self.exhausted = true;
    }
}

impl<I: KvIterator> KvIterator for BoundedIterator<I> {
    fn seek_to_first(&mut self) {
        self.exhausted = false;
        match &self.bound {
            Bound::Range(start, _) => self.inner.seek(start),
            Bound::Prefix(prefix) => self.inner.seek(prefix),
            Bound::Unbounded => self.inner.seek_to_first(),
        }
        self.settle();
    }

    fn seek(&mut self, target: &[u8]) {
        self.exhausted = false;
        self.inner.seek(target);
        self.settle();
    }

    fn next(&mut self) {
        self.inner.next();
        self.settle();
    }

    fn valid(&self) -> bool {
        !self.exhausted && self.inner.valid()
    }

    fn key(&self) -> &[u8] {
        self.inner.key()
    }

    fn value(&self) -> &[u8] {
        self.inner.value()
    }

    fn take_error(&mut self) -> Option<SSTableError> {
        self.inner.take_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal_key::ValueType;
    use crate::memtable::Memtable;

    fn put(m: &Memtable, key: &str, seq: u64, value: &str) {
        m.insert(key.as_bytes(), seq, ValueType::Value, value.as_bytes())
            .unwrap();
    }

    fn del(m: &Memtable, key: &str, seq: u64) {
        m.insert(key.as_bytes(), seq, ValueType::Tombstone, b"").unwrap();
    }

    #[test]
    fn merging_iterator_collapses_to_newest_version() {
        let a = Memtable::new();
        put(&a, "k", 1, "old");
        let b = Memtable::new();
        put(&b, "k", 2, "new");

        let children: Vec<Box<dyn KvIterator + Send>> =
            vec![Box::new(a.snapshot()), Box::new(b.snapshot())];
        let mut merged = MergingIterator::new(children, true);
        merged.seek_to_first();
        assert!(merged.valid());
        assert_eq!(merged.value(), b"new");
        merged.next();
        assert!(!merged.valid());
    }

    #[test]
    fn merging_iterator_without_collapse_preserves_every_version() {
        let a = Memtable::new();
        put(&a, "k", 1, "old");
        let b = Memtable::new();
        put(&b, "k", 2, "new");

        let children: Vec<Box<dyn KvIterator + Send>> =
            vec![Box::new(a.snapshot()), Box::new(b.snapshot())];
        let mut merged = MergingIterator::new(children, false);
        merged.seek_to_first();
        let mut values = Vec::new();
        while merged.valid() {
            values.push(merged.value().to_vec());
            merged.next();
        }
        assert_eq!(values, vec![b"new".to_vec(), b"old".to_vec()]);
    }

    #[test]
    fn snapshot_filter_hides_future_versions() {
        let m = Memtable::new();
        put(&m, "k", 1, "v1");
        put(&m, "k", 5, "v5");
        let mut it = SnapshotFilter::new(m.snapshot(), 2);
        it.seek_to_first();
        assert!(it.valid());
        let ik = InternalKeyRef::new(it.key());
        assert_eq!(ik.seq_and_type().unwrap().0, 1);
    }

    #[test]
    fn snapshot_filter_hides_tombstone_newer_than_read_seq() {
        let m = Memtable::new();
        put(&m, "k", 1, "v1");
        del(&m, "k", 5);
        let mut it = SnapshotFilter::new(m.snapshot(), 2);
        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.value(), b"v1");
    }

    #[test]
    fn bounded_range_excludes_end() {
        let m = Memtable::new();
        for (k, s) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            put(&m, k, s, "v");
        }
        let mut it = BoundedIterator::new(m.snapshot(), Bound::Range(b"b".to_vec(), b"d".to_vec()));
        it.seek_to_first();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(
                InternalKeyRef::new(it.key()).user_key().unwrap().to_vec(),
            );
            it.next();
        }
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn bounded_prefix_matches_only_shared_prefix() {
        let m = Memtable::new();
        for (k, s) in [("app", 1), ("apple", 2), ("banana", 3)] {
            put(&m, k, s, "v");
        }
        let mut it = BoundedIterator::new(m.snapshot(), Bound::Prefix(b"app".to_vec()));
        it.seek_to_first();
        let mut keys = Vec::new();
        while it.valid() {
            keys.push(
                InternalKeyRef::new(it.key()).user_key().unwrap().to_vec(),
            );
            it.next();
        }
        assert_eq!(keys, vec![b"app".to_vec(), b"apple".to_vec()]);
    }
}
