//! In-memory level layout: per-level table metadata, the obsolete-file
//! set awaiting deletion, and the WAL cutoff watermark.
//!
//! The version set is the read-side source of truth for "which tables
//! exist and where do they live"; the [`crate::manifest`] journal is its
//! durable log. Commits apply to the version set under the engine's
//! write mutex (see `engine`); this module only holds the level vectors
//! and the pure decision logic (overlap queries, compaction scoring).

use std::collections::HashSet;
use std::sync::RwLock;

use thiserror::Error;

use crate::internal_key::InternalKeyRef;

/// Number of levels in the tiered layout, L0..L6.
pub const NUM_LEVELS: usize = 7;

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("level {0} is out of range (must be < {NUM_LEVELS})")]
    InvalidLevel(usize),
}

pub type Result<T> = std::result::Result<T, VersionError>;

/// Metadata describing one on-disk sorted table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub file_number: u64,
    pub level: usize,
    pub smallest_seq: u64,
    pub largest_seq: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub file_size: u64,
}

impl TableMetadata {
    /// Whether this table's user-key range could contain `user_key`.
    pub fn may_contain_key(&self, user_key: &[u8]) -> bool {
        self.smallest_user_key() <= user_key && user_key <= self.largest_user_key()
    }

    /// Whether this table's user-key range overlaps `[start, end]` (both bounds inclusive).
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.smallest_user_key() <= end && start <= self.largest_user_key()
    }

    fn smallest_user_key(&self) -> &[u8] {
        InternalKeyRef::new(&self.smallest_key)
            .user_key()
            .unwrap_or(&self.smallest_key)
    }

    fn largest_user_key(&self) -> &[u8] {
        InternalKeyRef::new(&self.largest_key)
            .user_key()
            .unwrap_or(&self.largest_key)
    }
}

/// Outcome of [`VersionSet::pick_compaction`]: which level scored highest
/// and whether its score crosses the trigger threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPick {
    pub level: usize,
    pub should_compact: bool,
    pub score: f64,
}

struct Levels {
    tables: Vec<Vec<TableMetadata>>,
    obsolete: HashSet<u64>,
    wal_cutoff_seq: u64,
}

/// The engine's in-memory level layout.
///
/// `L0` tables may overlap and are read newest-file-first; `L1..` tables
/// within one level are disjoint and kept sorted by smallest key.
pub struct VersionSet {
    state: RwLock<Levels>,
}

impl VersionSet {
    pub fn new() -> Self {
        VersionSet {
            state: RwLock::new(Levels {
                tables: (0..NUM_LEVELS).map(|_| Vec::new()).collect(),
                obsolete: HashSet::new(),
                wal_cutoff_seq: 0,
            }),
        }
    }

    /// Adds a table to its level, keeping L1+ sorted by smallest key.
    pub fn add(&self, meta: TableMetadata) -> Result<()> {
        if meta.level >= NUM_LEVELS {
            return Err(VersionError::InvalidLevel(meta.level));
        }
        let mut state = self.state.write().expect("version set lock poisoned");
        let level = meta.level;
        state.tables[level].push(meta);
        if level > 0 {
            state.tables[level].sort_by(|a, b| a.smallest_key.cmp(&b.smallest_key));
        } else {
            // Newest-first by file number for L0 reads.
            state.tables[0].sort_by(|a, b| b.file_number.cmp(&a.file_number));
        }
        Ok(())
    }

    /// Removes a table from its level's live set and records it as obsolete.
    pub fn remove(&self, file_number: u64) {
        let mut state = self.state.write().expect("version set lock poisoned");
        for level in state.tables.iter_mut() {
            level.retain(|t| t.file_number != file_number);
        }
        state.obsolete.insert(file_number);
    }

    /// Drains the obsolete set, returning the file numbers whose on-disk
    /// files the caller should now unlink.
    pub fn drain_obsolete(&self) -> Vec<u64> {
        let mut state = self.state.write().expect("version set lock poisoned");
        state.obsolete.drain().collect()
    }

    pub fn set_wal_cutoff(&self, seq: u64) {
        let mut state = self.state.write().expect("version set lock poisoned");
        if seq > state.wal_cutoff_seq {
            state.wal_cutoff_seq = seq;
        }
    }

    pub fn wal_cutoff_seq(&self) -> u64 {
        self.state.read().expect("version set lock poisoned").wal_cutoff_seq
    }

    /// All live tables across every level, L0 first.
    pub fn all(&self) -> Vec<TableMetadata> {
        let state = self.state.read().expect("version set lock poisoned");
        state.tables.iter().flatten().cloned().collect()
    }

    /// Live tables at one level.
    pub fn level(&self, level: usize) -> Vec<TableMetadata> {
        let state = self.state.read().expect("version set lock poisoned");
        state.tables.get(level).cloned().unwrap_or_default()
    }

    /// Tables at `level` whose key range intersects `[start, end]`.
    pub fn overlapping(&self, level: usize, start: &[u8], end: &[u8]) -> Vec<TableMetadata> {
        let state = self.state.read().expect("version set lock poisoned");
        state
            .tables
            .get(level)
            .into_iter()
            .flatten()
            .filter(|t| t.overlaps(start, end))
            .cloned()
            .collect()
    }

    fn total_size(&self, state: &Levels, level: usize) -> u64 {
        state.tables[level].iter().map(|t| t.file_size).sum()
    }

    /// Scores every level and returns the highest, per §4.6: L0's score is
    /// `count / l0_trigger`; level `l >= 1`'s score is
    /// `total_size(l) / (l1_max_bytes * 2^(l-1))`. The deepest level is
    /// never picked; ties favor the lower level number.
    pub fn pick_compaction(&self, l0_trigger: usize, l1_max_bytes: u64) -> CompactionPick {
        let state = self.state.read().expect("version set lock poisoned");
        let mut best_level = 0usize;
        let mut best_score = 0.0f64;
        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                state.tables[0].len() as f64 / l0_trigger.max(1) as f64
            } else {
                let cap = l1_max_bytes as f64 * 2f64.powi(level as i32 - 1);
                self.total_size(&state, level) as f64 / cap.max(1.0)
            };
            if score > best_score {
                best_score = score;
                best_level = level;
            }
        }
        CompactionPick {
            level: best_level,
            should_compact: best_score >= 1.0,
            score: best_score,
        }
    }
}

impl Default for VersionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(file_number: u64, level: usize, small: &[u8], large: &[u8], size: u64) -> TableMetadata {
        use crate::internal_key::{encode, ValueType};
        TableMetadata {
            file_number,
            level,
            smallest_seq: 1,
            largest_seq: 1,
            smallest_key: encode(small, 1, ValueType::Value).unwrap(),
            largest_key: encode(large, 1, ValueType::Value).unwrap(),
            file_size: size,
        }
    }

    #[test]
    fn add_and_all() {
        let vs = VersionSet::new();
        vs.add(meta(1, 0, b"a", b"c", 100)).unwrap();
        vs.add(meta(2, 1, b"d", b"f", 100)).unwrap();
        assert_eq!(vs.all().len(), 2);
    }

    #[test]
    fn l0_newest_first_by_file_number() {
        let vs = VersionSet::new();
        vs.add(meta(1, 0, b"a", b"c", 100)).unwrap();
        vs.add(meta(3, 0, b"a", b"c", 100)).unwrap();
        vs.add(meta(2, 0, b"a", b"c", 100)).unwrap();
        let l0 = vs.level(0);
        assert_eq!(l0.iter().map(|t| t.file_number).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn l1_sorted_by_smallest_key() {
        let vs = VersionSet::new();
        vs.add(meta(2, 1, b"m", b"z", 100)).unwrap();
        vs.add(meta(1, 1, b"a", b"d", 100)).unwrap();
        let l1 = vs.level(1);
        assert_eq!(l1.iter().map(|t| t.file_number).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn remove_moves_to_obsolete() {
        let vs = VersionSet::new();
        vs.add(meta(1, 0, b"a", b"c", 100)).unwrap();
        vs.remove(1);
        assert!(vs.all().is_empty());
        assert_eq!(vs.drain_obsolete(), vec![1]);
        assert!(vs.drain_obsolete().is_empty());
    }

    #[test]
    fn wal_cutoff_is_monotonic() {
        let vs = VersionSet::new();
        vs.set_wal_cutoff(10);
        vs.set_wal_cutoff(5);
        assert_eq!(vs.wal_cutoff_seq(), 10);
        vs.set_wal_cutoff(20);
        assert_eq!(vs.wal_cutoff_seq(), 20);
    }

    #[test]
    fn overlapping_filters_by_range() {
        let vs = VersionSet::new();
        vs.add(meta(1, 1, b"a", b"c", 100)).unwrap();
        vs.add(meta(2, 1, b"m", b"z", 100)).unwrap();
        let hits = vs.overlapping(1, b"b", b"n");
        assert_eq!(hits.len(), 2);
        let hits = vs.overlapping(1, b"p", b"q");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_number, 2);
    }

    #[test]
    fn compaction_score_l0_trigger() {
        let vs = VersionSet::new();
        for i in 0..4 {
            vs.add(meta(i, 0, b"a", b"c", 10)).unwrap();
        }
        let pick = vs.pick_compaction(4, 1024);
        assert_eq!(pick.level, 0);
        assert!(pick.should_compact);
    }

    #[test]
    fn deepest_level_never_picked() {
        let vs = VersionSet::new();
        // Stuff the deepest level with an enormous amount of data; it must
        // never be returned as the pick.
        vs.add(meta(1, NUM_LEVELS - 1, b"a", b"c", u64::MAX / 2)).unwrap();
        let pick = vs.pick_compaction(4, 1024);
        assert_ne!(pick.level, NUM_LEVELS - 1);
    }

    #[test]
    fn ties_favor_lower_level() {
        let vs = VersionSet::new();
        // Both L1 and L2 score exactly 1.0 with these sizes.
        vs.add(meta(1, 1, b"a", b"c", 1024)).unwrap();
        vs.add(meta(2, 2, b"a", b"c", 2048)).unwrap();
        let pick = vs.pick_compaction(4, 1024);
        assert_eq!(pick.level, 1);
    }
}
