//! Ties every component together: the write path (WAL + memtable), the
//! read path (merging iterator over memtables and sorted tables), crash
//! recovery, and the background flush/compaction actors.
//!
//! ## Concurrency model
//!
//! - **WAL append-order lock** — serializes the disk I/O portion of
//!   `write` (sequence-number framing, `Wal::append`, `Wal::sync`) so WAL
//!   order matches sequence order, without holding the write mutex across
//!   that I/O.
//! - **Write mutex** — held only for bookkeeping, never across disk I/O:
//!   the memtable insert loop and rotation decision in `write`, iterator
//!   construction (mapping fds) for `get`/`range_iterator`/
//!   `prefix_iterator`, and the commit phase of flush/compaction/
//!   `compact_manifest`.
//! - **Flush mutex** / **compaction mutex** — each admits at most one
//!   in-flight actor of its kind; extra background workers that wake up
//!   while one is running simply find the mutex held and return.
//! - **Version-set lock** — owned by [`crate::version::VersionSet`] itself.
//! - **Background-error lock** — a short critical section around the
//!   sticky fault flag.
//!
//! Background flush and compaction are posted as work items to a small
//! worker pool over a [`crossbeam::channel`] rather than spawned ad hoc,
//! so the number of live threads is bounded by [`EngineConfig::background_threads`].

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{debug, error, info, trace};

use crate::cache::BlockCache;
use crate::error::{EngineError, Result};
use crate::internal_key::{self, InternalKey, InternalKeyRef, MAX_SEQUENCE_NUMBER, ValueType};
use crate::iterator::{Bound, BoundedIterator, KvIterator, MergingIterator, SnapshotFilter};
use crate::manifest::{Manifest, ManifestRecord, snapshot_records};
use crate::memtable::{Memtable, MemtableLookup};
use crate::sstable::builder::TableBuilder;
use crate::sstable::reader::TableReader;
use crate::sstable::{CompressionType, DEFAULT_BLOCK_SIZE};
use crate::version::{NUM_LEVELS, TableMetadata, VersionSet};
use crate::wal::{Wal, WalBatch, WalLogicalRecord};

/// Tuning knobs for one [`Engine`] instance. `Default` matches the values
/// named throughout the design.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory (relative to the database directory) holding WAL segments.
    pub wal_subdir: PathBuf,
    /// Memtable size, in approximate bytes, that triggers a rotation.
    pub memtable_size_limit: usize,
    /// Block compression applied to new sorted tables.
    pub compression_type: CompressionType,
    /// Target uncompressed size of one data block.
    pub block_size: usize,
    /// Number of L0 tables that saturates the L0 compaction score.
    pub l0_compaction_trigger: usize,
    /// Byte budget for L1; level `l >= 1`'s budget is `l1_max_bytes * 2^(l-1)`.
    pub l1_max_bytes: u64,
    /// Whether every write fsyncs the WAL before returning.
    pub sync_writes: bool,
    /// Total byte budget for the shared block cache.
    pub cache_capacity_bytes: usize,
    /// Bloom filter bits-per-key used by new tables.
    pub bits_per_key: usize,
    /// Soft byte cap before a compaction output splits into a new file.
    pub max_compaction_output_bytes: u64,
    /// Number of background worker threads shared by flush and compaction.
    pub background_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            wal_subdir: PathBuf::from("wal"),
            memtable_size_limit: 4 * 1024 * 1024,
            compression_type: CompressionType::None,
            block_size: DEFAULT_BLOCK_SIZE,
            l0_compaction_trigger: 4,
            l1_max_bytes: 64 * 1024 * 1024,
            sync_writes: true,
            cache_capacity_bytes: crate::cache::DEFAULT_CAPACITY_BYTES,
            bits_per_key: crate::sstable::filter::DEFAULT_BITS_PER_KEY,
            max_compaction_output_bytes: 20 * 1024 * 1024,
            background_threads: 2,
        }
    }
}

/// Read-time options shared by `get` and the iterator constructors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub read_seq: Option<u64>,
}

/// A point-in-time view: reads made with this snapshot see exactly the
/// writes with `seq <= snapshot seq`.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    id: u64,
    seq: u64,
}

impl Snapshot {
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

enum WorkItem {
    Flush,
    Compaction,
    Shutdown,
}

fn table_path(dir: &Path, file_number: u64) -> PathBuf {
    dir.join(format!("{file_number:06}.sst"))
}

fn manifest_path(dir: &Path) -> PathBuf {
    dir.join("MANIFEST")
}

/// The embedded key-value store.
pub struct Engine {
    dir: PathBuf,
    config: EngineConfig,

    wal: Wal,
    manifest: Mutex<Manifest>,
    versions: Arc<VersionSet>,
    cache: Arc<BlockCache>,

    next_seq: AtomicU64,
    next_file_number: AtomicU64,
    next_snapshot_id: AtomicU64,

    write_mutex: Mutex<()>,
    wal_append_mutex: Mutex<()>,
    flush_mutex: Mutex<()>,
    compaction_mutex: Mutex<()>,
    background_error: Mutex<Option<String>>,

    active: RwLock<Arc<Memtable>>,
    frozen: Mutex<VecDeque<Arc<Memtable>>>,
    readers: RwLock<HashMap<u64, Arc<TableReader>>>,
    snapshots: Mutex<HashMap<u64, u64>>,

    work_tx: Sender<WorkItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Opens (creating if absent) the database at `dir`: replays the
    /// manifest, then the WAL, rebuilding the active memtable from
    /// batches past the WAL cutoff. Fails if a table the manifest
    /// references is missing from disk.
    pub fn open(dir: impl Into<PathBuf>, config: EngineConfig) -> Result<Arc<Self>> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let wal_dir = dir.join(&config.wal_subdir);
        fs::create_dir_all(&wal_dir)?;

        let versions = Manifest::replay(manifest_path(&dir))?;
        for table in versions.all() {
            let path = table_path(&dir, table.file_number);
            if !path.exists() {
                return Err(EngineError::MissingFile(path));
            }
        }
        let next_file_number = versions.all().iter().map(|t| t.file_number).max().unwrap_or(0) + 1;
        let cutoff = versions.wal_cutoff_seq();

        let manifest = Manifest::open(manifest_path(&dir))?;
        let active = Memtable::new();
        let batches = Wal::recover(&wal_dir)?;
        let mut max_seq = cutoff;
        for table in versions.all() {
            max_seq = max_seq.max(table.largest_seq);
        }
        for batch in &batches {
            for (i, record) in batch.records.iter().enumerate() {
                let seq = batch.start_seq + i as u64;
                if seq <= cutoff {
                    continue;
                }
                max_seq = max_seq.max(seq);
                match record {
                    WalLogicalRecord::Put { key, value } => {
                        active.insert(key, seq, ValueType::Value, value)?;
                    }
                    WalLogicalRecord::Delete { key } => {
                        active.insert(key, seq, ValueType::Tombstone, b"")?;
                    }
                }
            }
        }

        let wal = Wal::open(&wal_dir, crate::wal::DEFAULT_SEGMENT_SIZE)?;
        let cache = Arc::new(BlockCache::new(config.cache_capacity_bytes));
        let (work_tx, work_rx) = unbounded();

        info!(dir = %dir.display(), recovered_batches = batches.len(), "engine opened");

        let background_threads = config.background_threads;
        let engine = Arc::new(Engine {
            dir,
            config,
            wal,
            manifest: Mutex::new(manifest),
            versions: Arc::new(versions),
            cache,
            next_seq: AtomicU64::new(max_seq + 1),
            next_file_number: AtomicU64::new(next_file_number),
            next_snapshot_id: AtomicU64::new(1),
            write_mutex: Mutex::new(()),
            wal_append_mutex: Mutex::new(()),
            flush_mutex: Mutex::new(()),
            compaction_mutex: Mutex::new(()),
            background_error: Mutex::new(None),
            active: RwLock::new(Arc::new(active)),
            frozen: Mutex::new(VecDeque::new()),
            readers: RwLock::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            work_tx,
            workers: Mutex::new(Vec::new()),
        });

        let workers: Vec<JoinHandle<()>> = (0..background_threads)
            .map(|_| {
                let engine = engine.clone();
                let rx: Receiver<WorkItem> = work_rx.clone();
                std::thread::spawn(move || {
                    for item in rx.iter() {
                        match item {
                            WorkItem::Flush => engine.run_flush_once(),
                            WorkItem::Compaction => engine.run_compaction_once(),
                            WorkItem::Shutdown => break,
                        }
                    }
                })
            })
            .collect();
        *engine.workers.lock().expect("workers mutex poisoned") = workers;

        Ok(engine)
    }

    /// Stops background workers and performs a final obsolete-file sweep.
    pub fn close(&self) -> Result<()> {
        for _ in 0..self.config.background_threads {
            let _ = self.work_tx.send(WorkItem::Shutdown);
        }
        let handles = std::mem::take(&mut *self.workers.lock().expect("workers mutex poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
        self.sweep_obsolete_files()?;
        info!("engine closed");
        Ok(())
    }

    fn check_background_error(&self) -> Result<()> {
        let guard = self.background_error.lock().expect("background error mutex poisoned");
        if let Some(cause) = guard.as_ref() {
            return Err(EngineError::BackgroundError(cause.clone()));
        }
        Ok(())
    }

    fn set_background_error(&self, err: &EngineError) {
        let mut guard = self.background_error.lock().expect("background error mutex poisoned");
        if guard.is_none() {
            error!(error = %err, "background worker failed, engine entering degraded state");
            *guard = Some(err.to_string());
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        trace!(key_len = key.len(), "put");
        self.write(vec![WalLogicalRecord::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }])
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        trace!(key_len = key.len(), "delete");
        self.write(vec![WalLogicalRecord::Delete { key: key.to_vec() }])
    }

    /// Applies a batch of logical records atomically: they receive a
    /// contiguous run of sequence numbers and become visible together.
    ///
    /// Sequence assignment and the WAL append/sync happen under the
    /// append-order lock, which serializes disk I/O without blocking
    /// concurrent reads; the write mutex is then taken only to apply the
    /// batch to the active memtable and decide on rotation.
    pub fn write(&self, records: Vec<WalLogicalRecord>) -> Result<()> {
        self.check_background_error()?;
        if records.is_empty() {
            return Err(EngineError::InvalidArgument("empty batch".into()));
        }

        let start_seq = {
            let _append_guard = self.wal_append_mutex.lock().expect("wal append mutex poisoned");
            let start_seq = self.next_seq.fetch_add(records.len() as u64, Ordering::SeqCst);
            if start_seq + records.len() as u64 - 1 > MAX_SEQUENCE_NUMBER {
                return Err(EngineError::InvalidArgument("sequence number space exhausted".into()));
            }
            let batch = WalBatch {
                start_seq,
                records: records.clone(),
            };
            self.wal.append(&batch)?;
            if self.config.sync_writes {
                self.wal.sync()?;
            }
            start_seq
        };

        let _write_guard = self.write_mutex.lock().expect("write mutex poisoned");
        let active = self.active.read().expect("active memtable lock poisoned").clone();
        for (i, record) in records.iter().enumerate() {
            let seq = start_seq + i as u64;
            match record {
                WalLogicalRecord::Put { key, value } => {
                    active.insert(key, seq, ValueType::Value, value)?;
                }
                WalLogicalRecord::Delete { key } => {
                    active.insert(key, seq, ValueType::Tombstone, b"")?;
                }
            }
        }
        let should_rotate = active.approximate_size() >= self.config.memtable_size_limit;
        drop(active);
        if should_rotate {
            self.rotate_memtable();
        }
        Ok(())
    }

    fn rotate_memtable(&self) {
        let mut guard = self.active.write().expect("active memtable lock poisoned");
        let old = guard.clone();
        *guard = Arc::new(Memtable::new());
        drop(guard);
        self.frozen.lock().expect("frozen list lock poisoned").push_back(old);
        debug!("memtable rotated");
        let _ = self.work_tx.send(WorkItem::Flush);
    }

    /// Looks up the newest version of `key` visible under `options`.
    /// Returns `EngineError::NotFound` if the top visible version is a
    /// tombstone or no version is visible.
    ///
    /// Checks the active and frozen memtables directly first, newest to
    /// oldest; a memtable holding any version of `key` always holds the
    /// newest one visible at `read_seq`, so the first hit settles the
    /// lookup without opening a single sorted-table reader. Only a miss
    /// across every memtable falls back to a merging scan of the
    /// candidate tables.
    pub fn get(&self, key: &[u8], options: ReadOptions) -> Result<Vec<u8>> {
        self.check_background_error()?;
        let read_seq = options.read_seq.unwrap_or_else(|| self.current_seq());

        let active = self.active.read().expect("active memtable lock poisoned").clone();
        match active.get(key, read_seq)? {
            MemtableLookup::Value(value) => return Ok(value),
            MemtableLookup::Tombstone => return Err(EngineError::NotFound),
            MemtableLookup::NotFound => {}
        }
        drop(active);
        for frozen in self.frozen.lock().expect("frozen list lock poisoned").iter().rev() {
            match frozen.get(key, read_seq)? {
                MemtableLookup::Value(value) => return Ok(value),
                MemtableLookup::Tombstone => return Err(EngineError::NotFound),
                MemtableLookup::NotFound => {}
            }
        }

        let search_key = InternalKey::new(key, MAX_SEQUENCE_NUMBER, ValueType::Value)?;
        let tables = self.open_table_iterators(key)?;
        let mut merged = SnapshotFilter::new(MergingIterator::new(tables, true), read_seq);
        merged.seek(search_key.as_ref().as_bytes());
        if !merged.valid() {
            if let Some(e) = merged.take_error() {
                return Err(e.into());
            }
            return Err(EngineError::NotFound);
        }
        let ikey = InternalKeyRef::new(merged.key());
        if ikey.user_key()? != key {
            return Err(EngineError::NotFound);
        }
        match ikey.seq_and_type()?.1 {
            ValueType::Value => Ok(merged.value().to_vec()),
            ValueType::Tombstone => Err(EngineError::NotFound),
        }
    }

    fn current_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Opens one iterator per candidate sorted table whose range and
    /// Bloom filter don't rule out `hint_key` (pass an empty key to
    /// include every table). Held under the write mutex — read-only, for
    /// the duration of mapping the tables' fds — then released once the
    /// iterators are constructed.
    fn open_table_iterators(&self, hint_key: &[u8]) -> Result<Vec<Box<dyn KvIterator + Send>>> {
        let _write_guard = self.write_mutex.lock().expect("write mutex poisoned");
        let mut children: Vec<Box<dyn KvIterator + Send>> = Vec::new();
        for table in self.versions.all() {
            if !hint_key.is_empty() && !table.may_contain_key(hint_key) {
                continue;
            }
            let reader = self.open_reader(table.file_number)?;
            if !hint_key.is_empty() && !reader.may_contain(hint_key) {
                continue;
            }
            children.push(Box::new(reader.iterator()));
        }
        Ok(children)
    }

    /// Builds the merging-iterator fan-in used by the iterator
    /// constructors: the active memtable, every frozen memtable, and
    /// every candidate sorted table (via [`Engine::open_table_iterators`]).
    fn build_merging_iterator(&self, hint_key: &[u8]) -> Result<MergingIterator> {
        let mut children: Vec<Box<dyn KvIterator + Send>> = Vec::new();

        let active = self.active.read().expect("active memtable lock poisoned").clone();
        children.push(Box::new(active.snapshot()));
        for frozen in self.frozen.lock().expect("frozen list lock poisoned").iter() {
            children.push(Box::new(frozen.snapshot()));
        }
        children.extend(self.open_table_iterators(hint_key)?);

        Ok(MergingIterator::new(children, true))
    }

    fn open_reader(&self, file_number: u64) -> Result<Arc<TableReader>> {
        if let Some(reader) = self.readers.read().expect("readers lock poisoned").get(&file_number) {
            return Ok(reader.clone());
        }
        let mut guard = self.readers.write().expect("readers lock poisoned");
        if let Some(reader) = guard.get(&file_number) {
            return Ok(reader.clone());
        }
        let reader = Arc::new(TableReader::open(
            table_path(&self.dir, file_number),
            self.cache.clone(),
        )?);
        guard.insert(file_number, reader.clone());
        Ok(reader)
    }

    pub fn snapshot(&self) -> Snapshot {
        let seq = self.current_seq();
        let id = self.next_snapshot_id.fetch_add(1, Ordering::SeqCst);
        self.snapshots.lock().expect("snapshots lock poisoned").insert(id, seq);
        Snapshot { id, seq }
    }

    pub fn release(&self, snapshot: Snapshot) {
        self.snapshots.lock().expect("snapshots lock poisoned").remove(&snapshot.id);
    }

    fn oldest_live_snapshot_seq(&self) -> Option<u64> {
        self.snapshots
            .lock()
            .expect("snapshots lock poisoned")
            .values()
            .min()
            .copied()
    }

    /// A forward iterator over every visible key, newest version only.
    pub fn iterator(&self, options: ReadOptions) -> Result<EngineIterator> {
        self.range_iterator(&[], &[], options)
    }

    /// A forward iterator restricted to `[start, end)`. An empty `end`
    /// means unbounded.
    pub fn range_iterator(&self, start: &[u8], end: &[u8], options: ReadOptions) -> Result<EngineIterator> {
        self.check_background_error()?;
        let read_seq = options.read_seq.unwrap_or_else(|| self.current_seq());
        let merged = self.build_merging_iterator(&[])?;
        let filtered = SnapshotFilter::new(merged, read_seq);
        let bound = if start.is_empty() && end.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Range(start.to_vec(), end.to_vec())
        };
        let mut bounded = BoundedIterator::new(filtered, bound);
        bounded.seek_to_first();
        if let Some(e) = bounded.take_error() {
            return Err(e.into());
        }
        Ok(EngineIterator { inner: bounded })
    }

    /// A forward iterator over every key sharing `prefix`.
    pub fn prefix_iterator(&self, prefix: &[u8], options: ReadOptions) -> Result<EngineIterator> {
        self.check_background_error()?;
        let read_seq = options.read_seq.unwrap_or_else(|| self.current_seq());
        let merged = self.build_merging_iterator(&[])?;
        let filtered = SnapshotFilter::new(merged, read_seq);
        let mut bounded = BoundedIterator::new(filtered, Bound::Prefix(prefix.to_vec()));
        bounded.seek_to_first();
        if let Some(e) = bounded.take_error() {
            return Err(e.into());
        }
        Ok(EngineIterator { inner: bounded })
    }

    /// Snapshots the current version set and WAL cutoff, rewrites the
    /// manifest atomically to that snapshot, and reopens it. Holds the
    /// write mutex across the whole snapshot+rewrite+reopen sequence so
    /// no concurrent commit can append to the manifest mid-rewrite. If
    /// the rewrite itself fails, re-opens the original manifest path
    /// before surfacing the error, so a failed compaction never leaves
    /// the engine without a readable manifest handle.
    pub fn compact_manifest(&self) -> Result<()> {
        let _write_guard = self.write_mutex.lock().expect("write mutex poisoned");
        let path = manifest_path(&self.dir);
        let records = snapshot_records(&self.versions);
        let rewritten = match Manifest::rewrite(&path, &records) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                let reopened = Manifest::open(&path)?;
                *self.manifest.lock().expect("manifest lock poisoned") = reopened;
                return Err(e.into());
            }
        };
        *self.manifest.lock().expect("manifest lock poisoned") = rewritten;
        info!(records = records.len(), "manifest compacted");
        Ok(())
    }

    fn run_flush_once(&self) {
        let Ok(_guard) = self.flush_mutex.try_lock() else {
            return;
        };
        loop {
            let memtable = self.frozen.lock().expect("frozen list lock poisoned").front().cloned();
            let Some(memtable) = memtable else { break };
            match self.flush_one(&memtable) {
                Ok(()) => {
                    self.frozen.lock().expect("frozen list lock poisoned").pop_front();
                }
                Err(e) => {
                    self.set_background_error(&e);
                    break;
                }
            }
        }
    }

    fn flush_one(&self, memtable: &Memtable) -> Result<()> {
        if memtable.is_empty() {
            return Ok(());
        }
        info!("flush start");
        let file_number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
        let mut builder = TableBuilder::new(
            table_path(&self.dir, file_number),
            self.config.block_size,
            self.config.compression_type,
            self.config.bits_per_key,
        )?;

        let mut it = memtable.snapshot();
        it.seek_to_first();
        while let (Some(key), Some(value)) = (it.key(), it.value()) {
            builder.add(key.as_ref().as_bytes(), value)?;
            it.next();
        }
        let info = builder.close()?;

        let meta = TableMetadata {
            file_number,
            level: 0,
            smallest_seq: info.smallest_seq,
            largest_seq: info.largest_seq,
            smallest_key: info.smallest_key,
            largest_key: info.largest_key,
            file_size: info.file_size,
        };

        {
            let manifest = self.manifest.lock().expect("manifest lock poisoned");
            manifest.append(&ManifestRecord::AddSSTable(meta.clone()))?;
            manifest.append(&ManifestRecord::SetWalCutoff(meta.largest_seq))?;
        }
        {
            let _write_guard = self.write_mutex.lock().expect("write mutex poisoned");
            self.versions.add(meta.clone())?;
            self.versions.set_wal_cutoff(meta.largest_seq);
        }
        self.wal.truncate(meta.largest_seq)?;
        info!(file_number, largest_seq = meta.largest_seq, "flush commit");

        let _ = self.work_tx.send(WorkItem::Compaction);
        Ok(())
    }

    fn run_compaction_once(&self) {
        let Ok(_guard) = self.compaction_mutex.try_lock() else {
            return;
        };
        loop {
            let pick = self.versions.pick_compaction(self.config.l0_compaction_trigger, self.config.l1_max_bytes);
            if !pick.should_compact {
                break;
            }
            if let Err(e) = self.compact_level(pick.level) {
                self.set_background_error(&e);
                break;
            }
        }
    }

    fn select_inputs(&self, level: usize) -> Vec<TableMetadata> {
        if level == 0 {
            let l0 = self.versions.level(0);
            if l0.is_empty() {
                return Vec::new();
            }
            let (start, end) = user_key_union(&l0);
            let mut inputs = l0;
            inputs.extend(self.versions.overlapping(1, &start, &end));
            inputs
        } else {
            let mut at_level = self.versions.level(level);
            at_level.sort_by(|a, b| a.smallest_key.cmp(&b.smallest_key));
            let Some(first) = at_level.into_iter().next() else {
                return Vec::new();
            };
            let start = user_key(&first.smallest_key);
            let end = user_key(&first.largest_key);
            let mut inputs = vec![first];
            inputs.extend(self.versions.overlapping(level + 1, &start, &end));
            inputs
        }
    }

    fn any_deeper_table_overlaps(&self, output_level: usize, user_key: &[u8]) -> bool {
        ((output_level + 1)..NUM_LEVELS).any(|level| {
            self.versions
                .level(level)
                .iter()
                .any(|t| t.may_contain_key(user_key))
        })
    }

    /// Merges `level`'s compaction inputs with the overlapping tables one
    /// level down, writing one or more new tables at `level + 1`.
    /// Compaction inputs are merged without per-user-key collapsing so
    /// every version still visible to some open snapshot survives; a
    /// tombstone is dropped only once no snapshot can see it and no
    /// deeper level could hold the user key it shadows.
    fn compact_level(&self, level: usize) -> Result<()> {
        let inputs = self.select_inputs(level);
        if inputs.is_empty() {
            return Ok(());
        }
        let output_level = level + 1;
        info!(level, output_level, inputs = inputs.len(), "compaction start");

        let readers: Vec<Arc<TableReader>> = inputs
            .iter()
            .map(|m| self.open_reader(m.file_number))
            .collect::<Result<_>>()?;
        let children: Vec<Box<dyn KvIterator + Send>> =
            readers.iter().map(|r| Box::new(r.iterator()) as Box<dyn KvIterator + Send>).collect();
        let mut merged = MergingIterator::new(children, false);
        merged.seek_to_first();

        let oldest_snapshot_seq = self.oldest_live_snapshot_seq().unwrap_or(u64::MAX);
        let mut outputs: Vec<TableMetadata> = Vec::new();
        let mut current: Option<(u64, TableBuilder)> = None;
        let mut current_user_key: Option<Vec<u8>> = None;
        let mut dropping_current_key = false;

        while merged.valid() {
            let ikey = merged.key().to_vec();
            let ikref = InternalKeyRef::new(&ikey);
            let uk = ikref.user_key()?.to_vec();
            let (seq, kind) = ikref.seq_and_type()?;

            if current_user_key.as_deref() != Some(uk.as_slice()) {
                current_user_key = Some(uk.clone());
                dropping_current_key = false;
            }
            if dropping_current_key {
                merged.next();
                continue;
            }
            if kind == ValueType::Tombstone
                && seq <= oldest_snapshot_seq
                && !self.any_deeper_table_overlaps(output_level, &uk)
            {
                dropping_current_key = true;
                merged.next();
                continue;
            }

            if current.is_none() {
                let file_number = self.next_file_number.fetch_add(1, Ordering::SeqCst);
                let builder = TableBuilder::new(
                    table_path(&self.dir, file_number),
                    self.config.block_size,
                    self.config.compression_type,
                    self.config.bits_per_key,
                )?;
                current = Some((file_number, builder));
            }
            {
                let (_, builder) = current.as_mut().expect("just inserted");
                builder.add(&ikey, merged.value())?;
            }
            let should_split = current.as_ref().expect("just inserted").1.current_size_estimate()
                >= self.config.max_compaction_output_bytes;
            if should_split {
                let (file_number, builder) = current.take().expect("just checked");
                outputs.push(finish_output(builder, file_number, output_level)?);
            }
            merged.next();
        }
        if let Some((file_number, builder)) = current.take() {
            outputs.push(finish_output(builder, file_number, output_level)?);
        }

        {
            let manifest = self.manifest.lock().expect("manifest lock poisoned");
            for input in &inputs {
                manifest.append(&ManifestRecord::RemoveSSTable(input.file_number))?;
            }
            for output in &outputs {
                manifest.append(&ManifestRecord::AddSSTable(output.clone()))?;
            }
        }
        {
            let _write_guard = self.write_mutex.lock().expect("write mutex poisoned");
            for input in &inputs {
                self.versions.remove(input.file_number);
            }
            for output in outputs.iter().cloned() {
                self.versions.add(output)?;
            }
        }
        self.sweep_obsolete_files()?;
        info!(level, output_level, outputs = outputs.len(), "compaction commit");
        Ok(())
    }

    fn sweep_obsolete_files(&self) -> Result<()> {
        for file_number in self.versions.drain_obsolete() {
            self.readers.write().expect("readers lock poisoned").remove(&file_number);
            let path = table_path(&self.dir, file_number);
            if path.exists() {
                fs::remove_file(&path)?;
                debug!(file_number, "obsolete table deleted");
            }
        }
        Ok(())
    }
}

fn finish_output(builder: TableBuilder, file_number: u64, level: usize) -> Result<TableMetadata> {
    let info = builder.close()?;
    Ok(TableMetadata {
        file_number,
        level,
        smallest_seq: info.smallest_seq,
        largest_seq: info.largest_seq,
        smallest_key: info.smallest_key,
        largest_key: info.largest_key,
        file_size: info.file_size,
    })
}

fn user_key(internal_key: &[u8]) -> Vec<u8> {
    internal_key::extract_user_key(internal_key)
        .map(|k| k.to_vec())
        .unwrap_or_else(|_| internal_key.to_vec())
}

fn user_key_union(tables: &[TableMetadata]) -> (Vec<u8>, Vec<u8>) {
    let mut start: Option<Vec<u8>> = None;
    let mut end: Option<Vec<u8>> = None;
    for table in tables {
        let s = user_key(&table.smallest_key);
        let e = user_key(&table.largest_key);
        if start.as_ref().is_none_or(|cur| &s < cur) {
            start = Some(s);
        }
        if end.as_ref().is_none_or(|cur| &e > cur) {
            end = Some(e);
        }
    }
    (start.unwrap_or_default(), end.unwrap_or_default())
}

/// Owns the chain of iterator adapters behind a public scan; pins open
/// table readers for its lifetime via the `Arc<TableReader>` handles its
/// underlying `TableIterator`s hold.
pub struct EngineIterator {
    inner: BoundedIterator<SnapshotFilter<MergingIterator>>,
}

impl EngineIterator {
    /// Takes any error that ended this iteration early (a corrupt or
    /// undecodable block), distinguishing that from having simply
    /// scanned past the end of the bound. Only meaningful to call once
    /// iteration has stopped producing items.
    pub fn take_error(&mut self) -> Option<crate::sstable::SSTableError> {
        self.inner.take_error()
    }
}

impl Iterator for EngineIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.inner.valid() {
            return None;
        }
        let ikey = InternalKeyRef::new(self.inner.key());
        let key = ikey.user_key().ok()?.to_vec();
        let value = self.inner.value().to_vec();
        self.inner.next();
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_engine(dir: &Path) -> Arc<Engine> {
        Engine::open(
            dir,
            EngineConfig {
                memtable_size_limit: 1024,
                sync_writes: false,
                ..EngineConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path());
        engine.put(b"hello", b"world").unwrap();
        assert_eq!(engine.get(b"hello", ReadOptions::default()).unwrap(), b"world");
        engine.delete(b"hello").unwrap();
        assert!(matches!(engine.get(b"hello", ReadOptions::default()), Err(EngineError::NotFound)));
        engine.close().unwrap();
    }

    #[test]
    fn recovers_after_reopen() {
        let dir = tempdir().unwrap();
        {
            let engine = open_engine(dir.path());
            engine.put(b"a", b"1").unwrap();
            engine.put(b"b", b"2").unwrap();
            engine.close().unwrap();
        }
        let engine = open_engine(dir.path());
        assert_eq!(engine.get(b"a", ReadOptions::default()).unwrap(), b"1");
        assert_eq!(engine.get(b"b", ReadOptions::default()).unwrap(), b"2");
        engine.close().unwrap();
    }

    #[test]
    fn snapshot_isolates_later_writes() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path());
        engine.put(b"k", b"v1").unwrap();
        let snap = engine.snapshot();
        engine.put(b"k", b"v2").unwrap();

        let opts = ReadOptions { read_seq: Some(snap.seq()) };
        assert_eq!(engine.get(b"k", opts).unwrap(), b"v1");
        assert_eq!(engine.get(b"k", ReadOptions::default()).unwrap(), b"v2");
        engine.release(snap);
        engine.close().unwrap();
    }

    #[test]
    fn tombstone_hidden_from_snapshot_taken_before_it() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path());
        engine.put(b"k", b"v1").unwrap();
        let snap = engine.snapshot();
        engine.delete(b"k").unwrap();

        let opts = ReadOptions { read_seq: Some(snap.seq()) };
        assert_eq!(engine.get(b"k", opts).unwrap(), b"v1");
        assert!(matches!(
            engine.get(b"k", ReadOptions::default()),
            Err(EngineError::NotFound)
        ));
        engine.release(snap);
        engine.close().unwrap();
    }

    #[test]
    fn range_iterator_respects_bounds() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path());
        for k in ["a", "b", "c", "d"] {
            engine.put(k.as_bytes(), b"v").unwrap();
        }
        let results: Vec<_> = engine
            .range_iterator(b"b", b"d", ReadOptions::default())
            .unwrap()
            .collect();
        assert_eq!(
            results.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![b"b".to_vec(), b"c".to_vec()]
        );
        engine.close().unwrap();
    }

    #[test]
    fn flush_promotes_memtable_to_l0_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path());
        for i in 0..200u32 {
            engine.put(format!("key-{i:05}").as_bytes(), format!("value-{i}").as_bytes()).unwrap();
        }
        // Nudge the background flush actor and give it a moment to run.
        std::thread::sleep(std::time::Duration::from_millis(200));
        engine.close().unwrap();

        let engine = open_engine(dir.path());
        assert_eq!(engine.get(b"key-00000", ReadOptions::default()).unwrap(), b"value-0");
        assert_eq!(engine.get(b"key-00199", ReadOptions::default()).unwrap(), b"value-199");
        engine.close().unwrap();
    }

    #[test]
    fn compact_manifest_preserves_visible_state() {
        let dir = tempdir().unwrap();
        let engine = open_engine(dir.path());
        engine.put(b"a", b"1").unwrap();
        engine.compact_manifest().unwrap();
        engine.close().unwrap();

        let engine = open_engine(dir.path());
        assert_eq!(engine.get(b"a", ReadOptions::default()).unwrap(), b"1");
        engine.close().unwrap();
    }
}
