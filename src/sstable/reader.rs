//! Opens an immutable on-disk table for reads: footer, index block, and
//! filter block are parsed eagerly at `open`; data blocks are paged in on
//! demand through the shared [`crate::cache::BlockCache`].

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::cache::{BlockCache, CacheKey};

use super::block::BlockIterator;
use super::{BlockHandle, FILTER_META_NAME, Footer, Result, SSTableError, filter, read_block_on_disk};

/// A memory-mapped, immutable sorted table.
pub struct TableReader {
    path: PathBuf,
    mmap: Mmap,
    index_block: Arc<Vec<u8>>,
    filter_block: Option<Arc<Vec<u8>>>,
    cache: Arc<BlockCache>,
}

impl TableReader {
    pub fn open(path: impl AsRef<Path>, cache: Arc<BlockCache>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // Safety: tables are never mutated after `TableBuilder::close` has
        // renamed them into place, so a read-only mapping observes a
        // stable file for the reader's entire lifetime.
        let mmap = unsafe { Mmap::map(&file)? };
        if mmap.len() < super::FOOTER_SIZE {
            return Err(SSTableError::CorruptFooter);
        }
        let footer = Footer::decode(&mmap[mmap.len() - super::FOOTER_SIZE..])?;

        let index_raw = read_handle(&mmap, &footer.index_handle)?;
        let index_block = Arc::new(read_block_on_disk(&index_raw)?);

        let meta_index_raw = read_handle(&mmap, &footer.meta_index_handle)?;
        let meta_index_block = read_block_on_disk(&meta_index_raw)?;
        let filter_block = find_filter_handle(&meta_index_block)
            .map(|handle| -> Result<Arc<Vec<u8>>> {
                let raw = read_handle(&mmap, &handle)?;
                Ok(Arc::new(read_block_on_disk(&raw)?))
            })
            .transpose()?;

        Ok(TableReader {
            path,
            mmap,
            index_block,
            filter_block,
            cache,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `user_key` could be present in this table, per the Bloom
    /// filter. A `false` result is definitive; `true` requires a real
    /// lookup.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        match &self.filter_block {
            Some(bits) => filter::may_contain(bits, user_key),
            None => true,
        }
    }

    fn load_data_block(&self, handle: &BlockHandle) -> Result<Arc<Vec<u8>>> {
        let key = CacheKey::new(self.path.clone(), handle.offset);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        let raw = read_handle(&self.mmap, handle)?;
        let decoded = Arc::new(read_block_on_disk(&raw)?);
        self.cache.put(key, decoded.clone());
        Ok(decoded)
    }

    /// A two-level iterator over this table's internal-key-ordered entries.
    pub fn iterator(self: &Arc<Self>) -> TableIterator {
        TableIterator::new(self.clone())
    }
}

fn read_handle(mmap: &Mmap, handle: &BlockHandle) -> Result<Vec<u8>> {
    let start = handle.offset as usize;
    let end = start + handle.length as usize;
    if end > mmap.len() {
        return Err(SSTableError::CorruptBlock);
    }
    Ok(mmap[start..end].to_vec())
}

fn find_filter_handle(meta_index_block: &[u8]) -> Option<BlockHandle> {
    let mut it = BlockIterator::new(Arc::new(meta_index_block.to_vec()))?;
    it.seek_to_first();
    while it.valid() {
        if it.key() == FILTER_META_NAME.as_bytes() {
            return BlockHandle::decode(it.value()).ok();
        }
        it.next();
    }
    None
}

/// Two-level iterator: walks the index block to find the data block
/// covering the current position, then iterates within that block.
pub struct TableIterator {
    reader: Arc<TableReader>,
    index_iter: BlockIterator,
    data_iter: Option<BlockIterator>,
    error: Option<SSTableError>,
}

impl TableIterator {
    fn new(reader: Arc<TableReader>) -> Self {
        let index_iter = BlockIterator::new(reader.index_block.clone())
            .expect("index block was validated at open");
        TableIterator {
            reader,
            index_iter,
            data_iter: None,
            error: None,
        }
    }

    fn load_block_at_index(&mut self) {
        self.data_iter = None;
        if !self.index_iter.valid() {
            return;
        }
        let handle = match BlockHandle::decode(self.index_iter.value()) {
            Ok(h) => h,
            Err(e) => {
                self.error = Some(e);
                return;
            }
        };
        match self.reader.load_data_block(&handle) {
            Ok(bytes) => {
                self.data_iter = BlockIterator::new(bytes);
            }
            Err(e) => self.error = Some(e),
        }
    }

    pub fn seek_to_first(&mut self) {
        self.error = None;
        self.index_iter.seek_to_first();
        self.load_block_at_index();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek_to_first();
        }
        self.skip_empty_blocks_forward();
    }

    /// Seeks to the first entry with internal key `>= target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.error = None;
        self.index_iter.seek(target);
        self.load_block_at_index();
        if let Some(it) = self.data_iter.as_mut() {
            it.seek(target);
        }
        self.skip_empty_blocks_forward();
    }

    pub fn next(&mut self) {
        if let Some(it) = self.data_iter.as_mut() {
            it.next();
        }
        self.skip_empty_blocks_forward();
    }

    fn skip_empty_blocks_forward(&mut self) {
        while self.error.is_none() && !self.data_iter.as_ref().is_some_and(|it| it.valid()) {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.load_block_at_index();
            if let Some(it) = self.data_iter.as_mut() {
                it.seek_to_first();
            } else {
                return;
            }
        }
    }

    pub fn valid(&self) -> bool {
        self.error.is_none() && self.data_iter.as_ref().is_some_and(|it| it.valid())
    }

    pub fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid() checked").key()
    }

    pub fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid() checked").value()
    }

    pub fn take_error(&mut self) -> Option<SSTableError> {
        self.error.take()
    }
}
