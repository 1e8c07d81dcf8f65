//! Builds one immutable on-disk sorted table from a stream of internal
//! keys presented in strictly ascending order.
//!
//! Output layout: `[data blocks] [filter block] [meta-index block]
//! [index block] [footer]`. The file is assembled in a sibling `.tmp`
//! file and atomically renamed into place so a crash mid-build never
//! leaves a partially written table at its final path.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::internal_key;

use super::block::BlockBuilder;
use super::filter;
use super::{
    BlockHandle, CompressionType, FILTER_META_NAME, Footer, Result, SSTableError,
    finish_block_on_disk,
};

/// Metadata describing the table that was just built, sufficient to
/// register it with the version set.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub smallest_seq: u64,
    pub largest_seq: u64,
    pub smallest_key: Vec<u8>,
    pub largest_key: Vec<u8>,
    pub file_size: u64,
    pub entry_count: u64,
}

/// Incrementally builds one sorted table file.
pub struct TableBuilder {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    block_size: usize,
    compression: CompressionType,
    bits_per_key: usize,

    current_block: BlockBuilder,
    pending_index: Vec<(Vec<u8>, BlockHandle)>,
    filter_keys: Vec<Vec<u8>>,

    smallest_key: Option<Vec<u8>>,
    largest_key: Option<Vec<u8>>,
    smallest_seq: u64,
    largest_seq: u64,
    entry_count: u64,
    last_internal_key: Option<Vec<u8>>,
}

impl TableBuilder {
    pub fn new(
        path: impl AsRef<Path>,
        block_size: usize,
        compression: CompressionType,
        bits_per_key: usize,
    ) -> Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("sst.tmp");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        Ok(TableBuilder {
            final_path,
            tmp_path,
            writer: BufWriter::new(file),
            offset: 0,
            block_size,
            compression,
            bits_per_key,
            current_block: BlockBuilder::new(super::block::RESTART_INTERVAL),
            pending_index: Vec::new(),
            filter_keys: Vec::new(),
            smallest_key: None,
            largest_key: None,
            smallest_seq: u64::MAX,
            largest_seq: 0,
            entry_count: 0,
            last_internal_key: None,
        })
    }

    /// Appends one entry. `internal_key` must be strictly greater than
    /// every key added so far.
    pub fn add(&mut self, internal_key: &[u8], value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_internal_key
            && crate::internal_key::InternalKeyRef::new(last)
                >= crate::internal_key::InternalKeyRef::new(internal_key)
        {
            return Err(SSTableError::CorruptBlock);
        }
        let (user_key, seq, _ty) = internal_key::decode(internal_key)?;
        if self.smallest_key.is_none() {
            self.smallest_key = Some(internal_key.to_vec());
        }
        self.largest_key = Some(internal_key.to_vec());
        self.smallest_seq = self.smallest_seq.min(seq);
        self.largest_seq = self.largest_seq.max(seq);
        self.entry_count += 1;
        self.filter_keys.push(user_key.to_vec());
        self.last_internal_key = Some(internal_key.to_vec());

        self.current_block.add(internal_key, value);
        if self.current_block.current_size_estimate() >= self.block_size {
            self.finish_current_block()?;
        }
        Ok(())
    }

    fn finish_current_block(&mut self) -> Result<()> {
        if self.current_block.is_empty() {
            return Ok(());
        }
        let finished = std::mem::replace(
            &mut self.current_block,
            BlockBuilder::new(super::block::RESTART_INTERVAL),
        );
        let last_key = self
            .last_internal_key
            .clone()
            .expect("block has at least one entry");
        let payload = finished.finish();
        let handle = self.write_block(&payload)?;
        self.pending_index.push((last_key, handle));
        Ok(())
    }

    fn write_block(&mut self, payload: &[u8]) -> Result<BlockHandle> {
        let on_disk = finish_block_on_disk(payload, self.compression);
        let handle = BlockHandle {
            offset: self.offset,
            length: on_disk.len() as u64,
        };
        self.writer.write_all(&on_disk)?;
        self.offset += on_disk.len() as u64;
        Ok(handle)
    }

    /// Flushes the final block, builds the filter/meta-index/index
    /// blocks, writes the footer, fsyncs, and atomically renames the
    /// file into place.
    pub fn close(mut self) -> Result<TableInfo> {
        self.finish_current_block()?;

        let filter_refs: Vec<&[u8]> = self.filter_keys.iter().map(|k| k.as_slice()).collect();
        let filter_bytes = filter::build(&filter_refs, self.bits_per_key);
        let filter_handle = self.write_block(&filter_bytes)?;

        let mut meta_index_block = BlockBuilder::new(super::block::RESTART_INTERVAL);
        meta_index_block.add(FILTER_META_NAME.as_bytes(), &filter_handle.encode());
        let meta_index_payload = meta_index_block.finish();
        let meta_index_handle = self.write_block(&meta_index_payload)?;

        let mut index_block = BlockBuilder::new(super::block::RESTART_INTERVAL);
        for (key, handle) in &self.pending_index {
            index_block.add(key, &handle.encode());
        }
        let index_payload = index_block.finish();
        let index_handle = self.write_block(&index_payload)?;

        let footer = Footer {
            meta_index_handle,
            index_handle,
        };
        self.writer.write_all(&footer.encode())?;
        self.offset += super::FOOTER_SIZE as u64;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        drop(self.writer);

        fs::rename(&self.tmp_path, &self.final_path)?;
        if let Some(parent) = self.final_path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }

        Ok(TableInfo {
            smallest_seq: self.smallest_seq,
            largest_seq: self.largest_seq,
            smallest_key: self.smallest_key.unwrap_or_default(),
            largest_key: self.largest_key.unwrap_or_default(),
            file_size: self.offset,
            entry_count: self.entry_count,
        })
    }

    pub fn current_size_estimate(&self) -> u64 {
        self.offset + self.current_block.current_size_estimate() as u64
    }
}
