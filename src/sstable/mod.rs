//! Immutable, sorted on-disk table: data blocks, a Bloom filter block, a
//! meta-index block, an index block, and a fixed-size footer.
//!
//! ```text
//! [data block 0] [data block 1] ... [filter block] [meta-index block] [index block] [footer]
//! ```
//!
//! Every block except the footer is wrapped on disk as
//! `payload | compression_type(u8) | crc32(payload || compression_type)(u32)`.

pub mod block;
pub mod builder;
pub mod filter;
pub mod reader;
mod varint;

use thiserror::Error;

pub use builder::TableBuilder;
pub use reader::TableReader;

/// Magic trailer identifying a valid footer, matching the reference
/// on-disk format this store is wire-compatible with.
pub const MAGIC: u64 = 0x5645_524E_0000_0008;
pub const FOOTER_SIZE: usize = 16 + 16 + 8;
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
pub const FILTER_META_NAME: &str = "filter.bloom";

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_ZLIB: u8 = 1;
const BLOCK_TRAILER_SIZE: usize = 1 + 4;

#[derive(Debug, Error)]
pub enum SSTableError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("unsupported block compression type {0}")]
    UnsupportedCompression(u8),

    #[error("corrupt footer")]
    CorruptFooter,

    #[error("bad magic number: {0:#x}")]
    BadMagic(u64),

    #[error("corrupt block")]
    CorruptBlock,

    #[error("missing filter meta-index entry")]
    MissingFilter,

    #[error(transparent)]
    InternalKey(#[from] crate::internal_key::InternalKeyError),
}

pub type Result<T> = std::result::Result<T, SSTableError>;

/// On-disk compression applied to each block independently of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Zlib,
}

impl CompressionType {
    fn to_byte(self) -> u8 {
        match self {
            CompressionType::None => COMPRESSION_NONE,
            CompressionType::Zlib => COMPRESSION_ZLIB,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            COMPRESSION_NONE => Ok(CompressionType::None),
            COMPRESSION_ZLIB => Ok(CompressionType::Zlib),
            other => Err(SSTableError::UnsupportedCompression(other)),
        }
    }
}

/// Byte range of one block within the table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub length: u64,
}

impl BlockHandle {
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(SSTableError::CorruptFooter);
        }
        let offset = u64::from_le_bytes(buf[0..8].try_into().expect("8 bytes"));
        let length = u64::from_le_bytes(buf[8..16].try_into().expect("8 bytes"));
        Ok(BlockHandle { offset, length })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Footer {
    pub meta_index_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..16].copy_from_slice(&self.meta_index_handle.encode());
        buf[16..32].copy_from_slice(&self.index_handle.encode());
        buf[32..40].copy_from_slice(&MAGIC.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FOOTER_SIZE {
            return Err(SSTableError::CorruptFooter);
        }
        let meta_index_handle = BlockHandle::decode(&buf[0..16])?;
        let index_handle = BlockHandle::decode(&buf[16..32])?;
        let magic = u64::from_le_bytes(buf[32..40].try_into().expect("8 bytes"));
        if magic != MAGIC {
            return Err(SSTableError::BadMagic(magic));
        }
        Ok(Footer {
            meta_index_handle,
            index_handle,
        })
    }
}

/// Wraps a block payload with its on-disk compression + CRC trailer.
pub(crate) fn finish_block_on_disk(payload: &[u8], compression: CompressionType) -> Vec<u8> {
    let body = match compression {
        CompressionType::None => payload.to_vec(),
        CompressionType::Zlib => {
            use flate2::Compression;
            use flate2::write::ZlibEncoder;
            use std::io::Write;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            // A compression failure here is an allocator-level fault, not a
            // data condition; fall back to storing uncompressed.
            if encoder.write_all(payload).is_err() {
                payload.to_vec()
            } else {
                match encoder.finish() {
                    Ok(compressed) if compressed.len() + 2 < payload.len() => compressed,
                    _ => payload.to_vec(),
                }
            }
        }
    };
    let actual_compression = if body.len() == payload.len() && compression == CompressionType::Zlib
    {
        CompressionType::None
    } else {
        compression
    };
    let mut out = Vec::with_capacity(body.len() + BLOCK_TRAILER_SIZE);
    out.extend_from_slice(&body);
    out.push(actual_compression.to_byte());
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// Reads and validates one on-disk block given its handle's bytes
/// (`payload | compression_type | crc32`), returning the decompressed
/// payload.
pub(crate) fn read_block_on_disk(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < BLOCK_TRAILER_SIZE {
        return Err(SSTableError::CorruptBlock);
    }
    let split = raw.len() - 4;
    let expected = u32::from_le_bytes(raw[split..].try_into().expect("4 bytes"));
    let actual = crc32fast::hash(&raw[..split]);
    if expected != actual {
        return Err(SSTableError::ChecksumMismatch {
            expected,
            actual,
        });
    }
    let compression_byte = raw[split - 1];
    let compression = CompressionType::from_byte(compression_byte)?;
    let payload = &raw[..split - 1];
    match compression {
        CompressionType::None => Ok(payload.to_vec()),
        CompressionType::Zlib => {
            use flate2::read::ZlibDecoder;
            use std::io::Read;
            let mut decoder = ZlibDecoder::new(payload);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| SSTableError::CorruptBlock)?;
            Ok(out)
        }
    }
}
