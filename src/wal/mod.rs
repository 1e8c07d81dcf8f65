//! Write-ahead log: a directory of sequentially numbered, append-only
//! segment files (`wal_NNNNNN.log`) that records every batch durably
//! before it is applied to the in-memory index.
//!
//! # On-disk format
//!
//! Each batch is framed as:
//!
//! ```text
//! crc32(length || header || payload)   u32 LE
//! length(header || payload)            u32 LE
//! header:
//!     record_type                      u8      (0x01 = batch)
//!     flags                            u8      (reserved, 0)
//!     reserved                         u16
//!     start_seq                        u64 LE
//!     record_count                     u32 LE
//! payload, repeated record_count times:
//!     key_len                          u32 LE
//!     value_len                        u32 LE  (0 for a delete)
//!     logical_type                     u8      (0x01 = put, 0x02 = delete)
//!     key bytes
//!     value bytes                      (present only for put)
//! ```
//!
//! Recovery reads segments in ascending file-number order and stops at the
//! first frame that fails CRC or shape validation — a partially written
//! tail is the expected shape of a crash, not an error.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default maximum size of one segment file before rotation (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

const SEGMENT_PREFIX: &str = "wal_";
const SEGMENT_SUFFIX: &str = ".log";
const HEADER_LEN: usize = 16;
const RECORD_TYPE_BATCH: u8 = 0x01;
const LOGICAL_PUT: u8 = 0x01;
const LOGICAL_DELETE: u8 = 0x02;

/// Errors produced by the write-ahead log.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record of {0} bytes exceeds the segment size limit")]
    RecordTooLarge(usize),
}

type Result<T> = std::result::Result<T, WalError>;

/// One logical mutation inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalLogicalRecord {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// A group of logical records sharing a contiguous run of sequence numbers
/// starting at `start_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalBatch {
    pub start_seq: u64,
    pub records: Vec<WalLogicalRecord>,
}

impl WalBatch {
    pub fn last_seq(&self) -> u64 {
        self.start_seq + self.records.len() as u64 - 1
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for record in &self.records {
            match record {
                WalLogicalRecord::Put { key, value } => {
                    payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                    payload.extend_from_slice(&(value.len() as u32).to_le_bytes());
                    payload.push(LOGICAL_PUT);
                    payload.extend_from_slice(key);
                    payload.extend_from_slice(value);
                }
                WalLogicalRecord::Delete { key } => {
                    payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                    payload.extend_from_slice(&0u32.to_le_bytes());
                    payload.push(LOGICAL_DELETE);
                    payload.extend_from_slice(key);
                }
            }
        }
        payload
    }

    fn frame(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut header = [0u8; HEADER_LEN];
        header[0] = RECORD_TYPE_BATCH;
        header[1] = 0;
        header[2..4].copy_from_slice(&0u16.to_le_bytes());
        header[4..12].copy_from_slice(&self.start_seq.to_le_bytes());
        header[12..16].copy_from_slice(&(self.records.len() as u32).to_le_bytes());

        let body_len = (HEADER_LEN + payload.len()) as u32;
        let mut crc_input = Vec::with_capacity(4 + body_len as usize);
        crc_input.extend_from_slice(&body_len.to_le_bytes());
        crc_input.extend_from_slice(&header);
        crc_input.extend_from_slice(&payload);
        let crc = crc32fast::hash(&crc_input);

        let mut frame = Vec::with_capacity(4 + crc_input.len());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&crc_input);
        frame
    }

    fn decode_payload(count: u32, mut buf: &[u8]) -> Option<Vec<WalLogicalRecord>> {
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.len() < 9 {
                return None;
            }
            let key_len = u32::from_le_bytes(buf[0..4].try_into().ok()?) as usize;
            let value_len = u32::from_le_bytes(buf[4..8].try_into().ok()?) as usize;
            let logical_type = buf[8];
            buf = &buf[9..];
            if buf.len() < key_len {
                return None;
            }
            let key = buf[..key_len].to_vec();
            buf = &buf[key_len..];
            let record = match logical_type {
                LOGICAL_PUT => {
                    if buf.len() < value_len {
                        return None;
                    }
                    let value = buf[..value_len].to_vec();
                    buf = &buf[value_len..];
                    WalLogicalRecord::Put { key, value }
                }
                LOGICAL_DELETE => WalLogicalRecord::Delete { key },
                _ => return None,
            };
            records.push(record);
        }
        Some(records)
    }
}

fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{number:06}{SEGMENT_SUFFIX}"))
}

fn parse_segment_number(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// Returns segment numbers present in `dir`, ascending.
fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut numbers = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some(n) = parse_segment_number(name) {
                numbers.push(n);
            }
        }
    }
    numbers.sort_unstable();
    Ok(numbers)
}

struct ActiveSegment {
    file: File,
    number: u64,
    size: u64,
}

/// A segmented, append-only write-ahead log.
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    inner: Mutex<ActiveSegment>,
}

impl Wal {
    /// Opens (creating if absent) the WAL directory, positioning the active
    /// segment at the highest existing segment number, or segment 0 if the
    /// directory is empty.
    pub fn open(dir: impl Into<PathBuf>, segment_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let segments = list_segments(&dir)?;
        let number = segments.last().copied().unwrap_or(0);
        let path = segment_path(&dir, number);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let size = file.metadata()?.len();
        debug!(segment = number, size, "wal opened");
        Ok(Wal {
            dir,
            segment_size,
            inner: Mutex::new(ActiveSegment { file, number, size }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends one batch to the active segment, rotating first if the frame
    /// would overflow `segment_size`.
    pub fn append(&self, batch: &WalBatch) -> Result<()> {
        let frame = batch.frame();
        if frame.len() as u64 > self.segment_size {
            return Err(WalError::RecordTooLarge(frame.len()));
        }
        let mut guard = self.inner.lock().expect("wal mutex poisoned");
        if guard.size + frame.len() as u64 > self.segment_size && guard.size > 0 {
            self.rotate(&mut guard)?;
        }
        guard.file.write_all(&frame)?;
        guard.size += frame.len() as u64;
        trace!(
            segment = guard.number,
            start_seq = batch.start_seq,
            records = batch.records.len(),
            "wal append"
        );
        Ok(())
    }

    fn rotate(&self, guard: &mut ActiveSegment) -> Result<()> {
        guard.file.sync_all()?;
        let next = guard.number + 1;
        let path = segment_path(&self.dir, next);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        debug!(from = guard.number, to = next, "wal segment rotated");
        guard.file = file;
        guard.number = next;
        guard.size = 0;
        Ok(())
    }

    /// Fsyncs the active segment.
    pub fn sync(&self) -> Result<()> {
        let guard = self.inner.lock().expect("wal mutex poisoned");
        guard.file.sync_all()?;
        Ok(())
    }

    /// Deletes whole segments that are entirely covered by `cutoff_seq`
    /// (`last_seq() <= cutoff_seq`), stopping at the first segment that is
    /// not fully dominated or that is the active segment. Directory fsync
    /// follows deletion. Idempotent.
    pub fn truncate(&self, cutoff_seq: u64) -> Result<()> {
        let guard = self.inner.lock().expect("wal mutex poisoned");
        let active_number = guard.number;
        drop(guard);

        let segments = list_segments(&self.dir)?;
        let mut removed = 0u64;
        for number in segments {
            if number == active_number {
                break;
            }
            let path = segment_path(&self.dir, number);
            match read_segment_max_seq(&path)? {
                Some(max_seq) if max_seq <= cutoff_seq => {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
                _ => break,
            }
        }
        if removed > 0 {
            if let Ok(dir_file) = File::open(&self.dir) {
                let _ = dir_file.sync_all();
            }
            debug!(removed, cutoff_seq, "wal segments truncated");
        }
        Ok(())
    }

    /// Replays every segment in the directory in ascending order, stopping
    /// at the first corrupt frame of the segment it occurs in. Returns the
    /// recovered batches in the order they were written.
    pub fn recover(dir: &Path) -> Result<Vec<WalBatch>> {
        let segments = list_segments(dir)?;
        let mut batches = Vec::new();
        for number in segments {
            let path = segment_path(dir, number);
            let bytes = fs::read(&path)?;
            let (segment_batches, stopped_early) = decode_segment(number, &bytes);
            batches.extend(segment_batches);
            if stopped_early {
                warn!(segment = number, "wal recovery stopped at corrupt tail");
                break;
            }
        }
        Ok(batches)
    }
}

/// Reads the maximum sequence number covered by a fully decodable segment.
/// Returns `None` if the file cannot be fully decoded (tail corruption),
/// which callers treat as "not dominated" for truncation purposes.
fn read_segment_max_seq(path: &Path) -> Result<Option<u64>> {
    let bytes = fs::read(path)?;
    let (batches, stopped_early) = decode_segment(0, &bytes);
    if stopped_early || batches.is_empty() {
        return Ok(None);
    }
    Ok(batches.last().map(WalBatch::last_seq))
}

/// Decodes all whole frames from `bytes`. Returns the decoded batches and
/// whether decoding stopped early due to a malformed or truncated frame.
fn decode_segment(segment: u64, mut bytes: &[u8]) -> (Vec<WalBatch>, bool) {
    let mut batches = Vec::new();
    loop {
        if bytes.len() < 8 {
            return (batches, !bytes.is_empty());
        }
        let crc_expected = match bytes[0..4].try_into() {
            Ok(b) => u32::from_le_bytes(b),
            Err(_) => return (batches, true),
        };
        let body_len = match bytes[4..8].try_into() {
            Ok(b) => u32::from_le_bytes(b) as usize,
            Err(_) => return (batches, true),
        };
        if bytes.len() < 8 + body_len || body_len < HEADER_LEN {
            return (batches, true);
        }
        let body = &bytes[4..8 + body_len];
        let crc_actual = crc32fast::hash(body);
        if crc_actual != crc_expected {
            trace!(segment, crc_expected, crc_actual, "wal checksum mismatch");
            return (batches, true);
        }
        let header = &bytes[8..8 + HEADER_LEN];
        if header[0] != RECORD_TYPE_BATCH {
            return (batches, true);
        }
        let start_seq = u64::from_le_bytes(match header[4..12].try_into() {
            Ok(b) => b,
            Err(_) => return (batches, true),
        });
        let record_count = u32::from_le_bytes(match header[12..16].try_into() {
            Ok(b) => b,
            Err(_) => return (batches, true),
        });
        let payload = &bytes[8 + HEADER_LEN..8 + body_len];
        let records = match WalBatch::decode_payload(record_count, payload) {
            Some(records) => records,
            None => return (batches, true),
        };
        batches.push(WalBatch { start_seq, records });
        bytes = &bytes[8 + body_len..];
    }
}
