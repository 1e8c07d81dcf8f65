//! Append-only edit log recording which sorted tables exist and where the
//! WAL may safely be truncated.
//!
//! Records share the framing shape used by [`crate::wal`]:
//! `crc32(length||payload) | length(u32) | payload`, where the first byte
//! of the payload is the record-type tag. Three record types, fixed
//! on-disk identity:
//!
//! - `AddSSTable = 0x01` — a table's full metadata.
//! - `RemoveSSTable = 0x02` — a file number to drop.
//! - `SetWALCutoff = 0x03` — a sequence number below which the WAL may be
//!   truncated.
//!
//! `replay` folds a file's records into a fresh [`VersionSet`], stopping at
//! the first malformed record (the manifest's interior must be clean; only
//! the absence of a trailing record is tolerated). `rewrite` compacts the
//! manifest by writing a new file from a snapshot of live records and
//! atomically renaming it over the original.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

use crate::version::{TableMetadata, VersionSet};

const RECORD_ADD_SSTABLE: u8 = 0x01;
const RECORD_REMOVE_SSTABLE: u8 = 0x02;
const RECORD_SET_WAL_CUTOFF: u8 = 0x03;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown manifest record type {0:#x}")]
    UnknownRecordType(u8),

    #[error("manifest record truncated")]
    Truncated,

    #[error("manifest checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error(transparent)]
    Version(#[from] crate::version::VersionError),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// One logical edit to the version set, as stored in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRecord {
    AddSSTable(TableMetadata),
    RemoveSSTable(u64),
    SetWalCutoff(u64),
}

impl ManifestRecord {
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            ManifestRecord::AddSSTable(meta) => {
                payload.push(RECORD_ADD_SSTABLE);
                payload.extend_from_slice(&meta.file_number.to_le_bytes());
                payload.push(meta.level as u8);
                payload.extend_from_slice(&meta.smallest_seq.to_le_bytes());
                payload.extend_from_slice(&meta.largest_seq.to_le_bytes());
                payload.extend_from_slice(&meta.file_size.to_le_bytes());
                write_len_prefixed(&mut payload, &meta.smallest_key);
                write_len_prefixed(&mut payload, &meta.largest_key);
            }
            ManifestRecord::RemoveSSTable(file_number) => {
                payload.push(RECORD_REMOVE_SSTABLE);
                payload.extend_from_slice(&file_number.to_le_bytes());
            }
            ManifestRecord::SetWalCutoff(seq) => {
                payload.push(RECORD_SET_WAL_CUTOFF);
                payload.extend_from_slice(&seq.to_le_bytes());
            }
        }
        payload
    }

    fn decode(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(ManifestError::Truncated);
        }
        let mut cursor = &payload[1..];
        match payload[0] {
            RECORD_ADD_SSTABLE => {
                let file_number = take_u64(&mut cursor)?;
                let level = take_u8(&mut cursor)? as usize;
                let smallest_seq = take_u64(&mut cursor)?;
                let largest_seq = take_u64(&mut cursor)?;
                let file_size = take_u64(&mut cursor)?;
                let smallest_key = take_len_prefixed(&mut cursor)?;
                let largest_key = take_len_prefixed(&mut cursor)?;
                Ok(ManifestRecord::AddSSTable(TableMetadata {
                    file_number,
                    level,
                    smallest_seq,
                    largest_seq,
                    smallest_key,
                    largest_key,
                    file_size,
                }))
            }
            RECORD_REMOVE_SSTABLE => Ok(ManifestRecord::RemoveSSTable(take_u64(&mut cursor)?)),
            RECORD_SET_WAL_CUTOFF => Ok(ManifestRecord::SetWalCutoff(take_u64(&mut cursor)?)),
            other => Err(ManifestError::UnknownRecordType(other)),
        }
    }
}

fn write_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn take_u8(cursor: &mut &[u8]) -> Result<u8> {
    if cursor.is_empty() {
        return Err(ManifestError::Truncated);
    }
    let v = cursor[0];
    *cursor = &cursor[1..];
    Ok(v)
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64> {
    if cursor.len() < 8 {
        return Err(ManifestError::Truncated);
    }
    let v = u64::from_le_bytes(cursor[..8].try_into().expect("8 bytes"));
    *cursor = &cursor[8..];
    Ok(v)
}

fn take_len_prefixed(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.len() < 4 {
        return Err(ManifestError::Truncated);
    }
    let len = u32::from_le_bytes(cursor[..4].try_into().expect("4 bytes")) as usize;
    *cursor = &cursor[4..];
    if cursor.len() < len {
        return Err(ManifestError::Truncated);
    }
    let bytes = cursor[..len].to_vec();
    *cursor = &cursor[len..];
    Ok(bytes)
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let crc = crc32fast::hash(&out);
    let mut framed = Vec::with_capacity(4 + out.len());
    framed.extend_from_slice(&crc.to_le_bytes());
    framed.extend_from_slice(&out);
    framed
}

/// Reads one framed record from `reader`. Returns `Ok(None)` at a clean
/// end of stream; an I/O error mid-record that leaves fewer bytes than
/// expected is also treated as end-of-stream (tail corruption is
/// tolerated), while a checksum mismatch on a fully-read record is a hard
/// error (interior corruption is not tolerated).
fn read_one_record(reader: &mut impl Read) -> Result<Option<ManifestRecord>> {
    let mut crc_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut crc_buf) {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e.into())
        };
    }
    let expected_crc = u32::from_le_bytes(crc_buf);

    let mut len_buf = [0u8; 4];
    if reader.read_exact(&mut len_buf).is_err() {
        return Ok(None);
    }
    let length = u32::from_le_bytes(len_buf) as usize;

    let mut payload = vec![0u8; length];
    if reader.read_exact(&mut payload).is_err() {
        return Ok(None);
    }

    let mut hashed = Vec::with_capacity(4 + length);
    hashed.extend_from_slice(&len_buf);
    hashed.extend_from_slice(&payload);
    let actual_crc = crc32fast::hash(&hashed);
    if actual_crc != expected_crc {
        return Err(ManifestError::ChecksumMismatch {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    Ok(Some(ManifestRecord::decode(&payload)?))
}

/// The append-only manifest journal, guarded by a single writer lock.
pub struct Manifest {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl Manifest {
    /// Opens (creating if absent) the manifest file at `path` for
    /// appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Manifest {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Serializes, writes, and fsyncs one record.
    pub fn append(&self, record: &ManifestRecord) -> Result<()> {
        let framed = frame(&record.encode());
        let mut writer = self.writer.lock().expect("manifest writer mutex poisoned");
        writer.write_all(&framed)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        debug!(record = ?record, "manifest record appended");
        Ok(())
    }

    /// Replays `path` from the start, folding every record into a fresh
    /// [`VersionSet`]. Stops at the first malformed record, after which a
    /// present-but-unreadable tail is treated as the end of the log.
    pub fn replay(path: impl AsRef<Path>) -> Result<VersionSet> {
        let versions = VersionSet::new();
        let path = path.as_ref();
        if !path.exists() {
            return Ok(versions);
        }
        let mut reader = BufReader::new(File::open(path)?);
        loop {
            match read_one_record(&mut reader) {
                Ok(Some(record)) => apply(&versions, record)?,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "manifest replay stopped at malformed record");
                    return Err(e);
                }
            }
        }
        Ok(versions)
    }

    /// Writes a fresh manifest containing exactly `records` to a sibling
    /// `.tmp` file, fsyncs, then atomically renames it over `path`.
    pub fn rewrite(path: impl AsRef<Path>, records: &[ManifestRecord]) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?,
            );
            for record in records {
                writer.write_all(&frame(&record.encode()))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        if let Some(parent) = path.parent()
            && let Ok(dir) = File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Manifest::open(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn apply(versions: &VersionSet, record: ManifestRecord) -> Result<()> {
    match record {
        ManifestRecord::AddSSTable(meta) => versions.add(meta).map_err(ManifestError::from),
        ManifestRecord::RemoveSSTable(file_number) => {
            versions.remove(file_number);
            Ok(())
        }
        ManifestRecord::SetWalCutoff(seq) => {
            versions.set_wal_cutoff(seq);
            Ok(())
        }
    }
}

/// Builds the minimal set of records that reconstructs `versions`'
/// current state, for use with [`Manifest::rewrite`].
pub fn snapshot_records(versions: &VersionSet) -> Vec<ManifestRecord> {
    let mut records: Vec<ManifestRecord> = versions
        .all()
        .into_iter()
        .map(ManifestRecord::AddSSTable)
        .collect();
    records.push(ManifestRecord::SetWalCutoff(versions.wal_cutoff_seq()));
    records
}
