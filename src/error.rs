//! Top-level error type returned across the public [`crate::engine::Engine`] API.
//!
//! Each subsystem (`wal`, `memtable`, `sstable`, `manifest`, `cache`,
//! `version`, `internal_key`) defines its own [`thiserror`]-derived error
//! enum scoped to the failures it can actually produce. [`EngineError`]
//! wraps each of those via `#[from]` and adds the engine-level variants
//! that have no subsystem origin.

use std::path::PathBuf;

use thiserror::Error;

use crate::internal_key::InternalKeyError;
use crate::manifest::ManifestError;
use crate::memtable::MemtableError;
use crate::sstable::SSTableError;
use crate::version::VersionError;
use crate::wal::WalError;

/// Errors returned by any public engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested key has no visible value (a tombstone or absence).
    #[error("key not found")]
    NotFound,

    /// A malformed argument was supplied (oversized sequence, empty range, …).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine is closed, or an operation was attempted before `open`.
    #[error("engine state error: {0}")]
    StateError(String),

    /// A background flush or compaction hit a fault; it is now sticky and
    /// every subsequent operation fails with the captured cause.
    #[error("background worker failed: {0}")]
    BackgroundError(String),

    /// A referenced file on disk was missing.
    #[error("missing file: {0}")]
    MissingFile(PathBuf),

    #[error(transparent)]
    InternalKey(#[from] InternalKeyError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Memtable(#[from] MemtableError),

    #[error(transparent)]
    SSTable(#[from] SSTableError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
