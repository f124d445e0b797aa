//! Error types for every layer of the index.
//!
//! Each layer owns one error enum:
//! - [`StorageError`] for the paged node store
//! - [`MapperError`] for element mapper backends
//! - [`IndexError`] for tree operations, wrapping both of the above
//! - [`ManagerError`] for the tree registry

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the paged node store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt page store: {0}")]
    Corrupt(String),

    #[error("Incompatible store format: {0}")]
    IncompatibleFormat(String),

    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Encoded node of {size} bytes does not fit in a page of {page_size} bytes")]
    PageOverflow { size: usize, page_size: usize },

    #[error("Page store is closed")]
    Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by element mapper backends.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("Mapper IO error: {0}")]
    Io(String),

    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Element not found: {0}")]
    NotFound(String),

    #[error("Corrupt element record: {0}")]
    Corrupt(String),

    #[error("Element mapper is closed")]
    Closed,
}

impl MapperError {
    /// Whether retrying the same call may succeed.
    ///
    /// Lock contention on the SQL side and I/O hiccups on the embedded
    /// store are transient; everything else is a permanent failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            MapperError::Io(_) => true,
            MapperError::Sql(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
            ),
            MapperError::NotFound(_) | MapperError::Corrupt(_) | MapperError::Closed => false,
        }
    }
}

impl From<fjall::Error> for MapperError {
    fn from(err: fjall::Error) -> Self {
        MapperError::Io(err.to_string())
    }
}

impl From<io::Error> for MapperError {
    fn from(err: io::Error) -> Self {
        MapperError::Io(err.to_string())
    }
}

pub type MapperResult<T> = Result<T, MapperError>;

/// Errors raised by tree operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Identifier already indexed: {0}")]
    DuplicateIdentifier(String),

    #[error(transparent)]
    Storage(StorageError),

    #[error("Corrupt tree: {0}")]
    CorruptTree(String),

    #[error(transparent)]
    Mapper(#[from] MapperError),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Dimension mismatch: tree has {expected} dimensions, envelope has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Reference system mismatch: tree uses {expected}, envelope uses {actual}")]
    ReferenceSystemMismatch { expected: String, actual: String },

    #[error("Split strategy {strategy} produced an invalid partition: {reason}")]
    InvalidSplit { strategy: String, reason: String },

    #[error("Tree is closed")]
    Closed,
}

impl IndexError {
    /// Fatal errors mean the on-disk tree can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::CorruptTree(_))
    }
}

impl From<StorageError> for IndexError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Corrupt(msg) => IndexError::CorruptTree(msg),
            StorageError::Closed => IndexError::Closed,
            other => IndexError::Storage(other),
        }
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// The underlying reason a registry could not open or remove a tree.
#[derive(Debug, Error)]
pub enum OpenFailure {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Mapper(#[from] MapperError),

    #[error(transparent)]
    Index(IndexError),
}

impl From<IndexError> for OpenFailure {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::Storage(e) => OpenFailure::Storage(e),
            IndexError::Mapper(e) => OpenFailure::Mapper(e),
            IndexError::CorruptTree(msg) => OpenFailure::Storage(StorageError::Corrupt(msg)),
            other => OpenFailure::Index(other),
        }
    }
}

/// Errors raised by the tree registry.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Failed to open tree at {location:?}: {source}")]
    Open {
        location: PathBuf,
        #[source]
        source: OpenFailure,
    },

    #[error("Tree at {location:?} is already open with an incompatible configuration: {reason}")]
    AlreadyOpenElsewhereIncompatibly { location: PathBuf, reason: String },

    #[error("Failed to remove tree at {location:?}: {source}")]
    Remove {
        location: PathBuf,
        #[source]
        source: OpenFailure,
    },

    #[error(transparent)]
    Index(#[from] IndexError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;
