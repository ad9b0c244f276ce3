//! Error types for the Amphora storage engine.
//!
//! Domain errors (`NotFound`, `AlreadyRemoved`, `Full`, `BigObject`,
//! `ReadOnly`) are returned verbatim to callers; wrapping layers must keep
//! the kind intact so callers can match on it.

use crate::types::AddressParseError;
use thiserror::Error;

/// Common result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for storage operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Object is missing from the queried store.
    #[error("object not found")]
    NotFound,

    /// Object existed but has been tombstoned.
    #[error("object already removed")]
    AlreadyRemoved,

    /// A size-bounded container cannot accept the object.
    #[error("container is full")]
    Full,

    /// Object exceeds the write-cache object size limit.
    #[error("object is too big")]
    BigObject,

    /// Store is in read-only mode; mutations are rejected.
    #[error("storage is in read-only mode")]
    ReadOnly,

    /// On-disk data failed validation (bad magic, CRC or truncation).
    #[error("data corruption: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] AddressParseError),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a corruption error.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Check if this error reports a removed object.
    #[must_use]
    pub fn is_already_removed(&self) -> bool {
        matches!(self, Self::AlreadyRemoved)
    }

    /// Check if this error counts toward a shard's error budget.
    ///
    /// Domain errors are expected outcomes; only I/O, database and
    /// corruption failures indicate storage degradation.
    #[must_use]
    pub fn is_storage_fault(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Database(_) | Self::Corrupted(_)
        )
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Self::Database(e.to_string())
    }
}
