//! Error types for the storage engine.

use thiserror::Error;

use crate::types::PageId;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation detected while reading pages or log records
    #[error("corruption detected: {0}")]
    Corrupt(String),

    /// Insert of a key that already exists
    #[error("key {0} already exists")]
    Duplicate(i64),

    /// Operation on a key that does not exist
    #[error("key {0} not found")]
    NotFound(i64),

    /// Every buffer frame is pinned; the request cannot be served
    #[error("buffer pool exhausted: all {0} frames pinned")]
    BufferFull(usize),

    /// Granting the requested lock would close a cycle in the wait-for graph
    #[error("deadlock detected, transaction {0} must abort")]
    Deadlock(u32),

    /// Caller-supplied argument outside the accepted range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation on a transaction that is not active
    #[error("transaction {0} is not active")]
    TrxInactive(u32),

    /// Requested page lies outside the table file
    #[error("page {0} out of bounds")]
    PageOutOfBounds(PageId),
}

impl StorageError {
    /// Create a corruption error with a message
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Create an invalid-argument error with a message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
