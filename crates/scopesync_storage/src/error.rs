//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key is empty, absolute, or contains a forbidden segment.
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),

    /// Another process holds the directory lock.
    #[error("storage directory locked: {}", .0.display())]
    Locked(PathBuf),

    /// The storage contents are unreadable.
    #[error("storage corrupted: {0}")]
    Corrupted(String),
}
