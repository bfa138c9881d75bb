//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The snapshot file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the store lock.
    #[error("store at {0} is locked by another process")]
    Locked(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,

    /// Encryption or decryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),
}
