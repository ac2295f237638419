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

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A named entry does not exist in the directory.
    #[error("no such entry: {name}")]
    NotFound {
        /// Name of the missing entry.
        name: String,
    },

    /// Another process holds the directory lock.
    #[error("directory locked: {path}")]
    Locked {
        /// Path of the locked directory.
        path: String,
    },

    /// The directory does not exist and may not be created.
    #[error("directory does not exist: {path}")]
    Missing {
        /// Path that was expected to exist.
        path: String,
    },

    /// Entry names must be plain file names.
    #[error("invalid entry name: {name}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },
}

impl StorageError {
    /// Creates a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }
}
