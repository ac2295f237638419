//! Error types for Prevail core.

use crate::sync::LockMode;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Prevail core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] prevail_storage::StorageError),

    /// CBOR codec error.
    #[error("codec error: {0}")]
    Codec(#[from] prevail_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A command refused to run. The model was not modified and nothing was
    /// journaled.
    #[error("command {command} aborted: {reason}")]
    Aborted {
        /// Name of the aborted command.
        command: String,
        /// Reason given by the command.
        reason: String,
    },

    /// A command failed in its prepare step. Nothing was journaled.
    #[error("command {command} failed validation: {message}")]
    ValidationFailed {
        /// Name of the command.
        command: String,
        /// Description of the failure.
        message: String,
    },

    /// A command failed while mutating the model. Nothing was journaled.
    #[error("command {command} failed: {message}")]
    ExecutionFailed {
        /// Name of the command.
        command: String,
        /// Description of the failure.
        message: String,
    },

    /// A lock could not be acquired within the configured timeout.
    #[error("timed out after {timeout:?} waiting for {mode} lock")]
    LockTimeout {
        /// The requested lock mode.
        mode: LockMode,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// An optimistic command lost a race with another writer.
    #[error("write conflict: prepared against revision {expected}, model is at {actual}")]
    WriteConflict {
        /// Revision the command was executed against.
        expected: u64,
        /// Revision found when committing.
        actual: u64,
    },

    /// The model may no longer match the journal; the engine refuses
    /// further commands.
    #[error("model corrupted: {message}")]
    ModelCorrupted {
        /// What put the engine in this state.
        message: String,
    },

    /// A journaled command has no registered decoder.
    #[error("unknown command {name} version {version}")]
    UnknownCommand {
        /// Journaled type name.
        name: String,
        /// Journaled schema version.
        version: u32,
    },

    /// Replaying a journaled command failed.
    #[error("replay of entry {entry_id} ({command}) failed: {message}")]
    ReplayFailed {
        /// Id of the failing entry.
        entry_id: u64,
        /// Name of the command.
        command: String,
        /// Description of the failure.
        message: String,
    },

    /// A segment ends in an incomplete record. Readers treat this as the
    /// end of the segment; verification reports it.
    #[error("segment {segment} truncated at offset {offset}")]
    TruncatedSegment {
        /// File name of the segment.
        segment: String,
        /// Offset of the incomplete record.
        offset: u64,
    },

    /// Journal is corrupted or invalid.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Snapshot is corrupted or invalid.
    #[error("snapshot corruption: {message}")]
    SnapshotCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Invalid store format or version.
    #[error("invalid store format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The store has no snapshot to load from.
    #[error("store is empty: {location}")]
    StoreNotFound {
        /// Location of the store.
        location: String,
    },

    /// The store already holds data and cannot be created again.
    #[error("store already exists: {location}")]
    StoreExists {
        /// Location of the store.
        location: String,
    },

    /// Another engine holds the store's lock.
    #[error("store locked: {path}")]
    StoreLocked {
        /// Location of the locked store.
        path: String,
    },

    /// The engine is closed.
    #[error("engine is closed")]
    EngineClosed,
}

impl CoreError {
    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a snapshot corruption error.
    pub fn snapshot_corruption(message: impl Into<String>) -> Self {
        Self::SnapshotCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a model corrupted error.
    pub fn model_corrupted(message: impl Into<String>) -> Self {
        Self::ModelCorrupted {
            message: message.into(),
        }
    }

    /// Returns true if the error came from a command's own decision to
    /// abort, as opposed to a failure.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Returns true if retrying the same command may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::WriteConflict { .. })
    }

    /// Returns true if another engine holds the store's lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            Self::StoreLocked { .. } | Self::Storage(prevail_storage::StorageError::Locked { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_message_names_mode() {
        let err = CoreError::LockTimeout {
            mode: LockMode::Write,
            timeout: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "timed out after 50ms waiting for write lock");
        assert!(err.is_retryable());
    }

    #[test]
    fn abort_is_not_retryable() {
        let err = CoreError::Aborted {
            command: "Withdraw".into(),
            reason: "insufficient funds".into(),
        };
        assert!(err.is_abort());
        assert!(!err.is_retryable());
    }

    #[test]
    fn locked_storage_detected() {
        let err: CoreError = prevail_storage::StorageError::Locked {
            path: "/tmp/x".into(),
        }
        .into();
        assert!(err.is_locked());
    }
}
