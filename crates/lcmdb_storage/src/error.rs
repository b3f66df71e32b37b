//! Error types for storage operations.

use lcmdb_codec::{CodecError, ObjectId};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The connection to the store was lost. The call may be retried.
    #[error("connection to backing store lost: {message}")]
    ConnectionLost {
        /// Description of the failure.
        message: String,
    },

    /// A persisted snapshot could not be decoded.
    #[error("corrupt snapshot for object {object}: {source}")]
    CorruptSnapshot {
        /// The object whose snapshot is corrupt.
        object: ObjectId,
        /// The decode error, carrying the raw bytes.
        #[source]
        source: CodecError,
    },

    /// Snapshot encoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The store is closed.
    #[error("backing store is closed")]
    Closed,
}

impl StorageError {
    /// Creates a connection lost error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}
