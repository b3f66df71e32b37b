//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding snapshots.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a snapshot to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// The persisted bytes are not a valid snapshot.
    ///
    /// The raw bytes are kept so the caller can report them for diagnosis.
    #[error("corrupt snapshot ({} bytes): {message}", .raw.len())]
    CorruptSnapshot {
        /// The bytes that failed to decode.
        raw: Vec<u8>,
        /// Description of the decoding error.
        message: String,
    },

    /// The snapshot decoded but its content is inconsistent.
    #[error("invalid snapshot structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a corrupt snapshot error, keeping the raw bytes.
    pub fn corrupt_snapshot(raw: &[u8], message: impl Into<String>) -> Self {
        Self::CorruptSnapshot {
            raw: raw.to_vec(),
            message: message.into(),
        }
    }

    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Returns the raw bytes of a corrupt snapshot, if this is one.
    #[must_use]
    pub fn raw_snapshot(&self) -> Option<&[u8]> {
        match self {
            Self::CorruptSnapshot { raw, .. } => Some(raw),
            _ => None,
        }
    }
}
