//! Error types for LCMDB core.

use crate::types::{FieldId, MarkHandle, StackId};
use lcmdb_codec::{CodecError, ObjectId};
use lcmdb_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in LCMDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Backing store error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Snapshot codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Operation not permitted in the current state.
    ///
    /// This is the programmer-misuse error: any open unit of work has already
    /// been rolled back when it is returned.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The schema definition is inconsistent.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// No class with this name exists.
    #[error("unknown class: {name}")]
    UnknownClass {
        /// The class name.
        name: String,
    },

    /// No field with this id exists.
    #[error("unknown field: {field}")]
    UnknownField {
        /// The field id.
        field: FieldId,
    },

    /// The class has no field with this name.
    #[error("class {class} has no field named {name}")]
    UnknownFieldName {
        /// The class name.
        class: String,
        /// The field name.
        name: String,
    },

    /// A value does not fit the kind of the field it is stored in.
    #[error("value does not match field {field}: {message}")]
    FieldKindMismatch {
        /// The field.
        field: FieldId,
        /// Description of the mismatch.
        message: String,
    },

    /// Object is not resident in the repository.
    #[error("object not found: {id}")]
    ObjectNotFound {
        /// The object ID that was not found.
        id: ObjectId,
    },

    /// Object is already resident in the repository.
    #[error("object already exists: {id}")]
    ObjectExists {
        /// The object ID.
        id: ObjectId,
    },

    /// A field would point at an object that is not resident.
    #[error("dangling reference from {from} ({field}) to {to}")]
    DanglingReference {
        /// The referring object.
        from: ObjectId,
        /// The referring field.
        field: FieldId,
        /// The missing target.
        to: ObjectId,
    },

    /// No undo stack with this id exists.
    #[error("undo stack not found: {stack}")]
    StackNotFound {
        /// The stack id.
        stack: StackId,
    },

    /// Undo was refused because it would corrupt later work or dangle a reference.
    #[error("undo refused on {stack}")]
    UndoRefused {
        /// The stack.
        stack: StackId,
    },

    /// Redo was refused because it would corrupt other work or dangle a reference.
    #[error("redo refused on {stack}")]
    RedoRefused {
        /// The stack.
        stack: StackId,
    },

    /// The mark does not exist on this stack.
    #[error("mark not found: {mark}")]
    MarkNotFound {
        /// The mark handle.
        mark: MarkHandle,
    },

    /// Discarding to a mark would drop real data changes.
    #[error("discarding to {mark} would lose data changes")]
    DiscardWouldLoseData {
        /// The mark handle.
        mark: MarkHandle,
    },

    /// The backing store stayed unreachable.
    #[error("connection to backing store lost after {attempts} attempts: {message}")]
    ConnectionLost {
        /// How many attempts were made.
        attempts: u32,
        /// The last failure.
        message: String,
    },

    /// The backing store refused the commit.
    #[error("backing store refused the commit")]
    CommitRejected,

    /// The background commit worker is no longer running.
    #[error("commit worker stopped")]
    CommitWorkerStopped,

    /// Other clients kept committing while this one reconciled.
    #[error("gave up saving after {rounds} reconciliation rounds")]
    ReconcileLimit {
        /// Rounds attempted.
        rounds: u32,
    },
}

impl CoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates a field kind mismatch error.
    pub fn kind_mismatch(field: FieldId, message: impl Into<String>) -> Self {
        Self::FieldKindMismatch {
            field,
            message: message.into(),
        }
    }

    /// Returns true if this is a programmer-misuse error.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::InvalidOperation { .. })
    }
}
