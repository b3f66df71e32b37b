//! Backing store trait definition.

use crate::error::StorageResult;
use lcmdb_codec::{ObjectId, Snapshot};

/// The net changes a client hands to the store on save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    /// Objects created since the last save.
    pub created: Vec<Snapshot>,
    /// Objects modified since the last save.
    pub modified: Vec<Snapshot>,
    /// Objects deleted since the last save.
    pub deleted: Vec<ObjectId>,
}

impl CommitBatch {
    /// Returns true if the batch carries no change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Returns the number of objects touched by the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.created.len() + self.modified.len() + self.deleted.len()
    }
}

/// Opaque position in a store's commit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitCursor(pub u64);

/// Opaque token naming a version of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionStamp(pub u64);

/// Changes other clients committed since this client last looked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignChanges {
    /// Objects created by other clients, with their current state.
    pub created: Vec<Snapshot>,
    /// Objects modified by other clients, with their current state.
    pub modified: Vec<Snapshot>,
    /// Objects deleted by other clients.
    pub deleted: Vec<ObjectId>,
    /// Cursor to acknowledge once the changes have been absorbed.
    pub cursor: CommitCursor,
}

impl ForeignChanges {
    /// Returns true if no other client changed anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// A persistent store shared by one or more clients.
///
/// Stores persist whole-object snapshots. They do not understand undo
/// stacks or units of work; the core hands them net changes only.
///
/// # Invariants
///
/// - `commit` is safe to retry after a transient failure: creating or
///   modifying an object twice, or deleting an absent object, is not an error
/// - `unseen_foreign_changes` never reports this client's own commits
/// - the foreign-change cursor only moves on `mark_seen`
pub trait BackingStore: Send + Sync {
    /// Persists a batch of changes.
    ///
    /// Returns `Ok(false)` if the store refused the batch without failing,
    /// for example because it is read-only.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ConnectionLost`] on transient failures.
    fn commit(&self, batch: &CommitBatch) -> StorageResult<bool>;

    /// Returns what other clients committed since the last acknowledged cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or a snapshot is corrupt.
    fn unseen_foreign_changes(&self) -> StorageResult<ForeignChanges>;

    /// Acknowledges foreign changes up to `cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn mark_seen(&self, cursor: CommitCursor) -> StorageResult<()>;

    /// Returns a token naming the current version of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn version_stamp(&self) -> StorageResult<VersionStamp>;

    /// Returns true if objects of `class_name` may have been created since `stamp`.
    ///
    /// Implementations answer `true` when in doubt.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    fn new_objects_since_version(
        &self,
        stamp: VersionStamp,
        class_name: &str,
    ) -> StorageResult<bool>;

    /// Loads every persisted object together with the cursor they reflect.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or a snapshot is corrupt.
    fn load_all(&self) -> StorageResult<(Vec<Snapshot>, CommitCursor)>;
}

impl<S: BackingStore + ?Sized> BackingStore for std::sync::Arc<S> {
    fn commit(&self, batch: &CommitBatch) -> StorageResult<bool> {
        (**self).commit(batch)
    }

    fn unseen_foreign_changes(&self) -> StorageResult<ForeignChanges> {
        (**self).unseen_foreign_changes()
    }

    fn mark_seen(&self, cursor: CommitCursor) -> StorageResult<()> {
        (**self).mark_seen(cursor)
    }

    fn version_stamp(&self) -> StorageResult<VersionStamp> {
        (**self).version_stamp()
    }

    fn new_objects_since_version(
        &self,
        stamp: VersionStamp,
        class_name: &str,
    ) -> StorageResult<bool> {
        (**self).new_objects_since_version(stamp, class_name)
    }

    fn load_all(&self) -> StorageResult<(Vec<Snapshot>, CommitCursor)> {
        (**self).load_all()
    }
}
