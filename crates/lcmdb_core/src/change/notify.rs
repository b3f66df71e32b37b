//! Field change notifications.

use crate::types::FieldId;
use lcmdb_codec::ObjectId;

/// One net field delta, reported after a task, undo, redo or merge.
///
/// `index`, `inserted` and `deleted` describe the change the way a list
/// view would: for vectors they bracket the edited run; for multi-strings
/// `index` is the writing system; scalars report all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeNotification {
    /// Changed object.
    pub object: ObjectId,
    /// Changed field.
    pub field: FieldId,
    /// Start of the change.
    pub index: usize,
    /// Count of inserted items (or new string length).
    pub inserted: usize,
    /// Count of deleted items (or old string length).
    pub deleted: usize,
}

impl ChangeNotification {
    /// Creates a notification.
    #[must_use]
    pub const fn new(
        object: ObjectId,
        field: FieldId,
        index: usize,
        inserted: usize,
        deleted: usize,
    ) -> Self {
        Self {
            object,
            field,
            index,
            inserted,
            deleted,
        }
    }
}

/// Receives change notifications.
///
/// Observers are called synchronously once per notification, in order of
/// occurrence, and then once through [`ChangeObserver::all_changes_done`].
/// No write lock is held while they run.
pub trait ChangeObserver: Send + Sync {
    /// Called once per net field delta.
    fn prop_changed(&self, change: &ChangeNotification);

    /// Called after the last delta of a batch.
    fn all_changes_done(&self) {}
}

/// Returns `(index, inserted, deleted)` for a vector edit.
///
/// The common prefix and suffix are skipped; whatever lies between is
/// reported as replaced.
#[must_use]
pub fn vector_delta(old: &[ObjectId], new: &[ObjectId]) -> (usize, usize, usize) {
    let prefix = old.iter().zip(new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    (prefix, new.len() - prefix - suffix, old.len() - prefix - suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_delta_brackets_edit() {
        let ids: Vec<ObjectId> = (0..5).map(|_| ObjectId::new()).collect();
        let old = vec![ids[0], ids[1], ids[2]];

        let appended = vec![ids[0], ids[1], ids[2], ids[3]];
        assert_eq!(vector_delta(&old, &appended), (3, 1, 0));

        let removed_middle = vec![ids[0], ids[2]];
        assert_eq!(vector_delta(&old, &removed_middle), (1, 0, 1));

        let replaced = vec![ids[4]];
        assert_eq!(vector_delta(&old, &replaced), (0, 1, 3));

        assert_eq!(vector_delta(&old, &old), (3, 0, 0));
    }

    #[test]
    fn repeated_items_do_not_double_count() {
        let a = ObjectId::new();
        assert_eq!(vector_delta(&[a], &[a, a]), (1, 1, 0));
    }
}
