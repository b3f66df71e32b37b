//! Ordered, reversible lists of change records.

use crate::change::{ChangeKey, ChangeNotification, ChangeRecord, ObjectLifecycle};
use crate::error::CoreResult;
use crate::repository::ObjectRepository;
use crate::schema::Schema;
use crate::types::{ClassId, Direction, FieldId, SequenceNumber};
use lcmdb_codec::{ObjectId, Snapshot};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Net created, modified and deleted objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Created objects.
    pub created: BTreeSet<ObjectId>,
    /// Modified objects.
    pub modified: BTreeSet<ObjectId>,
    /// Deleted objects.
    pub deleted: BTreeSet<ObjectId>,
}

impl ChangeSet {
    /// Drops objects both created and deleted, and removes created or
    /// deleted objects from the modified set.
    pub fn normalize(&mut self) {
        let transient: Vec<ObjectId> = self.created.intersection(&self.deleted).copied().collect();
        for id in transient {
            self.created.remove(&id);
            self.deleted.remove(&id);
            self.modified.remove(&id);
        }
        self.modified
            .retain(|id| !self.created.contains(id) && !self.deleted.contains(id));
    }

    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// One task's worth of change records.
///
/// Records stay in the order they were added. The sequence number orders
/// whole units across every undo stack and says nothing about the records
/// inside.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    sequence: SequenceNumber,
    undoable: bool,
    undo_text: String,
    redo_text: String,
    changes: Vec<ChangeRecord>,
    index: HashMap<ChangeKey, usize>,
    created: BTreeSet<ObjectId>,
    deleted: BTreeSet<ObjectId>,
}

impl UnitOfWork {
    /// Creates an empty unit.
    pub fn new(
        sequence: SequenceNumber,
        undoable: bool,
        undo_text: impl Into<String>,
        redo_text: impl Into<String>,
    ) -> Self {
        Self {
            sequence,
            undoable,
            undo_text: undo_text.into(),
            redo_text: redo_text.into(),
            changes: Vec::new(),
            index: HashMap::new(),
            created: BTreeSet::new(),
            deleted: BTreeSet::new(),
        }
    }

    /// Returns the global sequence number.
    #[must_use]
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.sequence = sequence;
    }

    /// Returns true if the unit can be undone.
    #[must_use]
    pub fn is_undoable(&self) -> bool {
        self.undoable
    }

    /// Label for the undo command.
    #[must_use]
    pub fn undo_text(&self) -> &str {
        &self.undo_text
    }

    /// Label for the redo command.
    #[must_use]
    pub fn redo_text(&self) -> &str {
        &self.redo_text
    }

    /// Returns the records in order.
    #[must_use]
    pub fn changes(&self) -> &[ChangeRecord] {
        &self.changes
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if no record was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Objects created by this unit.
    #[must_use]
    pub fn created_ids(&self) -> &BTreeSet<ObjectId> {
        &self.created
    }

    /// Objects deleted by this unit.
    #[must_use]
    pub fn deleted_ids(&self) -> &BTreeSet<ObjectId> {
        &self.deleted
    }

    /// Adds a record.
    ///
    /// A field record for a slot already written by this unit folds into the
    /// earlier record. Field records for objects this unit created are
    /// dropped: the creation record restores the whole object.
    pub fn add_action(&mut self, record: ChangeRecord) {
        match &record {
            ChangeRecord::Created(c) => {
                self.created.insert(c.object);
                self.changes.push(record);
                return;
            }
            ChangeRecord::Deleted(c) => {
                self.deleted.insert(c.object);
                self.changes.push(record);
                return;
            }
            _ => {}
        }
        if self.created.contains(&record.object()) {
            return;
        }
        let Some(key) = record.key() else {
            self.changes.push(record);
            return;
        };
        match self.index.get(&key) {
            Some(&at) => {
                self.changes[at].coalesce(&record);
            }
            None => {
                self.index.insert(key, self.changes.len());
                self.changes.push(record);
            }
        }
    }

    /// Records the creation of an object already registered in the repository.
    pub fn register_created(&mut self, object: ObjectId, class: ClassId) {
        self.add_action(ChangeRecord::Created(ObjectLifecycle {
            object,
            class,
            snapshot: None,
        }));
    }

    /// Records the deletion of an object, keeping its last state.
    pub fn register_deleted(&mut self, object: ObjectId, class: ClassId, snapshot: Snapshot) {
        self.add_action(ChangeRecord::Deleted(ObjectLifecycle {
            object,
            class,
            snapshot: Some(snapshot),
        }));
    }

    /// Returns true if this unit created the object.
    #[must_use]
    pub fn is_new(&self, object: ObjectId) -> bool {
        self.created.contains(&object)
    }

    /// Returns true if this unit changed a stored field of the object.
    #[must_use]
    pub fn is_modified(&self, object: ObjectId) -> bool {
        self.changes.iter().any(|r| {
            r.is_data_change() && !r.is_lifecycle() && !r.is_no_op() && r.object() == object
        })
    }

    /// Returns true if applying the unit changes stored data.
    #[must_use]
    pub fn is_data_change(&self) -> bool {
        self.changes
            .iter()
            .any(|r| r.is_data_change() && !r.is_no_op())
    }

    /// Objects the unit created or changed a stored field of.
    #[must_use]
    pub fn touched_objects(&self) -> BTreeSet<ObjectId> {
        let mut touched: BTreeSet<ObjectId> = self
            .changes
            .iter()
            .filter(|r| r.is_data_change() && !r.is_lifecycle() && !r.is_no_op())
            .map(ChangeRecord::object)
            .collect();
        touched.extend(self.created.iter().copied());
        touched.retain(|id| !self.deleted.contains(id));
        touched
    }

    /// Reverts the unit.
    ///
    /// Deleted objects get their identity back before any record runs, then
    /// records are reverted last to first.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository refuses a value. The unit may be
    /// partly applied when that happens.
    pub fn undo(&mut self, repo: &mut dyn ObjectRepository) -> CoreResult<()> {
        for record in &self.changes {
            record.first_pass(repo, Direction::Backward)?;
        }
        for record in self.changes.iter_mut().rev() {
            record.apply(repo, Direction::Backward)?;
        }
        Ok(())
    }

    /// Re-applies the unit.
    ///
    /// Created objects get their identity back before any record runs, then
    /// records are applied first to last.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository refuses a value.
    pub fn redo(&mut self, repo: &mut dyn ObjectRepository) -> CoreResult<()> {
        for record in &self.changes {
            record.first_pass(repo, Direction::Forward)?;
        }
        for record in &mut self.changes {
            record.apply(repo, Direction::Forward)?;
        }
        Ok(())
    }

    /// Adds the unit's net effect to `set`.
    pub fn gather_changes(&self, set: &mut ChangeSet) {
        set.created.extend(self.created.iter().copied());
        set.deleted.extend(self.deleted.iter().copied());
        set.modified.extend(
            self.changes
                .iter()
                .filter(|r| r.is_data_change() && !r.is_lifecycle() && !r.is_no_op())
                .map(ChangeRecord::object),
        );
    }

    /// Adds the net effect of reverting the unit to `set`.
    pub fn gather_inverse_changes(&self, set: &mut ChangeSet) {
        let mut forward = ChangeSet::default();
        self.gather_changes(&mut forward);
        set.created.extend(forward.deleted);
        set.deleted.extend(forward.created);
        set.modified.extend(forward.modified);
    }

    /// Notifications for the unit just applied in `direction`, in the order
    /// the records ran.
    #[must_use]
    pub fn notifications(
        &self,
        direction: Direction,
        repo: &dyn ObjectRepository,
    ) -> Vec<ChangeNotification> {
        let records: Box<dyn Iterator<Item = &ChangeRecord> + '_> = match direction {
            Direction::Forward => Box::new(self.changes.iter()),
            Direction::Backward => Box::new(self.changes.iter().rev()),
        };
        records
            .filter_map(|r| r.notification(direction, repo))
            .collect()
    }

    /// Appends every record of a later unit, coalescing as it goes.
    pub fn merge(&mut self, later: Self) {
        for record in later.changes {
            self.add_action(record);
        }
    }

    fn data_keys(&self, schema: &Schema) -> HashSet<ChangeKey> {
        self.changes
            .iter()
            .filter(|r| r.is_data_change() && !r.is_no_op())
            .filter_map(ChangeRecord::key)
            .filter(|k| !schema.is_date_modified(k.field))
            .collect()
    }

    fn mentioned_objects(&self) -> HashSet<ObjectId> {
        self.changes
            .iter()
            .filter(|r| r.is_data_change() && !r.is_no_op())
            .flat_map(ChangeRecord::mentioned_objects)
            .collect()
    }

    /// Returns true if reverting or re-applying one of the two units changes
    /// what the other one did.
    ///
    /// Units interfere when they write the same slot, or when one mentions an
    /// object the other creates or deletes. `DateModified` slots and derived
    /// fields never count.
    #[must_use]
    pub fn interferes_with(&self, other: &Self, schema: &Schema) -> bool {
        let ours = self.data_keys(schema);
        if other.data_keys(schema).iter().any(|k| ours.contains(k)) {
            return true;
        }
        let lifecycle = |unit: &Self| -> HashSet<ObjectId> {
            unit.created.union(&unit.deleted).copied().collect()
        };
        let our_lifecycle = lifecycle(self);
        let their_lifecycle = lifecycle(other);
        other
            .mentioned_objects()
            .iter()
            .any(|id| our_lifecycle.contains(id))
            || self
                .mentioned_objects()
                .iter()
                .any(|id| their_lifecycle.contains(id))
    }

    /// Returns true if applying the unit in `direction` would leave a link to
    /// an object that is not resident.
    #[must_use]
    pub fn would_dangle(&self, repo: &dyn ObjectRepository, direction: Direction) -> bool {
        let (removed, restored) = match direction {
            Direction::Forward => (&self.deleted, &self.created),
            Direction::Backward => (&self.created, &self.deleted),
        };
        let available =
            |id: &ObjectId| restored.contains(id) || (repo.has_object(*id) && !removed.contains(id));

        let mut written: HashMap<(ObjectId, FieldId), Vec<ObjectId>> = HashMap::new();
        for record in &self.changes {
            if let Some(field) = record.field() {
                let links = record.linked_objects(direction);
                if links.iter().any(|id| !available(id)) {
                    return true;
                }
                written.insert((record.object(), field), links);
            }
            if let ChangeRecord::Created(c) | ChangeRecord::Deleted(c) = record {
                if restored.contains(&c.object) {
                    if let Some(snapshot) = &c.snapshot {
                        if snapshot.links().any(|l| !available(&l.guid)) {
                            return true;
                        }
                    }
                }
            }
        }

        removed.iter().any(|id| {
            repo.referrers(*id).into_iter().any(|(referrer, field)| {
                if removed.contains(&referrer) {
                    return false;
                }
                match written.get(&(referrer, field)) {
                    Some(links) => links.contains(id),
                    None => true,
                }
            })
        })
    }

    /// Mutable access to the records, for rewriting after a foreign merge.
    pub(crate) fn changes_mut(&mut self) -> &mut [ChangeRecord] {
        &mut self.changes
    }

    /// Drops every record matching `remove`.
    pub(crate) fn remove_records(&mut self, mut remove: impl FnMut(&ChangeRecord) -> bool) {
        self.changes.retain(|r| !remove(r));
        self.index = self
            .changes
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_lifecycle())
            .filter_map(|(i, r)| r.key().map(|k| (k, i)))
            .collect();
    }
}
