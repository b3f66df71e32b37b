//! Folding other clients' commits into local unsaved state.
//!
//! A save first asks the store what other clients committed since this
//! client last looked. [`ChangeReconciler::check`] decides whether those
//! changes can coexist with local unsaved work; if they can,
//! [`ChangeReconciler::reconcile`] builds a non-undoable unit that applies
//! them and rewrites local units so their undo and redo stay meaningful on
//! top of the foreign state.

mod merge;

pub use merge::{dedupe, merge_timestamp, rebase, three_way, CollectionMerge, TimestampMerge};

use crate::change::{ChangeKey, ChangeNotification, ChangeRecord, ObjectLifecycle};
use crate::error::{CoreError, CoreResult};
use crate::repository::ObjectRepository;
use crate::schema::{FieldDef, FieldKind, Schema};
use crate::types::{Direction, FieldId, SequenceNumber, Timestamp};
use crate::unit_of_work::UnitOfWork;
use crate::value::FieldValue;
use lcmdb_codec::{ObjectId, Snapshot};
use lcmdb_storage::ForeignChanges;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, trace, warn};

/// One reason foreign changes cannot be merged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Conflict {
    /// Both sides wrote a field that has no merge rule.
    FieldOverlap {
        /// Object both sides modified.
        object: ObjectId,
        /// Field both sides wrote.
        field: FieldId,
    },
    /// This client deleted an object another client modified.
    LocalDeleteOfForeignModified {
        /// The object.
        object: ObjectId,
    },
    /// Another client deleted an object this client modified.
    ForeignDeleteOfLocalModified {
        /// The object.
        object: ObjectId,
    },
    /// A local object links to an object another client deleted.
    LocalReferenceToForeignDeleted {
        /// Local object holding the link.
        from: ObjectId,
        /// Deleted target.
        to: ObjectId,
    },
    /// A foreign object references an object this client deleted.
    ForeignReferenceToLocalDeleted {
        /// Foreign object holding the reference.
        from: ObjectId,
        /// Deleted target.
        to: ObjectId,
    },
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FieldOverlap { object, field } => {
                write!(f, "{field} of {object} was changed by both clients")
            }
            Self::LocalDeleteOfForeignModified { object } => {
                write!(f, "{object} was deleted here and modified elsewhere")
            }
            Self::ForeignDeleteOfLocalModified { object } => {
                write!(f, "{object} was modified here and deleted elsewhere")
            }
            Self::LocalReferenceToForeignDeleted { from, to } => {
                write!(f, "{from} links to {to}, which was deleted elsewhere")
            }
            Self::ForeignReferenceToLocalDeleted { from, to } => {
                write!(f, "{from} references {to}, which was deleted here")
            }
        }
    }
}

/// Every conflict found in one compatibility check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    /// Conflicts, sorted.
    pub conflicts: Vec<Conflict>,
}

impl ConflictReport {
    /// Returns true if the changes can be merged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Returns the number of conflicts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }
}

/// Net view of local unsaved work, relative to what the store holds.
#[derive(Debug, Clone, Default)]
pub struct LocalChanges {
    /// Objects that exist locally but not in the store.
    pub created: BTreeSet<ObjectId>,
    /// Objects the store holds that were deleted locally.
    pub deleted: BTreeSet<ObjectId>,
    /// Earliest record per written slot, oriented from store value to
    /// local value.
    pub first_records: BTreeMap<ChangeKey, ChangeRecord>,
    /// Links that local records introduced, per linking object.
    pub added_links: BTreeMap<ObjectId, BTreeSet<ObjectId>>,
}

impl LocalChanges {
    /// Builds the view from units in the order they moved the graph away
    /// from the stored state.
    ///
    /// Units paired with [`Direction::Forward`] are applied and unsaved;
    /// units paired with [`Direction::Backward`] were saved and are
    /// currently reverted, newest first.
    pub fn collect<'a>(units: impl IntoIterator<Item = (&'a UnitOfWork, Direction)>) -> Self {
        let mut local = Self::default();
        for (unit, direction) in units {
            local.absorb(unit, direction);
        }
        let transient: Vec<ObjectId> = local.created.intersection(&local.deleted).copied().collect();
        for id in transient {
            local.created.remove(&id);
            local.deleted.remove(&id);
        }
        local
    }

    fn absorb(&mut self, unit: &UnitOfWork, direction: Direction) {
        for record in unit.changes() {
            match (record, direction) {
                (ChangeRecord::Created(c), Direction::Forward)
                | (ChangeRecord::Deleted(c), Direction::Backward) => {
                    self.created.insert(c.object);
                }
                (ChangeRecord::Created(c), Direction::Backward)
                | (ChangeRecord::Deleted(c), Direction::Forward) => {
                    self.deleted.insert(c.object);
                }
                _ => {}
            }
            if record.is_lifecycle() || !record.is_data_change() || record.is_no_op() {
                continue;
            }
            if let Some(key) = record.key() {
                self.first_records.entry(key).or_insert_with(|| match direction {
                    Direction::Forward => record.clone(),
                    Direction::Backward => record.reversed(),
                });
            }
            if direction == Direction::Forward {
                let before = record.linked_objects(Direction::Backward);
                let added: Vec<ObjectId> = record
                    .linked_objects(Direction::Forward)
                    .into_iter()
                    .filter(|id| !before.contains(id))
                    .collect();
                if !added.is_empty() {
                    self.added_links
                        .entry(record.object())
                        .or_default()
                        .extend(added);
                }
            }
        }
    }

    /// Returns true if local work wrote a stored field of `object`.
    #[must_use]
    pub fn is_modified(&self, object: ObjectId) -> bool {
        self.first_records.keys().any(|k| k.object == object)
    }

    /// Returns true if local work wrote the slot.
    #[must_use]
    pub fn wrote(&self, object: ObjectId, field: FieldId) -> bool {
        self.first_records
            .keys()
            .any(|k| k.object == object && k.field == field)
    }

    fn base_value(&self, key: &ChangeKey) -> Option<FieldValue> {
        self.first_records
            .get(key)
            .and_then(|r| r.value(Direction::Backward))
    }
}

/// Reads a field out of a foreign snapshot, with the kind's default when
/// the snapshot omits it.
fn foreign_value(def: &FieldDef, snapshot: &Snapshot) -> CoreResult<FieldValue> {
    match snapshot.field(&def.name) {
        Some(field) => FieldValue::from_snapshot_field(def, field),
        None => Ok(FieldValue::default_for(def.kind)),
    }
}

fn slot_key(object: ObjectId, field: FieldId) -> ChangeKey {
    ChangeKey {
        object,
        field,
        ws: None,
    }
}

/// Checks and merges one batch of foreign changes.
#[derive(Debug)]
pub struct ChangeReconciler<'a> {
    schema: &'a Schema,
    foreign: &'a ForeignChanges,
    local: &'a LocalChanges,
}

impl<'a> ChangeReconciler<'a> {
    /// Creates a reconciler.
    #[must_use]
    pub fn new(schema: &'a Schema, foreign: &'a ForeignChanges, local: &'a LocalChanges) -> Self {
        Self {
            schema,
            foreign,
            local,
        }
    }

    fn foreign_deleted(&self) -> BTreeSet<ObjectId> {
        self.foreign.deleted.iter().copied().collect()
    }

    /// Finds every reason the foreign changes cannot be merged.
    ///
    /// Nothing is modified.
    #[must_use]
    pub fn check(&self, repo: &dyn ObjectRepository) -> ConflictReport {
        let mut conflicts = BTreeSet::new();
        let foreign_modified: BTreeMap<ObjectId, &Snapshot> =
            self.foreign.modified.iter().map(|s| (s.guid, s)).collect();
        let foreign_deleted = self.foreign_deleted();

        // Overlapping writes to fields without a merge rule.
        for (key, record) in &self.local.first_records {
            let Some(snapshot) = foreign_modified.get(&key.object) else {
                continue;
            };
            if self.is_mergeable(key.field) {
                continue;
            }
            if self.overlaps(repo, key, record, snapshot) {
                conflicts.insert(Conflict::FieldOverlap {
                    object: key.object,
                    field: key.field,
                });
            }
        }

        for &object in &self.local.deleted {
            if foreign_modified.contains_key(&object) {
                conflicts.insert(Conflict::LocalDeleteOfForeignModified { object });
            }
        }
        for &object in &foreign_deleted {
            if self.local.is_modified(object) {
                conflicts.insert(Conflict::ForeignDeleteOfLocalModified { object });
            }
        }

        for (&from, targets) in &self.local.added_links {
            for &to in targets.intersection(&foreign_deleted) {
                conflicts.insert(Conflict::LocalReferenceToForeignDeleted { from, to });
            }
        }
        for &from in &self.local.created {
            let Ok(snapshot) = repo.snapshot_of(from) else {
                continue;
            };
            for link in snapshot.links() {
                if foreign_deleted.contains(&link.guid) {
                    conflicts.insert(Conflict::LocalReferenceToForeignDeleted { from, to: link.guid });
                }
            }
        }

        for snapshot in self.foreign.created.iter().chain(&self.foreign.modified) {
            for to in snapshot.reference_targets() {
                if self.local.deleted.contains(&to) {
                    conflicts.insert(Conflict::ForeignReferenceToLocalDeleted {
                        from: snapshot.guid,
                        to,
                    });
                }
            }
        }

        ConflictReport {
            conflicts: conflicts.into_iter().collect(),
        }
    }

    fn is_mergeable(&self, field: FieldId) -> bool {
        self.schema.is_date_modified(field)
            || self.schema.field_kind(field).is_ok_and(FieldKind::is_vector)
    }

    /// A slot overlaps when the foreign value moved away from the store
    /// value and does not agree with the local value.
    fn overlaps(
        &self,
        repo: &dyn ObjectRepository,
        key: &ChangeKey,
        record: &ChangeRecord,
        snapshot: &Snapshot,
    ) -> bool {
        let Ok(def) = self.schema.field(key.field) else {
            return true;
        };
        let Ok(foreign) = foreign_value(def, snapshot) else {
            return true;
        };
        let Ok(current) = repo.field(key.object, key.field) else {
            return true;
        };
        match (record, &foreign, &current) {
            (
                ChangeRecord::MultiString(c),
                FieldValue::MultiString(theirs),
                FieldValue::MultiString(ours),
            ) => {
                let theirs = theirs.get(&c.ws);
                theirs != c.old.as_ref() && theirs != ours.get(&c.ws)
            }
            _ => match record.value(Direction::Backward) {
                Some(base) => foreign != base && foreign != current,
                None => true,
            },
        }
    }

    /// Builds and applies the unit that brings the foreign changes in.
    ///
    /// `units` are every local unit that may still be undone or redone.
    /// Their records on merged slots are rewritten only once the foreign
    /// unit has been applied; on error they are left as they were. The
    /// caller must have run [`ChangeReconciler::check`] first.
    ///
    /// # Errors
    ///
    /// Returns an error if a foreign snapshot does not fit the schema or the
    /// repository refuses a value. A partly applied unit is reverted first.
    pub fn reconcile(
        &self,
        repo: &mut dyn ObjectRepository,
        units: &mut [&mut UnitOfWork],
        sequence: SequenceNumber,
    ) -> CoreResult<(UnitOfWork, Vec<ChangeNotification>)> {
        let mut unit = UnitOfWork::new(sequence, false, "", "");
        let mut rewrites = Vec::new();
        let mut diffed = Vec::new();

        for snapshot in &self.foreign.created {
            if repo.has_object(snapshot.guid) {
                diffed.push(snapshot);
            } else {
                self.add_created(&*repo, &mut unit, snapshot)?;
            }
        }
        for snapshot in &self.foreign.modified {
            if repo.has_object(snapshot.guid) {
                diffed.push(snapshot);
            } else if !self.local.deleted.contains(&snapshot.guid) {
                self.add_created(&*repo, &mut unit, snapshot)?;
            }
        }
        for snapshot in diffed {
            self.diff_object(&*repo, &mut unit, &mut rewrites, snapshot)?;
        }
        for &id in &self.foreign.deleted {
            if repo.has_object(id) {
                self.add_deleted(&*repo, &mut unit, id)?;
            }
        }

        debug!(
            sequence = %sequence,
            records = unit.len(),
            rewrites = rewrites.len(),
            "applying foreign changes"
        );
        if let Err(e) = unit.redo(repo) {
            if let Err(revert) = unit.undo(repo) {
                warn!(error = %revert, "reverting a partly applied foreign unit failed");
            }
            return Err(e);
        }
        for rewrite in &rewrites {
            rewrite.apply(units);
        }
        let notifications = unit.notifications(Direction::Forward, &*repo);
        Ok((unit, notifications))
    }

    fn add_created(
        &self,
        repo: &dyn ObjectRepository,
        unit: &mut UnitOfWork,
        snapshot: &Snapshot,
    ) -> CoreResult<()> {
        let class = self.schema.class_by_name(&snapshot.class)?;
        trace!(object = %snapshot.guid, class = %snapshot.class, "foreign creation");
        unit.add_action(ChangeRecord::Created(ObjectLifecycle {
            object: snapshot.guid,
            class,
            snapshot: Some(snapshot.clone()),
        }));
        // Derived fields of existing objects the new one points at.
        for def in self.schema.fields_of(class) {
            if def.is_virtual() || !def.kind.is_reference() {
                continue;
            }
            let value = foreign_value(def, snapshot)?;
            for record in ChangeRecord::back_reference_changes(
                repo,
                def.id,
                &FieldValue::default_for(def.kind),
                &value,
            ) {
                unit.add_action(record);
            }
        }
        Ok(())
    }

    fn add_deleted(
        &self,
        repo: &dyn ObjectRepository,
        unit: &mut UnitOfWork,
        id: ObjectId,
    ) -> CoreResult<()> {
        let class = repo
            .get_object(id)
            .map(|o| o.class())
            .ok_or(CoreError::ObjectNotFound { id })?;
        for def in self.schema.fields_of(class) {
            if def.is_virtual() || !def.kind.is_reference() {
                continue;
            }
            let value = repo.field(id, def.id)?;
            for record in ChangeRecord::back_reference_changes(
                repo,
                def.id,
                &value,
                &FieldValue::default_for(def.kind),
            ) {
                unit.add_action(record);
            }
        }
        trace!(object = %id, "foreign deletion");
        unit.register_deleted(id, class, repo.snapshot_of(id)?);
        Ok(())
    }

    fn diff_object(
        &self,
        repo: &dyn ObjectRepository,
        unit: &mut UnitOfWork,
        rewrites: &mut Vec<LocalRewrite>,
        snapshot: &Snapshot,
    ) -> CoreResult<()> {
        let object = snapshot.guid;
        let class = repo
            .get_object(object)
            .map(|o| o.class())
            .ok_or(CoreError::ObjectNotFound { id: object })?;
        if self.schema.class_by_name(&snapshot.class)? != class {
            return Err(CoreError::invalid_schema(format!(
                "{object} changed class to {} in another client",
                snapshot.class
            )));
        }

        for def in self.schema.fields_of(class) {
            if def.is_virtual() {
                continue;
            }
            let foreign = foreign_value(def, snapshot)?;
            let current = repo.field(object, def.id)?;
            let key = slot_key(object, def.id);
            let target = match (&foreign, &current) {
                (FieldValue::Time(theirs), FieldValue::Time(ours)) if def.is_date_modified() => {
                    if self.local.first_records.contains_key(&key) {
                        let (target, rewrite) = merge_date_modified(key, *ours, *theirs);
                        rewrites.push(rewrite);
                        target
                    } else {
                        Some(foreign.clone())
                    }
                }
                (FieldValue::Vector(theirs), FieldValue::Vector(ours)) => {
                    match self.local.base_value(&key) {
                        Some(FieldValue::Vector(base)) => {
                            let merge = three_way(&base, ours, theirs);
                            let target = FieldValue::Vector(merge.merged.clone());
                            rewrites.push(LocalRewrite::Rebase {
                                key,
                                ours: ours.clone(),
                                merge,
                            });
                            Some(target)
                        }
                        _ => Some(foreign.clone()),
                    }
                }
                (FieldValue::MultiString(theirs), FieldValue::MultiString(ours)) => {
                    let mut merged = BTreeMap::new();
                    for ws in theirs.keys().chain(ours.keys()) {
                        let local_wrote = self.local.first_records.contains_key(&ChangeKey {
                            object,
                            field: def.id,
                            ws: Some(*ws),
                        });
                        let source = if local_wrote { ours } else { theirs };
                        if let Some(text) = source.get(ws) {
                            merged.insert(*ws, text.clone());
                        }
                    }
                    Some(FieldValue::MultiString(merged))
                }
                _ if self.local.first_records.contains_key(&key) => None,
                _ => Some(foreign.clone()),
            };

            let Some(target) = target else { continue };
            if target == current {
                continue;
            }
            for record in ChangeRecord::back_reference_changes(repo, def.id, &current, &target) {
                unit.add_action(record);
            }
            for record in ChangeRecord::from_field_values(def, object, current, target)? {
                unit.add_action(record);
            }
        }
        Ok(())
    }
}

/// A change to local records, held back until the foreign unit is applied.
#[derive(Debug)]
enum LocalRewrite {
    /// Raise the old side of local `DateModified` records to `floor`.
    Clamp { key: ChangeKey, floor: Timestamp },
    /// The foreign timestamp wins; local records on the slot go.
    Drop { key: ChangeKey },
    /// Rebase local collection records onto the merged value.
    Rebase {
        key: ChangeKey,
        ours: Vec<ObjectId>,
        merge: CollectionMerge,
    },
}

impl LocalRewrite {
    fn apply(&self, units: &mut [&mut UnitOfWork]) {
        match self {
            Self::Clamp { key, floor } => for_each_record(units, key, |record| {
                if let Some(change) = record.as_time_mut() {
                    change.old = change.old.max(*floor);
                }
            }),
            Self::Drop { key } => {
                for unit in units.iter_mut() {
                    unit.remove_records(|record| record.key().as_ref() == Some(key));
                }
            }
            Self::Rebase { key, ours, merge } => {
                let rewrite = |values: &[ObjectId]| {
                    if values == ours.as_slice() {
                        merge.merged.clone()
                    } else {
                        rebase(values, &merge.foreign_added, &merge.foreign_deleted)
                    }
                };
                for_each_record(units, key, |record| {
                    if let Some(change) = record.as_vector_mut() {
                        change.old = rewrite(&change.old);
                        change.new = rewrite(&change.new);
                    }
                });
            }
        }
    }
}

/// Runs `f` on every local record writing `key`.
fn for_each_record(
    units: &mut [&mut UnitOfWork],
    key: &ChangeKey,
    mut f: impl FnMut(&mut ChangeRecord),
) {
    for unit in units.iter_mut() {
        for record in unit.changes_mut() {
            if record.key().as_ref() == Some(key) {
                f(record);
            }
        }
    }
}

/// Resolves a `DateModified` both sides wrote into the value the synthetic
/// unit should write, if any, and the rewrite local records need.
fn merge_date_modified(
    key: ChangeKey,
    ours: Timestamp,
    theirs: Timestamp,
) -> (Option<FieldValue>, LocalRewrite) {
    match merge_timestamp(ours, theirs) {
        TimestampMerge::KeepLocal { floor } => (None, LocalRewrite::Clamp { key, floor }),
        TimestampMerge::TakeForeign => (Some(FieldValue::Time(theirs)), LocalRewrite::Drop { key }),
    }
}
