//! Recorded mutations inside an open task.

use super::service::TransactionService;
use crate::change::ChangeRecord;
use crate::error::{CoreError, CoreResult};
use crate::repository::ObjectRepository;
use crate::schema::Schema;
use crate::types::{ClassId, FieldId, Timestamp, WritingSystem};
use crate::undo::UndoStack;
use crate::unit_of_work::UnitOfWork;
use crate::value::FieldValue;
use lcmdb_codec::ObjectId;
use tracing::trace;
use uuid::Uuid;

/// Writes to the graph and records every write in the open unit.
struct Editor<'a> {
    unit: &'a mut UnitOfWork,
    repo: &'a mut dyn ObjectRepository,
    schema: &'a Schema,
}

impl Editor<'_> {
    /// Writes one field and records it, with derived-field side effects.
    fn write(&mut self, object: ObjectId, field: FieldId, new: FieldValue) -> CoreResult<()> {
        let schema = self.schema;
        let def = schema.field(field)?;
        let old = self.repo.field(object, field)?;
        if old == new {
            return Ok(());
        }
        let records = ChangeRecord::from_field_values(def, object, old.clone(), new.clone())?;
        self.repo.set_field(object, field, new.clone())?;
        for record in records {
            self.unit.add_action(record);
        }
        for record in ChangeRecord::back_reference_changes(&*self.repo, field, &old, &new) {
            self.unit.add_action(record);
        }
        Ok(())
    }

    fn is_ancestor_or_self(&self, candidate: ObjectId, of: ObjectId) -> bool {
        let mut cursor = Some(of);
        while let Some(id) = cursor {
            if id == candidate {
                return true;
            }
            cursor = self
                .repo
                .get_object(id)
                .and_then(|o| o.owner())
                .map(|(owner, _)| owner);
        }
        false
    }

    /// Writes a field with ownership rules: released children are deleted
    /// and adopted children leave their old owner.
    fn set(&mut self, object: ObjectId, field: FieldId, value: FieldValue) -> CoreResult<()> {
        let kind = self.schema.field_kind(field)?;
        if !kind.is_owning() {
            return self.write(object, field, value);
        }

        let old = self.repo.field(object, field)?.object_ids();
        let new = value.object_ids();
        for &child in new.iter().filter(|id| !old.contains(id)) {
            if self.is_ancestor_or_self(child, object) {
                return Err(CoreError::invalid_operation(format!(
                    "{child} cannot own its own owner {object}"
                )));
            }
            let previous = self.repo.get_object(child).and_then(|o| o.owner());
            if let Some((owner, owner_field)) = previous {
                if (owner, owner_field) != (object, field) {
                    let remaining = self.repo.field(owner, owner_field)?.without_object(child);
                    self.write(owner, owner_field, remaining)?;
                }
            }
        }
        for &child in old.iter().filter(|id| !new.contains(id)) {
            self.delete(child)?;
        }
        self.write(object, field, value)
    }

    fn create(&mut self, class: ClassId, owner: Option<(ObjectId, FieldId)>) -> CoreResult<ObjectId> {
        self.schema.class_name(class)?;
        if let Some((owner_id, owner_field)) = owner {
            let def = self.schema.field(owner_field)?;
            if !def.kind.is_owning() {
                return Err(CoreError::kind_mismatch(owner_field, "not an owning field"));
            }
            // Fails for absent owners and fields of another class.
            self.repo.field(owner_id, owner_field)?;
        }

        let id = ObjectId::new();
        self.repo.register_created(id, class, owner)?;
        self.unit.register_created(id, class);
        trace!(object = %id, class = %class, "object created");

        if let Some((owner_id, owner_field)) = owner {
            match self.repo.field(owner_id, owner_field)? {
                FieldValue::Vector(mut children) => {
                    children.push(id);
                    self.write(owner_id, owner_field, FieldValue::Vector(children))?;
                }
                FieldValue::Atomic(previous) => {
                    if let Some(previous) = previous {
                        self.delete(previous)?;
                    }
                    self.write(owner_id, owner_field, FieldValue::Atomic(Some(id)))?;
                }
                other => {
                    return Err(CoreError::kind_mismatch(
                        owner_field,
                        format!("cannot own objects through {other:?}"),
                    ))
                }
            }
        }
        Ok(id)
    }

    /// Deletes an object with everything it owns, after clearing every link
    /// to it.
    fn delete(&mut self, id: ObjectId) -> CoreResult<()> {
        let schema = self.schema;
        let object = self
            .repo
            .get_object(id)
            .ok_or(CoreError::ObjectNotFound { id })?;
        let class = object.class();
        let owner = object.owner();
        let stored: Vec<_> = schema.fields_of(class).filter(|d| !d.is_virtual()).collect();

        for def in stored.iter().filter(|d| d.kind.is_owning()) {
            for child in self.repo.field(id, def.id)?.object_ids() {
                self.delete(child)?;
            }
        }

        if let Some((owner_id, owner_field)) = owner {
            if self.repo.has_object(owner_id) {
                let remaining = self.repo.field(owner_id, owner_field)?.without_object(id);
                self.write(owner_id, owner_field, remaining)?;
            }
        }

        for (referrer, field) in self.repo.referrers(id) {
            if referrer == id || !schema.field_kind(field)?.is_reference() {
                continue;
            }
            let remaining = self.repo.field(referrer, field)?.without_object(id);
            self.write(referrer, field, remaining)?;
        }

        for def in stored.iter().filter(|d| d.kind.is_reference()) {
            let value = self.repo.field(id, def.id)?;
            let cleared = FieldValue::default_for(def.kind);
            for record in ChangeRecord::back_reference_changes(&*self.repo, def.id, &value, &cleared) {
                self.unit.add_action(record);
            }
        }

        let snapshot = self.repo.snapshot_of(id)?;
        self.repo.unregister(id)?;
        self.unit.register_deleted(id, class, snapshot);
        trace!(object = %id, "object deleted");
        Ok(())
    }
}

impl TransactionService {
    fn editor(&mut self) -> CoreResult<Editor<'_>> {
        let stack = self
            .active
            .ok_or_else(|| CoreError::invalid_operation("mutation outside a task"))?;
        let unit = self
            .stacks
            .get_mut(&stack)
            .and_then(UndoStack::current_mut)
            .ok_or_else(|| CoreError::invalid_operation("mutation outside a task"))?;
        let guard = self
            .write_guard
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("mutation without the graph lock"))?;
        Ok(Editor {
            unit,
            repo: &mut ***guard,
            schema: &self.schema,
        })
    }

    /// Creates an object, optionally owned through `owner`.
    ///
    /// Owning vectors get the new object appended; an owning atomic field
    /// has its previous occupant deleted.
    ///
    /// # Errors
    ///
    /// Fails outside a task, for unknown classes, and for owner fields that
    /// are not owning fields of the owner's class.
    pub fn create_object(&mut self, class: ClassId, owner: Option<(ObjectId, FieldId)>) -> CoreResult<ObjectId> {
        self.editor()?.create(class, owner)
    }

    /// Deletes an object and everything it owns, removing every reference
    /// to it.
    ///
    /// # Errors
    ///
    /// Fails outside a task or if the object is not resident.
    pub fn delete_object(&mut self, object: ObjectId) -> CoreResult<()> {
        self.editor()?.delete(object)
    }

    /// Writes a field.
    ///
    /// Objects dropped from an owning field are deleted; objects added to
    /// one move from their previous owner.
    ///
    /// # Errors
    ///
    /// Fails outside a task, for mistyped values, derived fields, and links
    /// to objects that are not resident.
    pub fn set_field(&mut self, object: ObjectId, field: FieldId, value: FieldValue) -> CoreResult<()> {
        self.editor()?.set(object, field, value)
    }

    /// Writes a boolean field.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_boolean(&mut self, object: ObjectId, field: FieldId, value: bool) -> CoreResult<()> {
        self.set_field(object, field, FieldValue::Boolean(value))
    }

    /// Writes an integer field.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_integer(&mut self, object: ObjectId, field: FieldId, value: i64) -> CoreResult<()> {
        self.set_field(object, field, FieldValue::Integer(value))
    }

    /// Writes a time field.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_time(&mut self, object: ObjectId, field: FieldId, value: Timestamp) -> CoreResult<()> {
        self.set_field(object, field, FieldValue::Time(value))
    }

    /// Writes a GUID field.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_guid(&mut self, object: ObjectId, field: FieldId, value: Option<Uuid>) -> CoreResult<()> {
        self.set_field(object, field, FieldValue::Guid(value))
    }

    /// Writes a string field.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_string(&mut self, object: ObjectId, field: FieldId, value: impl Into<String>) -> CoreResult<()> {
        self.set_field(object, field, FieldValue::String(value.into()))
    }

    /// Writes or clears one writing system of a multi-string field.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_multi_string(
        &mut self,
        object: ObjectId,
        field: FieldId,
        ws: WritingSystem,
        value: Option<String>,
    ) -> CoreResult<()> {
        let FieldValue::MultiString(mut alternatives) = self.field(object, field)? else {
            return Err(CoreError::kind_mismatch(field, "not a multi-string field"));
        };
        match value {
            Some(text) => alternatives.insert(ws, text),
            None => alternatives.remove(&ws),
        };
        self.set_field(object, field, FieldValue::MultiString(alternatives))
    }

    /// Writes an atomic object field.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_atomic(&mut self, object: ObjectId, field: FieldId, target: Option<ObjectId>) -> CoreResult<()> {
        self.set_field(object, field, FieldValue::Atomic(target))
    }

    /// Replaces a collection or sequence.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn set_vector(&mut self, object: ObjectId, field: FieldId, targets: Vec<ObjectId>) -> CoreResult<()> {
        self.set_field(object, field, FieldValue::Vector(targets))
    }

    /// Inserts `target` at `index`, or at the end if `index` is past it.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn insert_into_vector(
        &mut self,
        object: ObjectId,
        field: FieldId,
        index: usize,
        target: ObjectId,
    ) -> CoreResult<()> {
        let FieldValue::Vector(mut targets) = self.field(object, field)? else {
            return Err(CoreError::kind_mismatch(field, "not a vector field"));
        };
        targets.insert(index.min(targets.len()), target);
        self.set_field(object, field, FieldValue::Vector(targets))
    }

    /// Removes `target` from a vector. Owned targets are deleted.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::set_field`].
    pub fn remove_from_vector(&mut self, object: ObjectId, field: FieldId, target: ObjectId) -> CoreResult<()> {
        let value = self.field(object, field)?.without_object(target);
        self.set_field(object, field, value)
    }

    /// Runs `f` on the graph without recording anything.
    ///
    /// Pair it with [`TransactionService::register_created`],
    /// [`TransactionService::register_deleted`] or
    /// [`TransactionService::register_modified`] so undo sees the change.
    ///
    /// # Errors
    ///
    /// Fails outside a task, or with whatever `f` returns.
    pub fn edit_graph<R>(&mut self, f: impl FnOnce(&mut dyn ObjectRepository) -> CoreResult<R>) -> CoreResult<R> {
        let editor = self.editor()?;
        f(editor.repo)
    }

    /// Records the creation of an object the caller already registered in
    /// the repository.
    ///
    /// # Errors
    ///
    /// Fails outside a task or if the object is not resident.
    pub fn register_created(&mut self, object: ObjectId) -> CoreResult<()> {
        let editor = self.editor()?;
        let class = editor
            .repo
            .get_object(object)
            .map(|o| o.class())
            .ok_or(CoreError::ObjectNotFound { id: object })?;
        editor.unit.register_created(object, class);
        Ok(())
    }

    /// Removes a single object and records its deletion, without touching
    /// owned objects or links.
    ///
    /// # Errors
    ///
    /// Fails outside a task or if the object is not resident.
    pub fn register_deleted(&mut self, object: ObjectId) -> CoreResult<()> {
        let editor = self.editor()?;
        let class = editor
            .repo
            .get_object(object)
            .map(|o| o.class())
            .ok_or(CoreError::ObjectNotFound { id: object })?;
        let snapshot = editor.repo.snapshot_of(object)?;
        editor.repo.unregister(object)?;
        editor.unit.register_deleted(object, class, snapshot);
        Ok(())
    }

    /// Records a change the caller already applied to the graph.
    ///
    /// # Errors
    ///
    /// Fails outside a task.
    pub fn register_modified(&mut self, record: ChangeRecord) -> CoreResult<()> {
        self.editor()?.unit.add_action(record);
        Ok(())
    }
}
