//! In-memory object repository.

use super::{DomainObject, ObjectRepository};
use crate::error::{CoreError, CoreResult};
use crate::schema::Schema;
use crate::types::{ClassId, FieldId, Handle};
use crate::value::FieldValue;
use lcmdb_codec::{ObjectId, Snapshot};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An arena of resident objects indexed by GUID and by handle.
///
/// # Example
///
/// ```rust
/// use lcmdb_core::{FieldKind, FieldValue, InMemoryRepository, ObjectId, ObjectRepository, Schema};
/// use std::sync::Arc;
///
/// let mut builder = Schema::builder();
/// let entry = builder.class("LexEntry");
/// let form = builder.field(entry, "Form", FieldKind::String);
/// let schema = Arc::new(builder.build().unwrap());
///
/// let mut repo = InMemoryRepository::new(schema);
/// let id = ObjectId::new();
/// repo.register_created(id, entry, None).unwrap();
/// repo.set_field(id, form, FieldValue::String("dog".into())).unwrap();
/// assert_eq!(repo.field(id, form).unwrap(), FieldValue::String("dog".into()));
/// ```
#[derive(Debug)]
pub struct InMemoryRepository {
    schema: Arc<Schema>,
    objects: BTreeMap<ObjectId, DomainObject>,
    handles: HashMap<Handle, ObjectId>,
    next_handle: u32,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            objects: BTreeMap::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    fn allocate_handle(&mut self, id: ObjectId) -> Handle {
        let handle = Handle::new(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.handles.insert(handle, id);
        handle
    }

    fn object(&self, id: ObjectId) -> CoreResult<&DomainObject> {
        self.objects.get(&id).ok_or(CoreError::ObjectNotFound { id })
    }

    fn object_mut(&mut self, id: ObjectId) -> CoreResult<&mut DomainObject> {
        self.objects
            .get_mut(&id)
            .ok_or(CoreError::ObjectNotFound { id })
    }

    fn check_field_of(&self, object: &DomainObject, field: FieldId) -> CoreResult<()> {
        let def = self.schema.field(field)?;
        if def.class == object.class {
            Ok(())
        } else {
            Err(CoreError::kind_mismatch(
                field,
                format!("field belongs to {}, object is {}", def.class, object.class),
            ))
        }
    }
}

impl ObjectRepository for InMemoryRepository {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn get_object(&self, id: ObjectId) -> Option<&DomainObject> {
        self.objects.get(&id)
    }

    fn object_by_handle(&self, handle: Handle) -> Option<ObjectId> {
        self.handles.get(&handle).copied()
    }

    fn register_created(
        &mut self,
        id: ObjectId,
        class: ClassId,
        owner: Option<(ObjectId, FieldId)>,
    ) -> CoreResult<Handle> {
        if self.objects.contains_key(&id) {
            return Err(CoreError::ObjectExists { id });
        }
        self.schema.class_name(class)?;
        let handle = self.allocate_handle(id);
        self.objects.insert(
            id,
            DomainObject {
                id,
                handle,
                class,
                owner,
                fields: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    fn unregister(&mut self, id: ObjectId) -> CoreResult<DomainObject> {
        let object = self
            .objects
            .remove(&id)
            .ok_or(CoreError::ObjectNotFound { id })?;
        self.handles.remove(&object.handle);
        Ok(object)
    }

    fn materialize_from_snapshot(&mut self, snapshot: &Snapshot) -> CoreResult<Handle> {
        let class = self.schema.class_by_name(&snapshot.class)?;
        let owner = match (snapshot.owner, snapshot.owning_field.as_deref()) {
            (Some(owner), Some(name)) => {
                let owner_class = self.object(owner)?.class;
                Some((owner, self.schema.field_by_name(owner_class, name)?))
            }
            _ => None,
        };

        let mut fields = BTreeMap::new();
        for (name, value) in &snapshot.fields {
            let def = self.schema.field(self.schema.field_by_name(class, name)?)?;
            if def.is_virtual() {
                continue;
            }
            fields.insert(def.id, FieldValue::from_snapshot_field(def, value)?);
        }

        if let Some(existing) = self.objects.get_mut(&snapshot.guid) {
            if existing.class != class {
                return Err(CoreError::invalid_operation(format!(
                    "snapshot of {} changes class from {} to {}",
                    snapshot.guid, existing.class, class
                )));
            }
            existing.owner = owner;
            existing.fields = fields;
            return Ok(existing.handle);
        }

        let handle = self.allocate_handle(snapshot.guid);
        self.objects.insert(
            snapshot.guid,
            DomainObject {
                id: snapshot.guid,
                handle,
                class,
                owner,
                fields,
            },
        );
        Ok(handle)
    }

    fn snapshot_of(&self, id: ObjectId) -> CoreResult<Snapshot> {
        let object = self.object(id)?;
        let mut snapshot = Snapshot::new(id, self.schema.class_name(object.class)?);
        if let Some((owner, field)) = object.owner {
            snapshot = snapshot.with_owner(owner, self.schema.field_name(field)?);
        }
        for (field, value) in &object.fields {
            let def = self.schema.field(*field)?;
            snapshot = snapshot.with_field(def.name.clone(), value.to_snapshot_field(def.kind));
        }
        Ok(snapshot)
    }

    fn field(&self, id: ObjectId, field: FieldId) -> CoreResult<FieldValue> {
        let object = self.object(id)?;
        self.check_field_of(object, field)?;
        let def = self.schema.field(field)?;
        if let Some(source) = def.virtual_source {
            return Ok(FieldValue::Vector(self.back_references(id, source)));
        }
        Ok(object
            .fields
            .get(&field)
            .cloned()
            .unwrap_or_else(|| FieldValue::default_for(def.kind)))
    }

    fn set_field(&mut self, id: ObjectId, field: FieldId, value: FieldValue) -> CoreResult<()> {
        let object = self.object(id)?;
        self.check_field_of(object, field)?;
        let def = self.schema.field(field)?;
        if def.is_virtual() {
            return Err(CoreError::kind_mismatch(field, "derived fields are read-only"));
        }
        if !value.matches_kind(def.kind) {
            return Err(CoreError::kind_mismatch(
                field,
                format!("{value:?} is not a {:?} value", def.kind),
            ));
        }
        let targets = value.object_ids();
        if let Some(missing) = targets.iter().find(|t| !self.objects.contains_key(t)) {
            return Err(CoreError::DanglingReference {
                from: id,
                field,
                to: *missing,
            });
        }

        if def.kind.is_owning() {
            let previous = object
                .fields
                .get(&field)
                .map(FieldValue::object_ids)
                .unwrap_or_default();
            for released in previous.iter().filter(|p| !targets.contains(p)) {
                if let Some(child) = self.objects.get_mut(released) {
                    if child.owner == Some((id, field)) {
                        child.owner = None;
                    }
                }
            }
            for owned in &targets {
                if let Some(child) = self.objects.get_mut(owned) {
                    child.owner = Some((id, field));
                }
            }
        }

        self.object_mut(id)?.fields.insert(field, value);
        Ok(())
    }

    fn set_owner(&mut self, id: ObjectId, owner: Option<(ObjectId, FieldId)>) -> CoreResult<()> {
        self.object_mut(id)?.owner = owner;
        Ok(())
    }

    fn referrers(&self, target: ObjectId) -> Vec<(ObjectId, FieldId)> {
        self.objects
            .values()
            .flat_map(|o| {
                o.fields
                    .iter()
                    .filter(move |(_, v)| v.contains_object(target))
                    .map(move |(f, _)| (o.id, *f))
            })
            .collect()
    }

    fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    fn len(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    struct Fixture {
        repo: InMemoryRepository,
        entry: ClassId,
        sense: ClassId,
        form: FieldId,
        senses: FieldId,
        related: FieldId,
        related_by: FieldId,
    }

    fn fixture() -> Fixture {
        let mut b = Schema::builder();
        let entry = b.class("LexEntry");
        let sense = b.class("LexSense");
        let form = b.field(entry, "Form", FieldKind::String);
        let senses = b.field(entry, "Senses", FieldKind::OwningSequence);
        let related = b.field(entry, "Related", FieldKind::ReferenceCollection);
        let related_by = b.virtual_field(entry, "RelatedBy", related);
        Fixture {
            repo: InMemoryRepository::new(Arc::new(b.build().unwrap())),
            entry,
            sense,
            form,
            senses,
            related,
            related_by,
        }
    }

    #[test]
    fn register_and_unregister() {
        let mut f = fixture();
        let id = ObjectId::new();
        let handle = f.repo.register_created(id, f.entry, None).unwrap();
        assert!(f.repo.has_object(id));
        assert_eq!(f.repo.object_by_handle(handle), Some(id));
        assert!(matches!(
            f.repo.register_created(id, f.entry, None),
            Err(CoreError::ObjectExists { .. })
        ));

        f.repo.unregister(id).unwrap();
        assert!(!f.repo.has_object(id));
        assert_eq!(f.repo.object_by_handle(handle), None);

        let again = f.repo.register_created(id, f.entry, None).unwrap();
        assert_ne!(again, handle);
    }

    #[test]
    fn unset_fields_read_as_default() {
        let mut f = fixture();
        let id = ObjectId::new();
        f.repo.register_created(id, f.entry, None).unwrap();
        assert_eq!(f.repo.field(id, f.form).unwrap(), FieldValue::String(String::new()));
        assert_eq!(f.repo.field(id, f.senses).unwrap(), FieldValue::Vector(vec![]));
    }

    #[test]
    fn set_field_rejects_bad_values() {
        let mut f = fixture();
        let id = ObjectId::new();
        f.repo.register_created(id, f.entry, None).unwrap();

        let err = f.repo.set_field(id, f.form, FieldValue::Integer(1));
        assert!(matches!(err, Err(CoreError::FieldKindMismatch { .. })));

        let ghost = ObjectId::new();
        let err = f
            .repo
            .set_field(id, f.related, FieldValue::Vector(vec![ghost]));
        assert!(matches!(err, Err(CoreError::DanglingReference { to, .. }) if to == ghost));

        let err = f.repo.set_field(id, f.related_by, FieldValue::Vector(vec![]));
        assert!(matches!(err, Err(CoreError::FieldKindMismatch { .. })));
    }

    #[test]
    fn owning_fields_track_owner() {
        let mut f = fixture();
        let entry = ObjectId::new();
        let sense = ObjectId::new();
        f.repo.register_created(entry, f.entry, None).unwrap();
        f.repo.register_created(sense, f.sense, None).unwrap();

        f.repo
            .set_field(entry, f.senses, FieldValue::Vector(vec![sense]))
            .unwrap();
        assert_eq!(f.repo.get_object(sense).unwrap().owner(), Some((entry, f.senses)));

        f.repo
            .set_field(entry, f.senses, FieldValue::Vector(vec![]))
            .unwrap();
        assert_eq!(f.repo.get_object(sense).unwrap().owner(), None);
    }

    #[test]
    fn virtual_field_lists_referrers() {
        let mut f = fixture();
        let a = ObjectId::new();
        let b = ObjectId::new();
        f.repo.register_created(a, f.entry, None).unwrap();
        f.repo.register_created(b, f.entry, None).unwrap();
        f.repo
            .set_field(a, f.related, FieldValue::Vector(vec![b]))
            .unwrap();

        assert_eq!(f.repo.referrers(b), vec![(a, f.related)]);
        assert_eq!(f.repo.field(b, f.related_by).unwrap(), FieldValue::Vector(vec![a]));
    }

    #[test]
    fn snapshot_materialize_round_trip() {
        let mut f = fixture();
        let entry = ObjectId::new();
        let sense = ObjectId::new();
        f.repo.register_created(entry, f.entry, None).unwrap();
        f.repo.register_created(sense, f.sense, None).unwrap();
        f.repo
            .set_field(entry, f.form, FieldValue::String("cat".into()))
            .unwrap();
        f.repo
            .set_field(entry, f.senses, FieldValue::Vector(vec![sense]))
            .unwrap();

        let entry_snap = f.repo.snapshot_of(entry).unwrap();
        let sense_snap = f.repo.snapshot_of(sense).unwrap();
        assert_eq!(sense_snap.owner, Some(entry));
        assert_eq!(sense_snap.owning_field.as_deref(), Some("Senses"));

        f.repo.unregister(sense).unwrap();
        f.repo.unregister(entry).unwrap();

        f.repo.materialize_from_snapshot(&entry_snap).unwrap();
        f.repo.materialize_from_snapshot(&sense_snap).unwrap();
        assert_eq!(f.repo.snapshot_of(entry).unwrap(), entry_snap);
        assert_eq!(f.repo.snapshot_of(sense).unwrap(), sense_snap);
    }

    #[test]
    fn materialize_needs_resident_owner() {
        let mut f = fixture();
        let snap = Snapshot::new(ObjectId::new(), "LexSense").with_owner(ObjectId::new(), "Senses");
        assert!(matches!(
            f.repo.materialize_from_snapshot(&snap),
            Err(CoreError::ObjectNotFound { .. })
        ));
    }
}
