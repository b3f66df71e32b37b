//! Identity map of resident domain objects.

mod memory;

pub use memory::InMemoryRepository;

use crate::error::CoreResult;
use crate::schema::Schema;
use crate::types::{ClassId, FieldId, Handle};
use crate::value::FieldValue;
use lcmdb_codec::{ObjectId, Snapshot};
use std::collections::BTreeMap;

/// One resident domain object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainObject {
    pub(crate) id: ObjectId,
    pub(crate) handle: Handle,
    pub(crate) class: ClassId,
    pub(crate) owner: Option<(ObjectId, FieldId)>,
    pub(crate) fields: BTreeMap<FieldId, FieldValue>,
}

impl DomainObject {
    /// Returns the stable GUID.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Returns the transient handle.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Returns the class.
    #[must_use]
    pub fn class(&self) -> ClassId {
        self.class
    }

    /// Returns the owning object and field.
    #[must_use]
    pub fn owner(&self) -> Option<(ObjectId, FieldId)> {
        self.owner
    }

    /// Returns the stored value of a field, `None` if never set.
    #[must_use]
    pub fn stored(&self, field: FieldId) -> Option<&FieldValue> {
        self.fields.get(&field)
    }
}

/// Repository of resident objects keyed by GUID and by handle.
///
/// The repository applies values; it never records them. Change tracking
/// is the job of the unit of work.
pub trait ObjectRepository: Send + Sync {
    /// Returns the schema objects are described by.
    fn schema(&self) -> &Schema;

    /// Returns a resident object.
    fn get_object(&self, id: ObjectId) -> Option<&DomainObject>;

    /// Returns true if the object is resident.
    fn has_object(&self, id: ObjectId) -> bool {
        self.get_object(id).is_some()
    }

    /// Returns the transient handle of a resident object.
    fn handle_of(&self, id: ObjectId) -> Option<Handle> {
        self.get_object(id).map(DomainObject::handle)
    }

    /// Returns the object currently holding `handle`.
    fn object_by_handle(&self, handle: Handle) -> Option<ObjectId>;

    /// Registers a new empty object.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is already resident or the class is unknown.
    fn register_created(
        &mut self,
        id: ObjectId,
        class: ClassId,
        owner: Option<(ObjectId, FieldId)>,
    ) -> CoreResult<Handle>;

    /// Removes an object and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not resident.
    fn unregister(&mut self, id: ObjectId) -> CoreResult<DomainObject>;

    /// Creates or overwrites an object from its snapshot.
    ///
    /// Links are stored as given; the owner, if any, must be resident so
    /// that the owning field name can be resolved.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown classes or fields and mistyped values.
    fn materialize_from_snapshot(&mut self, snapshot: &Snapshot) -> CoreResult<Handle>;

    /// Serializes a resident object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not resident.
    fn snapshot_of(&self, id: ObjectId) -> CoreResult<Snapshot>;

    /// Reads a field. Unset fields read as their kind's default and derived
    /// fields are computed.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not resident or the field is unknown.
    fn field(&self, id: ObjectId, field: FieldId) -> CoreResult<FieldValue>;

    /// Writes a stored field.
    ///
    /// Writing an owning field makes added targets owned by `id`.
    ///
    /// # Errors
    ///
    /// Returns an error for mistyped values, derived fields, and links to
    /// objects that are not resident.
    fn set_field(&mut self, id: ObjectId, field: FieldId, value: FieldValue) -> CoreResult<()>;

    /// Overwrites the owner of an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not resident.
    fn set_owner(&mut self, id: ObjectId, owner: Option<(ObjectId, FieldId)>) -> CoreResult<()>;

    /// Returns every stored `(object, field)` pair linking to `target`.
    fn referrers(&self, target: ObjectId) -> Vec<(ObjectId, FieldId)>;

    /// Returns the objects whose `source` field links to `target`.
    fn back_references(&self, target: ObjectId, source: FieldId) -> Vec<ObjectId> {
        self.referrers(target)
            .into_iter()
            .filter(|(_, f)| *f == source)
            .map(|(o, _)| o)
            .collect()
    }

    /// Returns the ids of all resident objects.
    fn object_ids(&self) -> Vec<ObjectId>;

    /// Returns the number of resident objects.
    fn len(&self) -> usize;

    /// Returns true if nothing is resident.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
