//! Load-time metadata table.
//!
//! The schema maps class and field names to numeric ids and answers the
//! two questions the transactional core needs: what kind of value a field
//! holds, and what it is called.

use crate::error::{CoreError, CoreResult};
use crate::types::{ClassId, FieldId};
use std::collections::HashMap;

/// Name of the last-modified timestamp field.
pub const DATE_MODIFIED: &str = "DateModified";

/// What kind of value a field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// `bool`.
    Boolean,
    /// `i64`.
    Integer,
    /// Timestamp.
    Time,
    /// A GUID that is data, not an object link.
    Guid,
    /// Opaque bytes.
    Binary,
    /// Plain string.
    String,
    /// String per writing system.
    MultiString,
    /// Zero or one referenced object.
    ReferenceAtomic,
    /// Zero or one owned object.
    OwningAtomic,
    /// Unordered referenced objects.
    ReferenceCollection,
    /// Ordered referenced objects.
    ReferenceSequence,
    /// Unordered owned objects.
    OwningCollection,
    /// Ordered owned objects.
    OwningSequence,
}

impl FieldKind {
    /// Returns true for collection and sequence kinds.
    #[must_use]
    pub const fn is_vector(self) -> bool {
        matches!(
            self,
            Self::ReferenceCollection
                | Self::ReferenceSequence
                | Self::OwningCollection
                | Self::OwningSequence
        )
    }

    /// Returns true for kinds that own their targets.
    #[must_use]
    pub const fn is_owning(self) -> bool {
        matches!(
            self,
            Self::OwningAtomic | Self::OwningCollection | Self::OwningSequence
        )
    }

    /// Returns true for kinds that reference without owning.
    #[must_use]
    pub const fn is_reference(self) -> bool {
        matches!(
            self,
            Self::ReferenceAtomic | Self::ReferenceCollection | Self::ReferenceSequence
        )
    }

    /// Returns true for any object-valued kind.
    #[must_use]
    pub const fn is_object(self) -> bool {
        self.is_owning() || self.is_reference()
    }

    /// Returns true for atomic object kinds.
    #[must_use]
    pub const fn is_atomic_object(self) -> bool {
        matches!(self, Self::ReferenceAtomic | Self::OwningAtomic)
    }
}

/// One field of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field id.
    pub id: FieldId,
    /// Class the field belongs to.
    pub class: ClassId,
    /// Field name, unique within the class.
    pub name: String,
    /// Value kind.
    pub kind: FieldKind,
    /// For a derived back-reference field, the field whose targets it lists.
    pub virtual_source: Option<FieldId>,
}

impl FieldDef {
    /// Returns true if the field is derived rather than stored.
    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        self.virtual_source.is_some()
    }

    /// Returns true if this is the last-modified timestamp.
    #[must_use]
    pub fn is_date_modified(&self) -> bool {
        self.kind == FieldKind::Time && self.name == DATE_MODIFIED
    }
}

/// One class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Class id.
    pub id: ClassId,
    /// Class name, unique in the schema.
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldId>,
}

/// Immutable class and field table.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    classes: Vec<ClassDef>,
    class_names: HashMap<String, ClassId>,
    fields: HashMap<FieldId, FieldDef>,
    field_names: HashMap<(ClassId, String), FieldId>,
    virtual_by_source: HashMap<FieldId, Vec<FieldId>>,
}

impl Schema {
    /// Starts building a schema.
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Looks up a class.
    #[must_use]
    pub fn class(&self, id: ClassId) -> Option<&ClassDef> {
        let index = usize::try_from(id.as_u32()).ok()?.checked_sub(1)?;
        self.classes.get(index)
    }

    /// Returns a class name, or an error for an unknown class.
    pub fn class_name(&self, id: ClassId) -> CoreResult<&str> {
        self.class(id)
            .map(|c| c.name.as_str())
            .ok_or_else(|| CoreError::UnknownClass {
                name: id.to_string(),
            })
    }

    /// Looks up a class by name.
    pub fn class_by_name(&self, name: &str) -> CoreResult<ClassId> {
        self.class_names
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::UnknownClass {
                name: name.to_string(),
            })
    }

    /// Looks up a field.
    pub fn field(&self, id: FieldId) -> CoreResult<&FieldDef> {
        self.fields
            .get(&id)
            .ok_or(CoreError::UnknownField { field: id })
    }

    /// Returns the kind of a field.
    pub fn field_kind(&self, id: FieldId) -> CoreResult<FieldKind> {
        self.field(id).map(|f| f.kind)
    }

    /// Returns the name of a field.
    pub fn field_name(&self, id: FieldId) -> CoreResult<&str> {
        self.field(id).map(|f| f.name.as_str())
    }

    /// Looks up a field of a class by name.
    pub fn field_by_name(&self, class: ClassId, name: &str) -> CoreResult<FieldId> {
        self.field_names
            .get(&(class, name.to_string()))
            .copied()
            .ok_or_else(|| CoreError::UnknownFieldName {
                class: self
                    .class(class)
                    .map_or_else(|| class.to_string(), |c| c.name.clone()),
                name: name.to_string(),
            })
    }

    /// Iterates over the fields of a class in declaration order.
    pub fn fields_of(&self, class: ClassId) -> impl Iterator<Item = &FieldDef> {
        self.class(class)
            .map(|c| c.fields.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.fields.get(id))
    }

    /// Returns the `DateModified` field of a class, if it has one.
    #[must_use]
    pub fn date_modified_field(&self, class: ClassId) -> Option<FieldId> {
        self.fields_of(class)
            .find(|f| f.is_date_modified())
            .map(|f| f.id)
    }

    /// Returns true if the field is a `DateModified` field.
    #[must_use]
    pub fn is_date_modified(&self, field: FieldId) -> bool {
        self.fields.get(&field).is_some_and(FieldDef::is_date_modified)
    }

    /// Returns the derived fields that list targets of `source`.
    #[must_use]
    pub fn virtual_fields_for_source(&self, source: FieldId) -> &[FieldId] {
        self.virtual_by_source
            .get(&source)
            .map_or(&[], Vec::as_slice)
    }

    /// Returns the number of classes.
    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

/// Incremental schema construction.
///
/// Lookup mistakes are collected and reported by [`SchemaBuilder::build`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    schema: Schema,
    errors: Vec<String>,
}

impl SchemaBuilder {
    /// Declares a class and returns its id.
    pub fn class(&mut self, name: &str) -> ClassId {
        if let Some(existing) = self.schema.class_names.get(name) {
            self.errors.push(format!("duplicate class {name}"));
            return *existing;
        }
        let id = ClassId::new(u32::try_from(self.schema.classes.len() + 1).unwrap_or(u32::MAX));
        self.schema.classes.push(ClassDef {
            id,
            name: name.to_string(),
            fields: Vec::new(),
        });
        self.schema.class_names.insert(name.to_string(), id);
        id
    }

    /// Declares a stored field and returns its id.
    pub fn field(&mut self, class: ClassId, name: &str, kind: FieldKind) -> FieldId {
        self.add_field(class, name, kind, None)
    }

    /// Declares a derived back-reference collection on `class`.
    ///
    /// The field lists every object whose `source` field points at the owner
    /// of the derived field.
    pub fn virtual_field(&mut self, class: ClassId, name: &str, source: FieldId) -> FieldId {
        match self.schema.fields.get(&source) {
            Some(def) if def.kind.is_reference() && !def.is_virtual() => {}
            Some(_) => self
                .errors
                .push(format!("{name}: source {source} is not a stored reference field")),
            None => self.errors.push(format!("{name}: unknown source {source}")),
        }
        let id = self.add_field(class, name, FieldKind::ReferenceCollection, Some(source));
        self.schema
            .virtual_by_source
            .entry(source)
            .or_default()
            .push(id);
        id
    }

    fn add_field(
        &mut self,
        class: ClassId,
        name: &str,
        kind: FieldKind,
        virtual_source: Option<FieldId>,
    ) -> FieldId {
        let index = usize::try_from(class.as_u32())
            .ok()
            .and_then(|i| i.checked_sub(1));
        let Some(def) = index.and_then(|i| self.schema.classes.get_mut(i)) else {
            self.errors.push(format!("{name}: unknown {class}"));
            return FieldId::new(0);
        };
        let ordinal = u32::try_from(def.fields.len() + 1).unwrap_or(u32::MAX);
        let id = FieldId::new(class.as_u32() * 1000 + ordinal);
        def.fields.push(id);
        if self
            .schema
            .field_names
            .insert((class, name.to_string()), id)
            .is_some()
        {
            self.errors
                .push(format!("duplicate field {name} on {}", def.name));
        }
        if name == DATE_MODIFIED && kind != FieldKind::Time {
            self.errors
                .push(format!("{DATE_MODIFIED} on {} must be a time field", def.name));
        }
        self.schema.fields.insert(
            id,
            FieldDef {
                id,
                class,
                name: name.to_string(),
                kind,
                virtual_source,
            },
        );
        id
    }

    /// Finishes the schema.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSchema`] describing the first mistake made
    /// while building.
    pub fn build(self) -> CoreResult<Schema> {
        match self.errors.into_iter().next() {
            Some(message) => Err(CoreError::invalid_schema(message)),
            None => Ok(self.schema),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Schema, ClassId, FieldId, FieldId, FieldId) {
        let mut b = Schema::builder();
        let entry = b.class("LexEntry");
        let form = b.field(entry, "Form", FieldKind::String);
        let date = b.field(entry, DATE_MODIFIED, FieldKind::Time);
        let related = b.field(entry, "Related", FieldKind::ReferenceCollection);
        b.virtual_field(entry, "RelatedBy", related);
        (b.build().unwrap(), entry, form, date, related)
    }

    #[test]
    fn lookups() {
        let (schema, entry, form, date, related) = sample();
        assert_eq!(schema.class_by_name("LexEntry").unwrap(), entry);
        assert_eq!(schema.field_by_name(entry, "Form").unwrap(), form);
        assert_eq!(schema.field_name(form).unwrap(), "Form");
        assert_eq!(schema.field_kind(related).unwrap(), FieldKind::ReferenceCollection);
        assert_eq!(schema.date_modified_field(entry), Some(date));
        assert!(schema.is_date_modified(date));
        assert_eq!(schema.fields_of(entry).count(), 4);
        assert_eq!(schema.virtual_fields_for_source(related).len(), 1);
        assert!(schema.virtual_fields_for_source(form).is_empty());
    }

    #[test]
    fn field_ids_are_class_scoped() {
        let (_, entry, form, _, _) = sample();
        assert_eq!(form.as_u32(), entry.as_u32() * 1000 + 1);
    }

    #[test]
    fn unknown_names() {
        let (schema, entry, ..) = sample();
        assert!(matches!(
            schema.class_by_name("Nope"),
            Err(CoreError::UnknownClass { .. })
        ));
        assert!(matches!(
            schema.field_by_name(entry, "Nope"),
            Err(CoreError::UnknownFieldName { .. })
        ));
        assert!(matches!(
            schema.field(FieldId::new(99)),
            Err(CoreError::UnknownField { .. })
        ));
    }

    #[test]
    fn builder_rejects_mistakes() {
        let mut b = Schema::builder();
        let c = b.class("A");
        b.field(c, "X", FieldKind::Integer);
        b.field(c, "X", FieldKind::Integer);
        assert!(matches!(b.build(), Err(CoreError::InvalidSchema { .. })));

        let mut b = Schema::builder();
        let c = b.class("A");
        let s = b.field(c, "S", FieldKind::String);
        b.virtual_field(c, "V", s);
        assert!(b.build().is_err());

        let mut b = Schema::builder();
        let c = b.class("A");
        b.field(c, DATE_MODIFIED, FieldKind::Integer);
        assert!(b.build().is_err());
    }

    #[test]
    fn field_kind_predicates() {
        assert!(FieldKind::OwningSequence.is_vector());
        assert!(FieldKind::OwningSequence.is_owning());
        assert!(!FieldKind::OwningSequence.is_reference());
        assert!(FieldKind::ReferenceAtomic.is_atomic_object());
        assert!(FieldKind::ReferenceAtomic.is_object());
        assert!(!FieldKind::MultiString.is_object());
    }
}
