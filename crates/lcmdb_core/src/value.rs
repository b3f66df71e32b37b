//! Field values.

use crate::error::{CoreError, CoreResult};
use crate::schema::{FieldDef, FieldKind};
use crate::types::{Timestamp, WritingSystem};
use lcmdb_codec::{ObjectId, ScalarValue, SnapshotField, SnapshotRef};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The value of one field of a resident object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Boolean field.
    Boolean(bool),
    /// Integer field.
    Integer(i64),
    /// Timestamp field.
    Time(Timestamp),
    /// GUID data field.
    Guid(Option<Uuid>),
    /// Binary field.
    Binary(Vec<u8>),
    /// String field.
    String(String),
    /// Multi-string field.
    MultiString(BTreeMap<WritingSystem, String>),
    /// Atomic reference or owning field.
    Atomic(Option<ObjectId>),
    /// Collection or sequence field.
    Vector(Vec<ObjectId>),
}

impl FieldValue {
    /// Returns the value an unset field of `kind` reads as.
    #[must_use]
    pub fn default_for(kind: FieldKind) -> Self {
        match kind {
            FieldKind::Boolean => Self::Boolean(false),
            FieldKind::Integer => Self::Integer(0),
            FieldKind::Time => Self::Time(Timestamp::default()),
            FieldKind::Guid => Self::Guid(None),
            FieldKind::Binary => Self::Binary(Vec::new()),
            FieldKind::String => Self::String(String::new()),
            FieldKind::MultiString => Self::MultiString(BTreeMap::new()),
            FieldKind::ReferenceAtomic | FieldKind::OwningAtomic => Self::Atomic(None),
            FieldKind::ReferenceCollection
            | FieldKind::ReferenceSequence
            | FieldKind::OwningCollection
            | FieldKind::OwningSequence => Self::Vector(Vec::new()),
        }
    }

    /// Returns true if the value can be stored in a field of `kind`.
    #[must_use]
    pub fn matches_kind(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Self::Boolean(_), FieldKind::Boolean)
                | (Self::Integer(_), FieldKind::Integer)
                | (Self::Time(_), FieldKind::Time)
                | (Self::Guid(_), FieldKind::Guid)
                | (Self::Binary(_), FieldKind::Binary)
                | (Self::String(_), FieldKind::String)
                | (Self::MultiString(_), FieldKind::MultiString)
                | (
                    Self::Atomic(_),
                    FieldKind::ReferenceAtomic | FieldKind::OwningAtomic
                )
                | (
                    Self::Vector(_),
                    FieldKind::ReferenceCollection
                        | FieldKind::ReferenceSequence
                        | FieldKind::OwningCollection
                        | FieldKind::OwningSequence
                )
        )
    }

    /// Returns the objects this value points at.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        match self {
            Self::Atomic(id) => id.iter().copied().collect(),
            Self::Vector(ids) => ids.clone(),
            _ => Vec::new(),
        }
    }

    /// Returns true if the value points at `id`.
    #[must_use]
    pub fn contains_object(&self, id: ObjectId) -> bool {
        match self {
            Self::Atomic(target) => *target == Some(id),
            Self::Vector(ids) => ids.contains(&id),
            _ => false,
        }
    }

    /// Returns a copy with every link to `id` removed.
    #[must_use]
    pub fn without_object(&self, id: ObjectId) -> Self {
        match self {
            Self::Atomic(Some(target)) if *target == id => Self::Atomic(None),
            Self::Vector(ids) => Self::Vector(ids.iter().copied().filter(|t| *t != id).collect()),
            other => other.clone(),
        }
    }

    /// Converts the value to its snapshot form.
    #[must_use]
    pub fn to_snapshot_field(&self, kind: FieldKind) -> SnapshotField {
        let link = |id: ObjectId| {
            if kind.is_reference() {
                SnapshotRef::reference(id)
            } else {
                SnapshotRef::owning(id)
            }
        };
        match self {
            Self::Boolean(v) => SnapshotField::Scalar(ScalarValue::Boolean(*v)),
            Self::Integer(v) => SnapshotField::Scalar(ScalarValue::Integer(*v)),
            Self::Time(t) => SnapshotField::Scalar(ScalarValue::Time(t.as_millis())),
            Self::Guid(Some(g)) => SnapshotField::Scalar(ScalarValue::Guid(*g)),
            Self::Guid(None) => SnapshotField::Scalar(ScalarValue::Null),
            Self::Binary(b) => SnapshotField::Scalar(ScalarValue::Binary(b.clone())),
            Self::String(s) => SnapshotField::Scalar(ScalarValue::Text(s.clone())),
            Self::MultiString(m) => SnapshotField::Scalar(ScalarValue::MultiText(
                m.iter().map(|(ws, s)| (ws.0, s.clone())).collect(),
            )),
            Self::Atomic(id) => SnapshotField::Objects(id.iter().copied().map(link).collect()),
            Self::Vector(ids) => SnapshotField::Objects(ids.iter().copied().map(link).collect()),
        }
    }

    /// Reads a value of field `def` from its snapshot form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FieldKindMismatch`] if the snapshot value does not
    /// fit the field.
    pub fn from_snapshot_field(def: &FieldDef, field: &SnapshotField) -> CoreResult<Self> {
        let mismatch = || CoreError::kind_mismatch(def.id, format!("snapshot value {field:?}"));
        let value = match (def.kind, field) {
            (FieldKind::Boolean, SnapshotField::Scalar(ScalarValue::Boolean(v))) => {
                Self::Boolean(*v)
            }
            (FieldKind::Integer, SnapshotField::Scalar(ScalarValue::Integer(v))) => {
                Self::Integer(*v)
            }
            (FieldKind::Time, SnapshotField::Scalar(ScalarValue::Time(t))) => {
                Self::Time(Timestamp::from_millis(*t))
            }
            (FieldKind::Guid, SnapshotField::Scalar(ScalarValue::Guid(g))) => Self::Guid(Some(*g)),
            (FieldKind::Guid, SnapshotField::Scalar(ScalarValue::Null)) => Self::Guid(None),
            (FieldKind::Binary, SnapshotField::Scalar(ScalarValue::Binary(b))) => {
                Self::Binary(b.clone())
            }
            (FieldKind::String, SnapshotField::Scalar(ScalarValue::Text(s))) => {
                Self::String(s.clone())
            }
            (FieldKind::String, SnapshotField::Scalar(ScalarValue::Null)) => {
                Self::String(String::new())
            }
            (FieldKind::MultiString, SnapshotField::Scalar(ScalarValue::MultiText(m))) => {
                Self::MultiString(
                    m.iter()
                        .map(|(ws, s)| (WritingSystem(*ws), s.clone()))
                        .collect(),
                )
            }
            (kind, SnapshotField::Objects(refs)) if kind.is_object() => {
                if refs.iter().any(|r| r.reference != kind.is_reference()) {
                    return Err(mismatch());
                }
                let ids: Vec<ObjectId> = refs.iter().map(|r| r.guid).collect();
                if kind.is_atomic_object() {
                    if ids.len() > 1 {
                        return Err(mismatch());
                    }
                    Self::Atomic(ids.first().copied())
                } else {
                    Self::Vector(ids)
                }
            }
            _ => return Err(mismatch()),
        };
        Ok(value)
    }
}
