//! Snapshot wire record.

use crate::error::{CodecError, CodecResult};
use crate::id::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A scalar field value as it appears in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Absent value (empty string, unset guid).
    Null,
    /// Boolean value.
    Boolean(bool),
    /// Signed integer.
    Integer(i64),
    /// Timestamp in milliseconds since the Unix epoch.
    Time(i64),
    /// A GUID that is data, not an object reference.
    Guid(Uuid),
    /// Opaque binary blob.
    Binary(Vec<u8>),
    /// Plain text.
    Text(String),
    /// Text per writing system.
    MultiText(BTreeMap<u32, String>),
}

/// One entry of an object-valued field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRef {
    /// Target object.
    pub guid: ObjectId,
    /// `true` for a plain reference, `false` for an ownership link.
    pub reference: bool,
}

impl SnapshotRef {
    /// A plain (non-owning) reference.
    #[must_use]
    pub const fn reference(guid: ObjectId) -> Self {
        Self {
            guid,
            reference: true,
        }
    }

    /// An ownership link.
    #[must_use]
    pub const fn owning(guid: ObjectId) -> Self {
        Self {
            guid,
            reference: false,
        }
    }
}

/// The value of one field in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotField {
    /// A scalar value.
    Scalar(ScalarValue),
    /// An ordered list of object links. Atomic fields hold zero or one entry.
    Objects(Vec<SnapshotRef>),
}

impl SnapshotField {
    /// Returns the object links of this field (empty for scalars).
    #[must_use]
    pub fn objects(&self) -> &[SnapshotRef] {
        match self {
            Self::Objects(refs) => refs,
            Self::Scalar(_) => &[],
        }
    }
}

/// Serialized stand-in for one domain object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Object GUID.
    pub guid: ObjectId,
    /// Class name.
    pub class: String,
    /// Owning object, if the object is owned.
    pub owner: Option<ObjectId>,
    /// Name of the owner's field that holds this object.
    pub owning_field: Option<String>,
    /// Field values keyed by field name.
    pub fields: BTreeMap<String, SnapshotField>,
}

impl Snapshot {
    /// Creates an empty snapshot for an unowned object.
    pub fn new(guid: ObjectId, class: impl Into<String>) -> Self {
        Self {
            guid,
            class: class.into(),
            owner: None,
            owning_field: None,
            fields: BTreeMap::new(),
        }
    }

    /// Sets the owner of the object.
    #[must_use]
    pub fn with_owner(mut self, owner: ObjectId, owning_field: impl Into<String>) -> Self {
        self.owner = Some(owner);
        self.owning_field = Some(owning_field.into());
        self
    }

    /// Adds a field value.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: SnapshotField) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Returns a field value by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&SnapshotField> {
        self.fields.get(name)
    }

    /// Iterates over every object link held by this snapshot.
    pub fn links(&self) -> impl Iterator<Item = &SnapshotRef> {
        self.fields.values().flat_map(SnapshotField::objects)
    }

    /// Iterates over the targets of plain (non-owning) references.
    pub fn reference_targets(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.links().filter(|r| r.reference).map(|r| r.guid)
    }

    /// Iterates over the objects owned by this snapshot.
    pub fn owned_objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.links().filter(|r| !r.reference).map(|r| r.guid)
    }

    /// Encodes the snapshot to CBOR bytes.
    ///
    /// Fields are stored in a sorted map, so the encoding is deterministic.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|e| CodecError::encoding_failed(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes a snapshot from CBOR bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::CorruptSnapshot`] carrying the raw bytes if they do
    /// not decode, and [`CodecError::InvalidStructure`] if the snapshot owns
    /// itself or names an owner without an owning field.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let snapshot: Self = ciborium::de::from_reader(bytes)
            .map_err(|e| CodecError::corrupt_snapshot(bytes, e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    fn validate(&self) -> CodecResult<()> {
        if self.class.is_empty() {
            return Err(CodecError::invalid_structure(format!(
                "snapshot {} has no class",
                self.guid
            )));
        }
        if self.owner.is_some() != self.owning_field.is_some() {
            return Err(CodecError::invalid_structure(format!(
                "snapshot {} has an owner without an owning field",
                self.guid
            )));
        }
        if self.owner == Some(self.guid) || self.links().any(|r| !r.reference && r.guid == self.guid)
        {
            return Err(CodecError::invalid_structure(format!(
                "snapshot {} owns itself",
                self.guid
            )));
        }
        Ok(())
    }
}
