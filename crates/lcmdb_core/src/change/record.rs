//! Typed reversible mutations.

use super::notify::{vector_delta, ChangeNotification};
use crate::error::{CoreError, CoreResult};
use crate::repository::ObjectRepository;
use crate::schema::{FieldDef, FieldKind};
use crate::types::{ClassId, Direction, FieldId, Timestamp, WritingSystem};
use crate::value::FieldValue;
use lcmdb_codec::{ObjectId, Snapshot};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Identity of the slot a field record writes.
///
/// Two records with the same key inside one unit of work coalesce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeKey {
    /// Changed object.
    pub object: ObjectId,
    /// Changed field.
    pub field: FieldId,
    /// Writing system, for multi-string records.
    pub ws: Option<WritingSystem>,
}

/// One field going from `old` to `new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange<T> {
    /// Changed object.
    pub object: ObjectId,
    /// Changed field.
    pub field: FieldId,
    /// Value before the change.
    pub old: T,
    /// Value after the change.
    pub new: T,
}

impl<T> FieldChange<T> {
    /// Creates a field change.
    pub const fn new(object: ObjectId, field: FieldId, old: T, new: T) -> Self {
        Self {
            object,
            field,
            old,
            new,
        }
    }

    /// Returns the value written when applying in `direction`.
    pub const fn target(&self, direction: Direction) -> &T {
        match direction {
            Direction::Forward => &self.new,
            Direction::Backward => &self.old,
        }
    }

    /// Returns the value replaced when applying in `direction`.
    pub const fn source(&self, direction: Direction) -> &T {
        match direction {
            Direction::Forward => &self.old,
            Direction::Backward => &self.new,
        }
    }
}

/// One writing system alternative of a multi-string field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiStringChange {
    /// Changed object.
    pub object: ObjectId,
    /// Changed field.
    pub field: FieldId,
    /// Writing system.
    pub ws: WritingSystem,
    /// Alternative before the change.
    pub old: Option<String>,
    /// Alternative after the change.
    pub new: Option<String>,
}

/// A derived field whose content changed as a side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualChange {
    /// Object owning the derived field.
    pub object: ObjectId,
    /// The derived field.
    pub field: FieldId,
}

/// Creation or deletion of a whole object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLifecycle {
    /// The object.
    pub object: ObjectId,
    /// Its class.
    pub class: ClassId,
    /// Full state of the object while it exists.
    ///
    /// A deletion captures it when recorded; a creation captures it the
    /// first time it is undone.
    pub snapshot: Option<Snapshot>,
}

/// One typed mutation of one field of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeRecord {
    /// Boolean field.
    Boolean(FieldChange<bool>),
    /// Integer field.
    Integer(FieldChange<i64>),
    /// Time field.
    Time(FieldChange<Timestamp>),
    /// GUID data field.
    Guid(FieldChange<Option<Uuid>>),
    /// Binary field.
    Binary(FieldChange<Vec<u8>>),
    /// String field.
    String(FieldChange<String>),
    /// One alternative of a multi-string field.
    MultiString(MultiStringChange),
    /// Atomic reference.
    ReferenceAtomic(FieldChange<Option<ObjectId>>),
    /// Atomic ownership.
    OwningAtomic(FieldChange<Option<ObjectId>>),
    /// Reference collection or sequence.
    ReferenceVector(FieldChange<Vec<ObjectId>>),
    /// Owning collection or sequence.
    OwningVector(FieldChange<Vec<ObjectId>>),
    /// Derived field side effect. Never a data change.
    Virtual(VirtualChange),
    /// Object creation.
    Created(ObjectLifecycle),
    /// Object deletion.
    Deleted(ObjectLifecycle),
}

/// Matches every plain field variant with `$c` bound to the change, followed
/// by the caller's remaining arms.
macro_rules! with_field_change {
    ($record:expr, $c:ident => $body:expr, $($rest:tt)*) => {
        match $record {
            ChangeRecord::Boolean($c) => $body,
            ChangeRecord::Integer($c) => $body,
            ChangeRecord::Time($c) => $body,
            ChangeRecord::Guid($c) => $body,
            ChangeRecord::Binary($c) => $body,
            ChangeRecord::String($c) => $body,
            ChangeRecord::ReferenceAtomic($c) => $body,
            ChangeRecord::OwningAtomic($c) => $body,
            ChangeRecord::ReferenceVector($c) => $body,
            ChangeRecord::OwningVector($c) => $body,
            $($rest)*
        }
    };
}

impl ChangeRecord {
    /// Builds the records describing `def` on `object` going from `old` to `new`.
    ///
    /// Multi-string fields yield one record per changed writing system; every
    /// other kind yields exactly one record.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::FieldKindMismatch`] if either value does not fit
    /// the field.
    pub fn from_field_values(
        def: &FieldDef,
        object: ObjectId,
        old: FieldValue,
        new: FieldValue,
    ) -> CoreResult<Vec<Self>> {
        let field = def.id;
        let record = match (def.kind, old, new) {
            (FieldKind::Boolean, FieldValue::Boolean(o), FieldValue::Boolean(n)) => {
                Self::Boolean(FieldChange::new(object, field, o, n))
            }
            (FieldKind::Integer, FieldValue::Integer(o), FieldValue::Integer(n)) => {
                Self::Integer(FieldChange::new(object, field, o, n))
            }
            (FieldKind::Time, FieldValue::Time(o), FieldValue::Time(n)) => {
                Self::Time(FieldChange::new(object, field, o, n))
            }
            (FieldKind::Guid, FieldValue::Guid(o), FieldValue::Guid(n)) => {
                Self::Guid(FieldChange::new(object, field, o, n))
            }
            (FieldKind::Binary, FieldValue::Binary(o), FieldValue::Binary(n)) => {
                Self::Binary(FieldChange::new(object, field, o, n))
            }
            (FieldKind::String, FieldValue::String(o), FieldValue::String(n)) => {
                Self::String(FieldChange::new(object, field, o, n))
            }
            (FieldKind::MultiString, FieldValue::MultiString(o), FieldValue::MultiString(n)) => {
                let systems: BTreeSet<WritingSystem> = o.keys().chain(n.keys()).copied().collect();
                return Ok(systems
                    .into_iter()
                    .filter(|ws| o.get(ws) != n.get(ws))
                    .map(|ws| {
                        Self::MultiString(MultiStringChange {
                            object,
                            field,
                            ws,
                            old: o.get(&ws).cloned(),
                            new: n.get(&ws).cloned(),
                        })
                    })
                    .collect());
            }
            (FieldKind::ReferenceAtomic, FieldValue::Atomic(o), FieldValue::Atomic(n)) => {
                Self::ReferenceAtomic(FieldChange::new(object, field, o, n))
            }
            (FieldKind::OwningAtomic, FieldValue::Atomic(o), FieldValue::Atomic(n)) => {
                Self::OwningAtomic(FieldChange::new(object, field, o, n))
            }
            (kind, FieldValue::Vector(o), FieldValue::Vector(n)) if kind.is_vector() => {
                if kind.is_owning() {
                    Self::OwningVector(FieldChange::new(object, field, o, n))
                } else {
                    Self::ReferenceVector(FieldChange::new(object, field, o, n))
                }
            }
            (kind, o, n) => {
                return Err(CoreError::kind_mismatch(
                    field,
                    format!("{o:?} -> {n:?} for a {kind:?} field"),
                ))
            }
        };
        Ok(vec![record])
    }

    /// Derived-field records for resident objects that gain or lose a
    /// link when `source` goes from `old` to `new`.
    #[must_use]
    pub fn back_reference_changes(
        repo: &dyn ObjectRepository,
        source: FieldId,
        old: &FieldValue,
        new: &FieldValue,
    ) -> Vec<Self> {
        let schema = repo.schema();
        let derived = schema.virtual_fields_for_source(source);
        if derived.is_empty() {
            return Vec::new();
        }
        let (old, new) = (old.object_ids(), new.object_ids());
        let changed: BTreeSet<ObjectId> = old
            .iter()
            .filter(|id| !new.contains(id))
            .chain(new.iter().filter(|id| !old.contains(id)))
            .copied()
            .collect();

        let mut records = Vec::new();
        for target in changed {
            let Some(class) = repo.get_object(target).map(|o| o.class()) else {
                continue;
            };
            for &field in derived {
                if schema.field(field).is_ok_and(|def| def.class == class) {
                    records.push(Self::Virtual(VirtualChange {
                        object: target,
                        field,
                    }));
                }
            }
        }
        records
    }

    /// Returns the object the record changes.
    #[must_use]
    pub fn object(&self) -> ObjectId {
        with_field_change!(self, c => c.object,
            Self::MultiString(c) => c.object,
            Self::Virtual(c) => c.object,
            Self::Created(c) | Self::Deleted(c) => c.object,
        )
    }

    /// Returns the field the record changes, if it changes one.
    #[must_use]
    pub fn field(&self) -> Option<FieldId> {
        with_field_change!(self, c => Some(c.field),
            Self::MultiString(c) => Some(c.field),
            Self::Virtual(c) => Some(c.field),
            Self::Created(_) | Self::Deleted(_) => None,
        )
    }

    /// Returns the coalescing key of a field record.
    ///
    /// Lifecycle records have no key and never coalesce.
    #[must_use]
    pub fn key(&self) -> Option<ChangeKey> {
        match self {
            Self::MultiString(c) => Some(ChangeKey {
                object: c.object,
                field: c.field,
                ws: Some(c.ws),
            }),
            Self::Created(_) | Self::Deleted(_) => None,
            _ => self.field().map(|field| ChangeKey {
                object: self.object(),
                field,
                ws: None,
            }),
        }
    }

    /// Returns false for derived-field records.
    #[must_use]
    pub fn is_data_change(&self) -> bool {
        !matches!(self, Self::Virtual(_))
    }

    /// Returns true if applying the record changes nothing.
    #[must_use]
    pub fn is_no_op(&self) -> bool {
        with_field_change!(self, c => c.old == c.new,
            Self::MultiString(c) => c.old == c.new,
            Self::Virtual(_) | Self::Created(_) | Self::Deleted(_) => false,
        )
    }

    /// Returns true for creation and deletion records.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(self, Self::Created(_) | Self::Deleted(_))
    }

    /// Folds a later record for the same slot into this one.
    ///
    /// The old value stays; the new value is taken from `later`. Returns
    /// false, leaving `self` untouched, if the records are not for the same
    /// slot.
    pub fn coalesce(&mut self, later: &Self) -> bool {
        if self.key().is_none() || self.key() != later.key() {
            return false;
        }
        match (self, later) {
            (Self::Boolean(a), Self::Boolean(b)) => a.new = b.new,
            (Self::Integer(a), Self::Integer(b)) => a.new = b.new,
            (Self::Time(a), Self::Time(b)) => a.new = b.new,
            (Self::Guid(a), Self::Guid(b)) => a.new = b.new,
            (Self::Binary(a), Self::Binary(b)) => a.new.clone_from(&b.new),
            (Self::String(a), Self::String(b)) => a.new.clone_from(&b.new),
            (Self::MultiString(a), Self::MultiString(b)) => a.new.clone_from(&b.new),
            (Self::ReferenceAtomic(a), Self::ReferenceAtomic(b))
            | (Self::OwningAtomic(a), Self::OwningAtomic(b)) => a.new = b.new,
            (Self::ReferenceVector(a), Self::ReferenceVector(b))
            | (Self::OwningVector(a), Self::OwningVector(b)) => a.new.clone_from(&b.new),
            (Self::Virtual(_), Self::Virtual(_)) => {}
            _ => return false,
        }
        true
    }

    /// Every object the record mentions: the changed object and every
    /// object linked from either value.
    #[must_use]
    pub fn mentioned_objects(&self) -> Vec<ObjectId> {
        let mut ids = vec![self.object()];
        match self {
            Self::ReferenceAtomic(c) | Self::OwningAtomic(c) => {
                ids.extend(c.old.iter().chain(c.new.iter()).copied());
            }
            Self::ReferenceVector(c) | Self::OwningVector(c) => {
                ids.extend(c.old.iter().chain(c.new.iter()).copied());
            }
            _ => {}
        }
        ids
    }

    /// Objects linked from the value written when applying in `direction`.
    #[must_use]
    pub fn linked_objects(&self, direction: Direction) -> Vec<ObjectId> {
        match self {
            Self::ReferenceAtomic(c) | Self::OwningAtomic(c) => {
                c.target(direction).iter().copied().collect()
            }
            Self::ReferenceVector(c) | Self::OwningVector(c) => c.target(direction).clone(),
            _ => Vec::new(),
        }
    }

    /// Runs the part of the record that must precede every other record of
    /// its unit: restoring the bare identity of an object about to come back.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository refuses the registration.
    pub fn first_pass(&self, repo: &mut dyn ObjectRepository, direction: Direction) -> CoreResult<()> {
        match (self, direction) {
            (Self::Created(c), Direction::Forward) | (Self::Deleted(c), Direction::Backward) => {
                if !repo.has_object(c.object) {
                    repo.register_created(c.object, c.class, None)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Applies the record: forward writes new values, backward writes old ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the repository refuses a value.
    pub fn apply(&mut self, repo: &mut dyn ObjectRepository, direction: Direction) -> CoreResult<()> {
        match self {
            Self::Boolean(c) => set(repo, c, direction, |v| FieldValue::Boolean(*v)),
            Self::Integer(c) => set(repo, c, direction, |v| FieldValue::Integer(*v)),
            Self::Time(c) => set(repo, c, direction, |v| FieldValue::Time(*v)),
            Self::Guid(c) => set(repo, c, direction, |v| FieldValue::Guid(*v)),
            Self::Binary(c) => set(repo, c, direction, |v| FieldValue::Binary(v.clone())),
            Self::String(c) => set(repo, c, direction, |v| FieldValue::String(v.clone())),
            Self::ReferenceAtomic(c) | Self::OwningAtomic(c) => {
                set(repo, c, direction, |v| FieldValue::Atomic(*v))
            }
            Self::ReferenceVector(c) | Self::OwningVector(c) => {
                set(repo, c, direction, |v| FieldValue::Vector(v.clone()))
            }
            Self::MultiString(c) => {
                let FieldValue::MultiString(mut alternatives) = repo.field(c.object, c.field)? else {
                    return Err(CoreError::kind_mismatch(c.field, "not a multi-string field"));
                };
                let value = match direction {
                    Direction::Forward => &c.new,
                    Direction::Backward => &c.old,
                };
                match value {
                    Some(text) => alternatives.insert(c.ws, text.clone()),
                    None => alternatives.remove(&c.ws),
                };
                repo.set_field(c.object, c.field, FieldValue::MultiString(alternatives))
            }
            Self::Virtual(_) => Ok(()),
            Self::Created(c) => match direction {
                Direction::Forward => {
                    if let Some(snapshot) = &c.snapshot {
                        repo.materialize_from_snapshot(snapshot)?;
                    }
                    Ok(())
                }
                Direction::Backward => {
                    c.snapshot = Some(repo.snapshot_of(c.object)?);
                    repo.unregister(c.object).map(|_| ())
                }
            },
            Self::Deleted(c) => match direction {
                Direction::Forward => {
                    if repo.has_object(c.object) {
                        repo.unregister(c.object)?;
                    }
                    Ok(())
                }
                Direction::Backward => {
                    let snapshot = c.snapshot.as_ref().ok_or_else(|| {
                        CoreError::invalid_operation(format!(
                            "deletion of {} carries no snapshot",
                            c.object
                        ))
                    })?;
                    repo.materialize_from_snapshot(snapshot).map(|_| ())
                }
            },
        }
    }

    /// Returns the notification for applying the record in `direction`.
    ///
    /// Lifecycle records and no-ops report nothing. Derived fields report
    /// their whole current size as inserted.
    #[must_use]
    pub fn notification(
        &self,
        direction: Direction,
        repo: &dyn ObjectRepository,
    ) -> Option<ChangeNotification> {
        if self.is_no_op() || self.is_lifecycle() {
            return None;
        }
        let object = self.object();
        let field = self.field()?;
        let (index, inserted, deleted) = match self {
            Self::String(c) => (
                0,
                c.target(direction).chars().count(),
                c.source(direction).chars().count(),
            ),
            Self::MultiString(c) => (usize::try_from(c.ws.0).unwrap_or(usize::MAX), 0, 0),
            Self::ReferenceAtomic(c) | Self::OwningAtomic(c) => (
                0,
                usize::from(c.target(direction).is_some()),
                usize::from(c.source(direction).is_some()),
            ),
            Self::ReferenceVector(c) | Self::OwningVector(c) => {
                vector_delta(c.source(direction), c.target(direction))
            }
            Self::Virtual(_) => {
                let size = repo.field(object, field).ok()?.object_ids().len();
                (0, size, 0)
            }
            _ => (0, 0, 0),
        };
        Some(ChangeNotification::new(object, field, index, inserted, deleted))
    }

    /// Returns the whole field value written when applying in `direction`.
    ///
    /// Multi-string, derived and lifecycle records carry no whole value.
    #[must_use]
    pub fn value(&self, direction: Direction) -> Option<FieldValue> {
        let value = match self {
            Self::Boolean(c) => FieldValue::Boolean(*c.target(direction)),
            Self::Integer(c) => FieldValue::Integer(*c.target(direction)),
            Self::Time(c) => FieldValue::Time(*c.target(direction)),
            Self::Guid(c) => FieldValue::Guid(*c.target(direction)),
            Self::Binary(c) => FieldValue::Binary(c.target(direction).clone()),
            Self::String(c) => FieldValue::String(c.target(direction).clone()),
            Self::ReferenceAtomic(c) | Self::OwningAtomic(c) => FieldValue::Atomic(*c.target(direction)),
            Self::ReferenceVector(c) | Self::OwningVector(c) => {
                FieldValue::Vector(c.target(direction).clone())
            }
            Self::MultiString(_) | Self::Virtual(_) | Self::Created(_) | Self::Deleted(_) => {
                return None
            }
        };
        Some(value)
    }

    /// Returns the record with old and new values swapped.
    ///
    /// Lifecycle records turn into each other.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let mut record = self.clone();
        match &mut record {
            Self::Boolean(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::Integer(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::Time(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::Guid(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::Binary(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::String(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::MultiString(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::ReferenceAtomic(c) | Self::OwningAtomic(c) => std::mem::swap(&mut c.old, &mut c.new),
            Self::ReferenceVector(c) | Self::OwningVector(c) => {
                std::mem::swap(&mut c.old, &mut c.new);
            }
            Self::Virtual(_) => {}
            Self::Created(c) => return Self::Deleted(c.clone()),
            Self::Deleted(c) => return Self::Created(c.clone()),
        }
        record
    }

    /// Returns the vector change if this is a collection record.
    pub fn as_vector_mut(&mut self) -> Option<&mut FieldChange<Vec<ObjectId>>> {
        match self {
            Self::ReferenceVector(c) | Self::OwningVector(c) => Some(c),
            _ => None,
        }
    }

    /// Returns the time change if this is a time record.
    pub fn as_time_mut(&mut self) -> Option<&mut FieldChange<Timestamp>> {
        match self {
            Self::Time(c) => Some(c),
            _ => None,
        }
    }
}

fn set<T>(
    repo: &mut dyn ObjectRepository,
    change: &FieldChange<T>,
    direction: Direction,
    wrap: impl Fn(&T) -> FieldValue,
) -> CoreResult<()> {
    repo.set_field(change.object, change.field, wrap(change.target(direction)))
}
