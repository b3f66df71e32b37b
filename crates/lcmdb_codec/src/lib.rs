//! # LCMDB Codec
//!
//! Object identifiers and the snapshot wire record for LCMDB.
//!
//! A [`Snapshot`] is the serialized stand-in for one domain object. It is what
//! backing stores persist, what lazy materialization reads, and what the
//! foreign-change reconciler diffs. Only a handful of things are exposed:
//!
//! - the object GUID, its class name and its owner (if any)
//! - per field, either a scalar value or an ordered list of object references,
//!   each flagged as a plain reference or an ownership link
//!
//! Snapshots encode to deterministic CBOR: fields are kept in a sorted map, so
//! identical snapshots always produce identical bytes.
//!
//! ## Usage
//!
//! ```
//! use lcmdb_codec::{ObjectId, ScalarValue, Snapshot, SnapshotField};
//!
//! let id = ObjectId::new();
//! let snapshot = Snapshot::new(id, "LexEntry")
//!     .with_field("HomographNumber", SnapshotField::Scalar(ScalarValue::Integer(2)));
//!
//! let bytes = snapshot.encode().unwrap();
//! let decoded = Snapshot::decode(&bytes).unwrap();
//! assert_eq!(decoded, snapshot);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod id;
mod snapshot;

pub use error::{CodecError, CodecResult};
pub use id::ObjectId;
pub use snapshot::{ScalarValue, Snapshot, SnapshotField, SnapshotRef};
