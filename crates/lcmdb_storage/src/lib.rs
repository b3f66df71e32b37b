//! # LCMDB Storage
//!
//! The backing-store contract used by the LCMDB transaction core, plus an
//! in-memory store that several clients can share.
//!
//! The core never interprets the physical format of a store. It needs four
//! things from it:
//!
//! - commit a batch of created, modified and deleted objects
//! - report what other clients committed since the last change it saw
//! - hand out a version stamp and answer whether objects of a class were
//!   created since that stamp
//! - load every object at session start
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - one client's connection to a shared [`StoreHub`]
//!
//! ## Example
//!
//! ```rust
//! use lcmdb_codec::{ObjectId, Snapshot};
//! use lcmdb_storage::{BackingStore, CommitBatch, StoreHub};
//!
//! let hub = StoreHub::new();
//! let alice = hub.connect();
//! let bob = hub.connect();
//!
//! let mut batch = CommitBatch::default();
//! batch.created.push(Snapshot::new(ObjectId::new(), "LexEntry"));
//! assert!(alice.commit(&batch).unwrap());
//!
//! let foreign = bob.unseen_foreign_changes().unwrap();
//! assert_eq!(foreign.created.len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use memory::{InMemoryStore, StoreHub};
pub use store::{BackingStore, CommitBatch, CommitCursor, ForeignChanges, VersionStamp};
