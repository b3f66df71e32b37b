//! # LCMDB Core
//!
//! Units of work, multi-stack undo and redo, and reconciliation of changes
//! committed by other clients of a shared store.
//!
//! This crate provides:
//! - a schema of classes and typed fields, including derived back-reference
//!   fields
//! - an object repository holding the resident object graph
//! - change records that know how to undo and redo themselves
//! - undo stacks that share one sequence counter, with marks and save
//!   tracking
//! - a foreign-change reconciler with conflict detection and three-way
//!   collection merge
//! - a transaction service tying these to a backing store, with retry,
//!   background commit and autosave
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use lcmdb_core::{Config, FieldKind, Schema, TransactionService};
//! use lcmdb_storage::StoreHub;
//!
//! let mut builder = Schema::builder();
//! let entry = builder.class("LexEntry");
//! let form = builder.field(entry, "Form", FieldKind::String);
//! let schema = Arc::new(builder.build().unwrap());
//!
//! let hub = StoreHub::new();
//! let mut service =
//!     TransactionService::open(schema, Arc::new(hub.connect()), Config::default()).unwrap();
//!
//! service.begin_undo_task("Undo create", "Redo create").unwrap();
//! let id = service.create_object(entry, None).unwrap();
//! service.set_string(id, form, "kitabu").unwrap();
//! service.end_undo_task().unwrap();
//!
//! service.undo().unwrap();
//! assert!(!service.has_object(id));
//! service.redo().unwrap();
//! assert!(service.has_object(id));
//!
//! service.save().unwrap();
//! assert_eq!(hub.object_count(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod change_feed;
mod clock;
mod commit_worker;
mod config;
mod error;
mod reconcile;
mod repository;
mod retry;
mod schema;
mod transaction;
mod types;
mod undo;
mod unit_of_work;
mod value;

pub use change::{
    vector_delta, ChangeKey, ChangeNotification, ChangeObserver, ChangeRecord, FieldChange,
    MultiStringChange, ObjectLifecycle, VirtualChange,
};
pub use change_feed::{ChangeEvent, ChangeFeed};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit_worker::CommitWorker;
pub use config::{AutosaveConfig, Config, RetryConfig};
pub use error::{CoreError, CoreResult};
pub use reconcile::{
    dedupe, merge_timestamp, rebase, three_way, ChangeReconciler, CollectionMerge, Conflict,
    ConflictReport, LocalChanges, TimestampMerge,
};
pub use repository::{DomainObject, InMemoryRepository, ObjectRepository};
pub use retry::{ConnectionLossHandler, GiveUp, RetryPolicy};
pub use schema::{ClassDef, FieldDef, FieldKind, Schema, SchemaBuilder, DATE_MODIFIED};
pub use transaction::{
    AutosaveDecision, GraphReader, SaveOutcome, SaveSummary, ServiceBuilder, SkipReason,
    TransactionService,
};
pub use types::{
    ClassId, Direction, FieldId, Handle, MarkHandle, SequenceNumber, StackId, Timestamp,
    WritingSystem,
};
pub use undo::{TaskState, UndoStack};
pub use unit_of_work::{ChangeSet, UnitOfWork};
pub use value::FieldValue;

pub use lcmdb_codec::{ObjectId, Snapshot};
