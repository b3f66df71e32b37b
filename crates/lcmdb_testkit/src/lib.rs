//! # LCMDB Testkit
//!
//! Test utilities for LCMDB.
//!
//! This crate provides:
//! - A lexicon schema and clients that share one in-memory store
//! - Observers and connection-loss handlers that record what they see
//! - Property-based edit scripts using proptest
//!
//! ## Usage
//!
//! ```rust
//! use lcmdb_testkit::prelude::*;
//!
//! let store = SharedStore::new();
//! let mut alice = store.client();
//! let entry = create_entry(&mut alice, &store.lexicon, "mti");
//! save_expecting_commit(&mut alice);
//!
//! let bob = store.loaded_client();
//! assert!(bob.has_object(entry));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
