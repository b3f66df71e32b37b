//! Undo stacks.

mod stack;

pub use stack::{TaskState, UndoStack};
