//! Property-based test generators using proptest.
//!
//! Edit scripts pick their targets by index into a pool of live entries,
//! so every generated script is valid whatever the pool holds when it runs.

use crate::fixtures::Lexicon;
use lcmdb_core::{CoreResult, ObjectId, TransactionService, WritingSystem};
use proptest::prelude::*;

/// One user edit, run as its own undoable task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Creates an entry and adds it to the pool.
    CreateEntry {
        /// Form of the new entry.
        form: String,
    },
    /// Rewrites the form of a pooled entry.
    SetForm {
        /// Pool index, taken modulo the pool size.
        target: usize,
        /// New form.
        form: String,
    },
    /// Rewrites the homograph number of a pooled entry.
    SetHomograph {
        /// Pool index.
        target: usize,
        /// New number.
        value: i64,
    },
    /// Links one pooled entry to another as a component.
    AddComponent {
        /// Pool index of the referring entry.
        target: usize,
        /// Pool index of the component.
        component: usize,
    },
    /// Unlinks one component of a pooled entry.
    RemoveComponent {
        /// Pool index.
        target: usize,
        /// Index into the entry's components.
        index: usize,
    },
    /// Creates a sense owned by a pooled entry.
    AddSense {
        /// Pool index.
        target: usize,
        /// Gloss in writing system 1.
        gloss: String,
    },
    /// Deletes a pooled entry and everything it owns.
    DeleteEntry {
        /// Pool index.
        target: usize,
    },
}

/// Strategy for short lowercase words.
pub fn word_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for a single edit.
pub fn edit_strategy() -> impl Strategy<Value = Edit> {
    let index = 0usize..16;
    prop_oneof![
        3 => word_strategy().prop_map(|form| Edit::CreateEntry { form }),
        2 => (index.clone(), word_strategy()).prop_map(|(target, form)| Edit::SetForm { target, form }),
        1 => (index.clone(), 0i64..5).prop_map(|(target, value)| Edit::SetHomograph { target, value }),
        2 => (index.clone(), index.clone())
            .prop_map(|(target, component)| Edit::AddComponent { target, component }),
        1 => (index.clone(), index.clone()).prop_map(|(target, index)| Edit::RemoveComponent { target, index }),
        1 => (index.clone(), word_strategy()).prop_map(|(target, gloss)| Edit::AddSense { target, gloss }),
        1 => index.prop_map(|target| Edit::DeleteEntry { target }),
    ]
}

/// Strategy for a script of up to `max_len` edits.
pub fn edit_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(edit_strategy(), 1..=max_len.max(1))
}

fn pick(pool: &[ObjectId], index: usize) -> Option<ObjectId> {
    if pool.is_empty() {
        None
    } else {
        Some(pool[index % pool.len()])
    }
}

/// Runs `edit` as one undoable task, keeping `pool` in step with the
/// entries that exist.
///
/// Edits whose targets are missing do nothing.
///
/// # Errors
///
/// Returns whatever the service returns. Generated edits are always
/// valid, so an error is a bug.
pub fn apply_edit(
    service: &mut TransactionService,
    lexicon: &Lexicon,
    pool: &mut Vec<ObjectId>,
    edit: &Edit,
) -> CoreResult<()> {
    match edit {
        Edit::CreateEntry { form } => {
            let entry = service.with_undo_task("Undo create", "Redo create", |s| {
                let entry = s.create_object(lexicon.entry, None)?;
                s.set_string(entry, lexicon.form, form.as_str())?;
                Ok(entry)
            })?;
            pool.push(entry);
        }
        Edit::SetForm { target, form } => {
            if let Some(entry) = pick(pool, *target) {
                service.with_undo_task("Undo form", "Redo form", |s| {
                    s.set_string(entry, lexicon.form, form.as_str())
                })?;
            }
        }
        Edit::SetHomograph { target, value } => {
            if let Some(entry) = pick(pool, *target) {
                service.with_undo_task("Undo homograph", "Redo homograph", |s| {
                    s.set_integer(entry, lexicon.homograph, *value)
                })?;
            }
        }
        Edit::AddComponent { target, component } => {
            let (Some(entry), Some(part)) = (pick(pool, *target), pick(pool, *component)) else {
                return Ok(());
            };
            let present = service.field(entry, lexicon.components)?.object_ids();
            if entry != part && !present.contains(&part) {
                service.with_undo_task("Undo add component", "Redo add component", |s| {
                    s.insert_into_vector(entry, lexicon.components, usize::MAX, part)
                })?;
            }
        }
        Edit::RemoveComponent { target, index } => {
            if let Some(entry) = pick(pool, *target) {
                let present = service.field(entry, lexicon.components)?.object_ids();
                if let Some(part) = pick(&present, *index) {
                    service.with_undo_task("Undo remove component", "Redo remove component", |s| {
                        s.remove_from_vector(entry, lexicon.components, part)
                    })?;
                }
            }
        }
        Edit::AddSense { target, gloss } => {
            if let Some(entry) = pick(pool, *target) {
                service.with_undo_task("Undo add sense", "Redo add sense", |s| {
                    let sense = s.create_object(lexicon.sense, Some((entry, lexicon.senses)))?;
                    s.set_multi_string(sense, lexicon.gloss, WritingSystem(1), Some(gloss.clone()))
                })?;
            }
        }
        Edit::DeleteEntry { target } => {
            if let Some(entry) = pick(pool, *target) {
                service.with_undo_task("Undo delete", "Redo delete", |s| s.delete_object(entry))?;
                pool.retain(|id| *id != entry);
            }
        }
    }
    Ok(())
}

/// Runs every edit of `script` in order.
///
/// # Errors
///
/// Stops at the first error.
pub fn apply_script(
    service: &mut TransactionService,
    lexicon: &Lexicon,
    pool: &mut Vec<ObjectId>,
    script: &[Edit],
) -> CoreResult<()> {
    for edit in script {
        apply_edit(service, lexicon, pool, edit)?;
    }
    Ok(())
}

/// Undoes until the current stack refuses. Returns how many units were undone.
///
/// # Errors
///
/// Returns the first undo error.
pub fn undo_all(service: &mut TransactionService) -> CoreResult<usize> {
    let mut count = 0;
    while service.can_undo() {
        service.undo()?;
        count += 1;
    }
    Ok(count)
}

/// Redoes until the current stack refuses. Returns how many units were redone.
///
/// # Errors
///
/// Returns the first redo error.
pub fn redo_all(service: &mut TransactionService) -> CoreResult<usize> {
    let mut count = 0;
    while service.can_redo() {
        service.redo()?;
        count += 1;
    }
    Ok(count)
}
