//! Two clients editing one store.

use lcmdb_core::{
    ChangeRecord, Conflict, CoreError, FieldValue, ObjectId, SaveOutcome, Snapshot,
    TransactionService,
};
use lcmdb_storage::{
    BackingStore, CommitBatch, CommitCursor, ForeignChanges, InMemoryStore, StorageError,
    StorageResult, VersionStamp,
};
use lcmdb_testkit::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn seed(client: &mut TransactionService, lex: &Lexicon, forms: &[&str]) -> Vec<ObjectId> {
    client
        .with_undo_task("Undo seed", "Redo seed", |s| {
            let mut ids = Vec::new();
            for form in forms {
                let id = s.create_object(lex.entry, None)?;
                s.set_string(id, lex.form, *form)?;
                ids.push(id);
            }
            Ok(ids)
        })
        .unwrap()
}

fn set_of(ids: Vec<ObjectId>) -> BTreeSet<ObjectId> {
    ids.into_iter().collect()
}

fn add_new_component(client: &mut TransactionService, lex: &Lexicon, whole: ObjectId, form: &str) -> ObjectId {
    client
        .with_undo_task("Undo add component", "Redo add component", |s| {
            let part = s.create_object(lex.entry, None)?;
            s.set_string(part, lex.form, form)?;
            s.insert_into_vector(whole, lex.components, usize::MAX, part)?;
            Ok(part)
        })
        .unwrap()
}

#[test]
fn concurrent_collection_edits_merge() {
    init_tracing();
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let mut alice = store.client();
    let ids = seed(&mut alice, lex, &["whole", "a", "b"]);
    let (whole, a, b) = (ids[0], ids[1], ids[2]);
    alice
        .with_undo_task("Undo link", "Redo link", |s| s.set_vector(whole, lex.components, vec![a, b]))
        .unwrap();
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    // Alice swaps b for c, Bob swaps a for d.
    store.set_time(10);
    let c = alice
        .with_undo_task("Undo swap", "Redo swap", |s| {
            let c = s.create_object(lex.entry, None)?;
            s.remove_from_vector(whole, lex.components, b)?;
            s.insert_into_vector(whole, lex.components, usize::MAX, c)?;
            Ok(c)
        })
        .unwrap();
    store.set_time(20);
    let d = bob
        .with_undo_task("Undo swap", "Redo swap", |s| {
            let d = s.create_object(lex.entry, None)?;
            s.remove_from_vector(whole, lex.components, a)?;
            s.insert_into_vector(whole, lex.components, usize::MAX, d)?;
            Ok(d)
        })
        .unwrap();
    save_expecting_commit(&mut bob);

    let summary = save_expecting_commit(&mut alice);
    assert_eq!(summary.reconciled_rounds, 1);
    assert_eq!(set_of(ids_in(&alice, whole, lex.components)), set_of(vec![c, d]));
    assert_eq!(set_of(ids_in(&alice, d, lex.component_of)), set_of(vec![whole]));

    let fresh = store.loaded_client();
    assert_eq!(set_of(ids_in(&fresh, whole, lex.components)), set_of(vec![c, d]));

    // Alice's undo brings back her own b, never Bob's a.
    assert!(alice.can_undo());
    alice.undo().unwrap();
    let after = set_of(ids_in(&alice, whole, lex.components));
    assert_eq!(after, set_of(vec![b, d]));
    assert!(!after.contains(&a));

    // Bob's unit is now older than the merged one and touches the same slot.
    assert_eq!(bob.save().unwrap(), SaveOutcome::NothingToSave { reconciled_rounds: 1 });
    assert_eq!(set_of(ids_in(&bob, whole, lex.components)), set_of(vec![c, d]));
    assert!(!bob.can_undo());
    assert!(matches!(bob.undo(), Err(CoreError::UndoRefused { .. })));
}

#[test]
fn local_date_modified_newer_than_foreign_is_kept() {
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let mut alice = store.client();
    let whole = create_entry(&mut alice, lex, "nyumba");
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    let t1 = store.set_time(100);
    bob.with_undo_task("Undo homograph", "Redo homograph", |s| s.set_integer(whole, lex.homograph, 2))
        .unwrap();
    save_expecting_commit(&mut bob);

    let t2 = store.set_time(200);
    let part = add_new_component(&mut alice, lex, whole, "chumba");
    save_expecting_commit(&mut alice);

    assert_eq!(time_of(&alice, whole, lex.date_modified), t2);
    assert_eq!(alice.field(whole, lex.homograph).unwrap(), FieldValue::Integer(2));

    alice.undo().unwrap();
    assert!(!alice.has_object(part));
    assert!(ids_in(&alice, whole, lex.components).is_empty());
    assert_eq!(time_of(&alice, whole, lex.date_modified), t1);
    assert_eq!(alice.field(whole, lex.homograph).unwrap(), FieldValue::Integer(2));
}

#[test]
fn foreign_date_modified_newer_than_local_wins() {
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let mut alice = store.client();
    let whole = create_entry(&mut alice, lex, "nyumba");
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    store.set_time(100);
    let part = add_new_component(&mut alice, lex, whole, "chumba");

    let t1 = store.set_time(200);
    bob.with_undo_task("Undo homograph", "Redo homograph", |s| s.set_integer(whole, lex.homograph, 3))
        .unwrap();
    save_expecting_commit(&mut bob);

    save_expecting_commit(&mut alice);
    assert_eq!(time_of(&alice, whole, lex.date_modified), t1);

    // The local stamp record was dropped, so undo leaves the foreign stamp.
    let unit = alice.stack(alice.current_stack()).unwrap().peek_undo().unwrap();
    assert!(!unit
        .changes()
        .iter()
        .any(|r| matches!(r, ChangeRecord::Time(c) if c.object == whole)));
    alice.undo().unwrap();
    assert!(!alice.has_object(part));
    assert_eq!(time_of(&alice, whole, lex.date_modified), t1);
}

#[test]
fn overlapping_writes_conflict_until_discarded() {
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let mut alice = store.client();
    let entry = create_entry(&mut alice, lex, "mbwa");
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    alice
        .with_undo_task("Undo form", "Redo form", |s| s.set_string(entry, lex.form, "paka"))
        .unwrap();
    bob.with_undo_task("Undo form", "Redo form", |s| s.set_string(entry, lex.form, "simba"))
        .unwrap();
    save_expecting_commit(&mut bob);

    let before = alice.stack(alice.current_stack()).unwrap().peek_undo().unwrap().clone();
    let SaveOutcome::Conflict(report) = alice.save().unwrap() else {
        panic!("expected a conflict");
    };
    assert!(report.conflicts.contains(&Conflict::FieldOverlap {
        object: entry,
        field: lex.form,
    }));
    assert!(alice.conflict_pending());
    assert_eq!(alice.field(entry, lex.form).unwrap(), FieldValue::String("paka".into()));
    let after = alice.stack(alice.current_stack()).unwrap().peek_undo().unwrap();
    assert_eq!(after.changes(), before.changes());
    assert_eq!(after.sequence(), before.sequence());

    alice.discard_unsaved_changes().unwrap();
    assert!(!alice.conflict_pending());
    assert_eq!(alice.field(entry, lex.form).unwrap(), FieldValue::String("mbwa".into()));

    assert_eq!(alice.save().unwrap(), SaveOutcome::NothingToSave { reconciled_rounds: 1 });
    assert_eq!(alice.field(entry, lex.form).unwrap(), FieldValue::String("simba".into()));
}

#[test]
fn identical_writes_do_not_conflict() {
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let mut alice = store.client();
    let entry = create_entry(&mut alice, lex, "mbwa");
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    for client in [&mut alice, &mut bob] {
        client
            .with_undo_task("Undo form", "Redo form", |s| s.set_string(entry, lex.form, "sawa"))
            .unwrap();
    }
    save_expecting_commit(&mut bob);
    let summary = save_expecting_commit(&mut alice);
    assert_eq!(summary.reconciled_rounds, 1);
    assert_eq!(alice.field(entry, lex.form).unwrap(), FieldValue::String("sawa".into()));
}

#[test]
fn deleting_what_the_other_side_edits_conflicts() {
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let mut alice = store.client();
    let ids = seed(&mut alice, lex, &["x", "y"]);
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    alice
        .with_undo_task("Undo form", "Redo form", |s| s.set_string(ids[0], lex.form, "x2"))
        .unwrap();
    alice
        .with_undo_task("Undo link", "Redo link", |s| s.set_vector(ids[1], lex.components, vec![ids[0]]))
        .unwrap();
    bob.with_undo_task("Undo delete", "Redo delete", |s| s.delete_object(ids[0]))
        .unwrap();
    save_expecting_commit(&mut bob);

    let SaveOutcome::Conflict(report) = alice.save().unwrap() else {
        panic!("expected a conflict");
    };
    assert!(report
        .conflicts
        .contains(&Conflict::ForeignDeleteOfLocalModified { object: ids[0] }));
    assert!(report.conflicts.contains(&Conflict::LocalReferenceToForeignDeleted {
        from: ids[1],
        to: ids[0],
    }));
    assert!(alice.has_object(ids[0]));
}

#[test]
fn foreign_link_to_an_object_blocks_undoing_its_creation() {
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let mut alice = store.client();
    let part = create_entry(&mut alice, lex, "sehemu");
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    let whole = bob
        .with_undo_task("Undo create", "Redo create", |s| {
            let whole = s.create_object(lex.entry, None)?;
            s.set_vector(whole, lex.components, vec![part])?;
            Ok(whole)
        })
        .unwrap();
    save_expecting_commit(&mut bob);

    assert_eq!(alice.save().unwrap(), SaveOutcome::NothingToSave { reconciled_rounds: 1 });
    assert_eq!(ids_in(&alice, part, lex.component_of), vec![whole]);
    assert!(!alice.can_undo());
    assert!(alice.undo().is_err());
    assert!(alice.has_object(part));
}

/// Store whose acknowledgement can be made to fail once.
#[derive(Debug)]
struct FlakyAck {
    inner: InMemoryStore,
    fail_next_ack: AtomicBool,
}

impl BackingStore for FlakyAck {
    fn commit(&self, batch: &CommitBatch) -> StorageResult<bool> {
        self.inner.commit(batch)
    }

    fn unseen_foreign_changes(&self) -> StorageResult<ForeignChanges> {
        self.inner.unseen_foreign_changes()
    }

    fn mark_seen(&self, cursor: CommitCursor) -> StorageResult<()> {
        if self.fail_next_ack.swap(false, Ordering::SeqCst) {
            return Err(StorageError::connection_lost("acknowledgement dropped"));
        }
        self.inner.mark_seen(cursor)
    }

    fn version_stamp(&self) -> StorageResult<VersionStamp> {
        self.inner.version_stamp()
    }

    fn new_objects_since_version(&self, stamp: VersionStamp, class_name: &str) -> StorageResult<bool> {
        self.inner.new_objects_since_version(stamp, class_name)
    }

    fn load_all(&self) -> StorageResult<(Vec<Snapshot>, CommitCursor)> {
        self.inner.load_all()
    }
}

#[test]
fn merging_the_same_foreign_changes_twice_adds_nothing_twice() {
    let store = SharedStore::new();
    let lex = &store.lexicon;
    let flaky = Arc::new(FlakyAck {
        inner: store.hub.connect(),
        fail_next_ack: AtomicBool::new(false),
    });
    let mut alice = TransactionService::builder(Arc::clone(&lex.schema), flaky.clone())
        .config(test_config())
        .clock(store.clock.clone())
        .open()
        .unwrap();
    let whole = create_entry(&mut alice, lex, "kundi");
    save_expecting_commit(&mut alice);
    let mut bob = store.loaded_client();

    let d = add_new_component(&mut bob, lex, whole, "d");
    save_expecting_commit(&mut bob);
    let c = add_new_component(&mut alice, lex, whole, "c");

    flaky.fail_next_ack.store(true, Ordering::SeqCst);
    assert!(matches!(alice.save(), Err(CoreError::ConnectionLost { .. })));
    assert!(alice.unsaved_work());

    // The same foreign batch arrives again.
    save_expecting_commit(&mut alice);
    let components = ids_in(&alice, whole, lex.components);
    assert_eq!(components.len(), 2);
    assert_eq!(set_of(components), set_of(vec![c, d]));
    assert_eq!(ids_in(&alice, d, lex.component_of), vec![whole]);

    let fresh = store.loaded_client();
    assert_eq!(ids_in(&fresh, whole, lex.components).len(), 2);
}
