use super::*;
use crate::change::{ChangeNotification, ChangeObserver, ChangeRecord, FieldChange};
use crate::change_feed::ChangeFeed;
use crate::clock::ManualClock;
use crate::config::{AutosaveConfig, Config, RetryConfig};
use crate::error::CoreError;
use crate::schema::{FieldKind, Schema, DATE_MODIFIED};
use crate::types::{ClassId, FieldId, Timestamp, WritingSystem};
use crate::value::FieldValue;
use lcmdb_storage::StoreHub;
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

struct Ids {
    entry: ClassId,
    sense: ClassId,
    form: FieldId,
    senses: FieldId,
    components: FieldId,
    component_of: FieldId,
    date_modified: FieldId,
    gloss: FieldId,
}

fn schema() -> (Arc<Schema>, Ids) {
    let mut b = Schema::builder();
    let entry = b.class("LexEntry");
    let sense = b.class("LexSense");
    let form = b.field(entry, "Form", FieldKind::String);
    let senses = b.field(entry, "Senses", FieldKind::OwningSequence);
    let components = b.field(entry, "Components", FieldKind::ReferenceCollection);
    let component_of = b.virtual_field(entry, "ComponentOf", components);
    let date_modified = b.field(entry, DATE_MODIFIED, FieldKind::Time);
    let gloss = b.field(sense, "Gloss", FieldKind::MultiString);
    let ids = Ids {
        entry,
        sense,
        form,
        senses,
        components,
        component_of,
        date_modified,
        gloss,
    };
    (Arc::new(b.build().unwrap()), ids)
}

struct Fixture {
    service: TransactionService,
    ids: Ids,
    hub: StoreHub,
    clock: Arc<ManualClock>,
    schema: Arc<Schema>,
}

fn config() -> Config {
    Config::default()
        .with_retry(RetryConfig::no_retry())
        .with_autosave(AutosaveConfig::disabled())
}

fn fixture() -> Fixture {
    let (schema, ids) = schema();
    let hub = StoreHub::new();
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
    let service = TransactionService::builder(Arc::clone(&schema), Arc::new(hub.connect()))
        .config(config())
        .clock(clock.clone())
        .open()
        .unwrap();
    Fixture {
        service,
        ids,
        hub,
        clock,
        schema,
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<ChangeNotification>>,
    batches: Mutex<usize>,
}

impl ChangeObserver for Recorder {
    fn prop_changed(&self, change: &ChangeNotification) {
        self.seen.lock().push(*change);
    }

    fn all_changes_done(&self) {
        *self.batches.lock() += 1;
    }
}

fn text(value: &str) -> FieldValue {
    FieldValue::String(value.into())
}

#[test]
fn create_edit_undo_redo() {
    let Fixture { mut service, ids, .. } = fixture();
    service.begin_undo_task("Undo create", "Redo create").unwrap();
    let entry = service.create_object(ids.entry, None).unwrap();
    service.set_string(entry, ids.form, "nyumba").unwrap();
    service.end_undo_task().unwrap();

    assert_eq!(service.field(entry, ids.form).unwrap(), text("nyumba"));
    assert!(service.is_new(entry));
    assert!(service.can_undo());

    service.undo().unwrap();
    assert!(!service.has_object(entry));
    assert!(service.can_redo());

    service.redo().unwrap();
    assert_eq!(service.field(entry, ids.form).unwrap(), text("nyumba"));
}

#[test]
fn beginning_twice_rolls_back_the_open_task() {
    let Fixture { mut service, ids, .. } = fixture();
    service.begin_undo_task("Undo", "Redo").unwrap();
    let entry = service.create_object(ids.entry, None).unwrap();

    let err = service.begin_undo_task("Undo", "Redo").unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    assert!(!service.in_task());
    assert!(!service.has_object(entry));
    assert!(!service.can_undo());
}

#[test]
fn mutation_outside_a_task_is_refused() {
    let Fixture { mut service, ids, .. } = fixture();
    let err = service.create_object(ids.entry, None).unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    assert!(service.end_undo_task().is_err());
}

#[test]
fn empty_task_leaves_nothing_to_undo() {
    let Fixture { mut service, .. } = fixture();
    service.begin_undo_task("Undo", "Redo").unwrap();
    service.end_undo_task().unwrap();
    assert!(!service.can_undo());
    assert_eq!(service.stack(service.current_stack()).unwrap().undo_len(), 0);
}

#[test]
fn failing_closure_rolls_back() {
    let Fixture { mut service, ids, .. } = fixture();
    let missing = crate::ObjectId::new();
    let result = service.with_undo_task("Undo", "Redo", |s| {
        let entry = s.create_object(ids.entry, None)?;
        s.set_vector(entry, ids.components, vec![missing])?;
        Ok(entry)
    });
    assert!(matches!(result, Err(CoreError::DanglingReference { .. })));
    assert_eq!(service.object_count(), 0);
    assert!(!service.in_task());
}

#[test]
fn delete_cascades_and_undo_restores() {
    let Fixture { mut service, ids, .. } = fixture();
    let (entry, first, second) = service
        .with_undo_task("Undo", "Redo", |s| {
            let entry = s.create_object(ids.entry, None)?;
            let first = s.create_object(ids.sense, Some((entry, ids.senses)))?;
            let second = s.create_object(ids.sense, Some((entry, ids.senses)))?;
            s.set_multi_string(first, ids.gloss, WritingSystem(1), Some("house".into()))?;
            Ok((entry, first, second))
        })
        .unwrap();

    service
        .with_undo_task("Undo delete", "Redo delete", |s| s.delete_object(entry))
        .unwrap();
    assert_eq!(service.object_count(), 0);

    service.undo().unwrap();
    assert_eq!(service.field(entry, ids.senses).unwrap(), FieldValue::Vector(vec![first, second]));
    let FieldValue::MultiString(gloss) = service.field(first, ids.gloss).unwrap() else {
        panic!("gloss is a multi-string");
    };
    assert_eq!(gloss.get(&WritingSystem(1)).map(String::as_str), Some("house"));
}

#[test]
fn removing_an_owned_object_deletes_it() {
    let Fixture { mut service, ids, .. } = fixture();
    let (entry, sense) = service
        .with_undo_task("Undo", "Redo", |s| {
            let entry = s.create_object(ids.entry, None)?;
            let sense = s.create_object(ids.sense, Some((entry, ids.senses)))?;
            Ok((entry, sense))
        })
        .unwrap();
    service
        .with_undo_task("Undo", "Redo", |s| s.remove_from_vector(entry, ids.senses, sense))
        .unwrap();
    assert!(!service.has_object(sense));
}

#[test]
fn owning_an_ancestor_is_refused() {
    let Fixture { mut service, ids, .. } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();
    service.begin_undo_task("Undo", "Redo").unwrap();
    let err = service.set_vector(entry, ids.senses, vec![entry]).unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    service.rollback().unwrap();
}

#[test]
fn date_modified_is_stamped_unless_suppressed() {
    let Fixture {
        mut service,
        ids,
        clock,
        ..
    } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();
    assert_eq!(
        service.field(entry, ids.date_modified).unwrap(),
        FieldValue::Time(Timestamp::from_millis(1_000))
    );

    clock.advance(Duration::from_secs(1));
    service
        .with_undo_task("Undo", "Redo", |s| s.set_string(entry, ids.form, "a"))
        .unwrap();
    assert_eq!(
        service.field(entry, ids.date_modified).unwrap(),
        FieldValue::Time(Timestamp::from_millis(2_000))
    );

    clock.advance(Duration::from_secs(1));
    service
        .with_undo_task("Undo", "Redo", |s| {
            s.suppress_date_modified()?;
            s.set_string(entry, ids.form, "b")
        })
        .unwrap();
    assert_eq!(
        service.field(entry, ids.date_modified).unwrap(),
        FieldValue::Time(Timestamp::from_millis(2_000))
    );
}

#[test]
fn observers_see_links_and_back_references() {
    let Fixture { mut service, ids, .. } = fixture();
    let recorder = Arc::new(Recorder::default());
    service.add_observer(recorder.clone());

    let (whole, part) = service
        .with_undo_task("Undo", "Redo", |s| {
            let whole = s.create_object(ids.entry, None)?;
            let part = s.create_object(ids.entry, None)?;
            s.set_vector(whole, ids.components, vec![part])?;
            Ok((whole, part))
        })
        .unwrap();

    assert_eq!(service.field(part, ids.component_of).unwrap(), FieldValue::Vector(vec![whole]));
    let seen = recorder.seen.lock().clone();
    assert!(seen.iter().any(|n| n.object == whole && n.field == ids.components));
    assert!(seen.iter().any(|n| n.object == part && n.field == ids.component_of));
    assert_eq!(*recorder.batches.lock(), 1);

    // Deleting the target clears the link.
    service
        .with_undo_task("Undo", "Redo", |s| s.delete_object(part))
        .unwrap();
    assert_eq!(service.field(whole, ids.components).unwrap(), FieldValue::Vector(vec![]));
}

#[test]
fn later_unit_on_another_stack_blocks_undo() {
    let Fixture { mut service, ids, .. } = fixture();
    let first = service.current_stack();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| {
            let entry = s.create_object(ids.entry, None)?;
            s.set_string(entry, ids.form, "a")?;
            Ok(entry)
        })
        .unwrap();

    let second = service.create_undo_stack();
    service.begin_undo_task_on(second, "Undo", "Redo").unwrap();
    service.set_string(entry, ids.form, "b").unwrap();
    service.end_undo_task().unwrap();

    assert!(!service.can_undo_on(first));
    assert!(matches!(service.undo_on(first), Err(CoreError::UndoRefused { .. })));

    service.undo_on(second).unwrap();
    assert!(service.can_undo_on(first));
    // The undone unit on the other stack is newer, so redo stays possible.
    assert!(service.can_redo_on(second));
}

#[test]
fn collapse_to_mark_merges_units() {
    let Fixture { mut service, ids, .. } = fixture();
    let mark = service.mark();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();
    service
        .with_undo_task("Undo", "Redo", |s| s.set_string(entry, ids.form, "a"))
        .unwrap();
    assert!(service.has_marks());

    assert!(service.collapse_to_mark(mark).unwrap());
    assert_eq!(service.stack(service.current_stack()).unwrap().undo_len(), 1);
    assert!(!service.has_marks());

    service.undo().unwrap();
    assert!(!service.has_object(entry));
}

#[test]
fn discard_to_mark_refuses_data_changes() {
    let Fixture { mut service, ids, .. } = fixture();
    let mark = service.mark();
    service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();
    assert!(matches!(
        service.discard_to_mark(mark),
        Err(CoreError::DiscardWouldLoseData { .. })
    ));
}

#[test]
fn save_then_load_in_another_session() {
    let Fixture {
        mut service,
        ids,
        hub,
        schema,
        ..
    } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| {
            let entry = s.create_object(ids.entry, None)?;
            s.create_object(ids.sense, Some((entry, ids.senses)))?;
            s.set_string(entry, ids.form, "mti")?;
            Ok(entry)
        })
        .unwrap();
    assert!(service.unsaved_work());

    let SaveOutcome::Saved(summary) = service.save().unwrap() else {
        panic!("expected a save");
    };
    assert_eq!(summary.created, 2);
    assert!(!service.unsaved_work());
    assert_eq!(hub.object_count(), 2);
    assert!(matches!(
        service.save().unwrap(),
        SaveOutcome::NothingToSave { reconciled_rounds: 0 }
    ));

    let mut other = TransactionService::open(schema, Arc::new(hub.connect()), config()).unwrap();
    assert_eq!(other.load_from_store().unwrap(), 2);
    assert_eq!(other.field(entry, ids.form).unwrap(), text("mti"));
    assert_eq!(other.field(entry, ids.senses).unwrap().object_ids().len(), 1);
}

#[test]
fn undo_after_save_is_unsaved_work() {
    let Fixture { mut service, ids, hub, .. } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();
    service.save().unwrap();

    service.undo().unwrap();
    assert!(service.unsaved_work());
    service.save().unwrap();
    assert_eq!(hub.object_count(), 0);
    assert!(!service.has_object(entry));
}

#[test]
fn discard_reverts_to_saved_state() {
    let Fixture { mut service, ids, .. } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| {
            let entry = s.create_object(ids.entry, None)?;
            s.set_string(entry, ids.form, "saved")?;
            Ok(entry)
        })
        .unwrap();
    service.save().unwrap();

    service
        .with_undo_task("Undo", "Redo", |s| s.set_string(entry, ids.form, "draft"))
        .unwrap();
    let extra = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();

    service.discard_unsaved_changes().unwrap();
    assert_eq!(service.field(entry, ids.form).unwrap(), text("saved"));
    assert!(!service.has_object(extra));
    assert!(!service.unsaved_work());
    assert!(!service.can_redo());
}

#[test]
fn discard_reapplies_undone_saved_work() {
    let Fixture { mut service, ids, .. } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();
    service.save().unwrap();
    service.undo().unwrap();
    assert!(!service.has_object(entry));

    service.discard_unsaved_changes().unwrap();
    assert!(service.has_object(entry));
    assert!(service.can_undo());
    assert!(!service.unsaved_work());
}

#[test]
fn saving_inside_a_task_is_misuse() {
    let Fixture { mut service, ids, .. } = fixture();
    service.begin_undo_task("Undo", "Redo").unwrap();
    let entry = service.create_object(ids.entry, None).unwrap();
    assert!(matches!(service.save(), Err(CoreError::InvalidOperation { .. })));
    assert!(!service.in_task());
    assert!(!service.has_object(entry));
}

#[test]
fn removing_stacks() {
    let Fixture { mut service, ids, .. } = fixture();
    let first = service.current_stack();
    let second = service.create_undo_stack();
    assert!(service.remove_undo_stack(first).is_err());

    service.begin_undo_task_on(second, "Undo", "Redo").unwrap();
    service.create_object(ids.entry, None).unwrap();
    service.end_undo_task().unwrap();
    assert!(service.remove_undo_stack(second).is_err());

    service.save().unwrap();
    service.remove_undo_stack(second).unwrap();
    assert!(service.stack(second).is_none());
}

#[test]
fn saved_non_undoable_unit_still_blocks_undo() {
    let Fixture { mut service, ids, .. } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| {
            let entry = s.create_object(ids.entry, None)?;
            s.set_string(entry, ids.form, "a")?;
            Ok(entry)
        })
        .unwrap();
    service.save().unwrap();

    service.begin_non_undoable_task().unwrap();
    service.set_string(entry, ids.form, "b").unwrap();
    service.end_undo_task().unwrap();
    assert!(!service.can_undo());

    service.save().unwrap();
    assert!(!service.unsaved_work());
    assert!(!service.can_undo());
    assert!(matches!(service.undo(), Err(CoreError::UndoRefused { .. })));
    assert_eq!(service.field(entry, ids.form).unwrap(), text("b"));
}

#[test]
fn removed_stack_units_still_block_undo() {
    let Fixture { mut service, ids, .. } = fixture();
    let first = service.current_stack();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();

    let second = service.create_undo_stack();
    service.begin_undo_task_on(second, "Undo", "Redo").unwrap();
    service.set_string(entry, ids.form, "b").unwrap();
    service.end_undo_task().unwrap();
    service.save().unwrap();
    service.remove_undo_stack(second).unwrap();

    assert!(!service.can_undo_on(first));
    assert!(service.has_object(entry));
}

#[test]
fn later_link_to_a_created_object_blocks_undo() {
    let Fixture { mut service, ids, .. } = fixture();
    let first = service.current_stack();
    let whole = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();
    let part = service
        .with_undo_task("Undo", "Redo", |s| s.create_object(ids.entry, None))
        .unwrap();

    let second = service.create_undo_stack();
    service.begin_undo_task_on(second, "Undo", "Redo").unwrap();
    service.set_vector(whole, ids.components, vec![part]).unwrap();
    service.end_undo_task().unwrap();

    assert!(!service.can_undo_on(first));
    assert!(matches!(service.undo_on(first), Err(CoreError::UndoRefused { .. })));
    assert!(service.has_object(part));
    assert_eq!(service.field(whole, ids.components).unwrap(), FieldValue::Vector(vec![part]));

    service.undo_on(second).unwrap();
    assert!(service.can_undo_on(first));
    service.undo_on(first).unwrap();
    assert!(!service.has_object(part));
}

#[test]
fn readers_wait_for_the_open_task() {
    let Fixture { mut service, ids, .. } = fixture();
    let reader = service.reader();
    service.begin_undo_task("Undo", "Redo").unwrap();
    let entry = service.create_object(ids.entry, None).unwrap();
    assert!(reader.try_read().is_none());

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let graph = reader.read();
        tx.send(graph.has_object(entry)).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    service.end_undo_task().unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    handle.join().unwrap();
}

#[test]
fn change_feed_follows_tasks_and_undo() {
    let Fixture { mut service, ids, .. } = fixture();
    let (whole, part) = service
        .with_undo_task("Undo", "Redo", |s| {
            Ok((s.create_object(ids.entry, None)?, s.create_object(ids.entry, None)?))
        })
        .unwrap();

    let feed = Arc::new(ChangeFeed::new());
    let rx = feed.subscribe();
    service.add_observer(feed.clone());
    service
        .with_undo_task("Undo", "Redo", |s| {
            s.set_string(whole, ids.form, "abc")?;
            s.set_vector(whole, ids.components, vec![part])
        })
        .unwrap();
    assert_eq!(feed.batch(), 1);

    let edited: Vec<_> = rx.try_iter().collect();
    assert!(edited.iter().all(|e| e.batch == 0));
    let fields: Vec<_> = edited
        .iter()
        .map(|e| e.notification)
        .filter(|n| n.field != ids.date_modified)
        .map(|n| (n.object, n.field))
        .collect();
    let form_at = fields.iter().position(|f| *f == (whole, ids.form)).unwrap();
    let link_at = fields.iter().position(|f| *f == (whole, ids.components)).unwrap();
    assert!(form_at < link_at);
    assert!(fields.contains(&(part, ids.component_of)));
    let form = edited
        .iter()
        .find(|e| e.notification.field == ids.form)
        .unwrap()
        .notification;
    assert_eq!((form.index, form.inserted, form.deleted), (0, 3, 0));

    service.undo().unwrap();
    assert_eq!(feed.batch(), 2);
    let undone: Vec<_> = rx
        .try_iter()
        .inspect(|e| assert_eq!(e.batch, 1))
        .map(|e| (e.notification.object, e.notification.field))
        .collect();
    let form_at = undone.iter().position(|f| *f == (whole, ids.form)).unwrap();
    let link_at = undone.iter().position(|f| *f == (whole, ids.components)).unwrap();
    assert!(link_at < form_at);
    assert_eq!(feed.poll(1, usize::MAX).len(), undone.len());
}

#[test]
fn registered_changes_coalesce_and_undo() {
    let Fixture { mut service, ids, .. } = fixture();
    let entry = service
        .with_undo_task("Undo", "Redo", |s| {
            let entry = s.create_object(ids.entry, None)?;
            s.set_string(entry, ids.form, "a")?;
            Ok(entry)
        })
        .unwrap();
    let extra = crate::ObjectId::new();

    service.begin_undo_task("Undo", "Redo").unwrap();
    for (old, new) in [("a", "b"), ("b", "c")] {
        service
            .edit_graph(|graph| graph.set_field(entry, ids.form, text(new)))
            .unwrap();
        service
            .register_modified(ChangeRecord::String(FieldChange::new(entry, ids.form, old.into(), new.into())))
            .unwrap();
    }
    service
        .edit_graph(|graph| graph.register_created(extra, ids.entry, None).map(drop))
        .unwrap();
    service.register_created(extra).unwrap();
    service.end_undo_task().unwrap();

    let unit = service.stack(service.current_stack()).unwrap().peek_undo().unwrap();
    let forms: Vec<_> = unit
        .changes()
        .iter()
        .filter_map(|r| match r {
            ChangeRecord::String(c) if c.field == ids.form => Some((c.old.clone(), c.new.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(forms, vec![("a".to_string(), "c".to_string())]);

    service.undo().unwrap();
    assert_eq!(service.field(entry, ids.form).unwrap(), text("a"));
    assert!(!service.has_object(extra));

    service.redo().unwrap();
    assert_eq!(service.field(entry, ids.form).unwrap(), text("c"));
    assert!(service.has_object(extra));
}

#[test]
fn editing_the_graph_needs_a_task() {
    let Fixture { mut service, .. } = fixture();
    assert!(matches!(
        service.edit_graph(|graph| Ok(graph.has_object(crate::ObjectId::new()))),
        Err(CoreError::InvalidOperation { .. })
    ));
    assert!(matches!(
        service.register_modified(ChangeRecord::String(FieldChange::new(
            crate::ObjectId::new(),
            FieldId::new(1001),
            String::new(),
            "x".into()
        ))),
        Err(CoreError::InvalidOperation { .. })
    ));
}
