//! Test fixtures: a small lexicon schema, clients sharing one store, and
//! observers that record what they are told.

use lcmdb_core::{
    AutosaveConfig, ChangeNotification, ChangeObserver, ClassId, Config, ConnectionLossHandler,
    FieldId, FieldKind, FieldValue, ManualClock, ObjectId, RetryConfig, SaveOutcome, SaveSummary,
    Schema, Snapshot, Timestamp, TransactionService, DATE_MODIFIED,
};
use lcmdb_storage::{StorageError, StoreHub};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Ids of the lexicon schema.
///
/// `LexEntry` has a form, owned senses, referenced components with a
/// derived `ComponentOf` back-reference, and a `DateModified` stamp.
/// `LexSense` has a multi-string gloss.
#[derive(Debug, Clone)]
pub struct Lexicon {
    /// The schema.
    pub schema: Arc<Schema>,
    /// `LexEntry`.
    pub entry: ClassId,
    /// `LexSense`.
    pub sense: ClassId,
    /// `LexEntry.Form`, a string.
    pub form: FieldId,
    /// `LexEntry.HomographNumber`, an integer.
    pub homograph: FieldId,
    /// `LexEntry.Senses`, an owning sequence of senses.
    pub senses: FieldId,
    /// `LexEntry.Components`, a reference collection of entries.
    pub components: FieldId,
    /// `LexEntry.ComponentOf`, derived from `Components`.
    pub component_of: FieldId,
    /// `LexEntry.DateModified`.
    pub date_modified: FieldId,
    /// `LexSense.Gloss`, a multi-string.
    pub gloss: FieldId,
}

/// Builds the lexicon schema.
pub fn lexicon() -> Lexicon {
    let mut b = Schema::builder();
    let entry = b.class("LexEntry");
    let sense = b.class("LexSense");
    let form = b.field(entry, "Form", FieldKind::String);
    let homograph = b.field(entry, "HomographNumber", FieldKind::Integer);
    let senses = b.field(entry, "Senses", FieldKind::OwningSequence);
    let components = b.field(entry, "Components", FieldKind::ReferenceCollection);
    let component_of = b.virtual_field(entry, "ComponentOf", components);
    let date_modified = b.field(entry, DATE_MODIFIED, FieldKind::Time);
    let gloss = b.field(sense, "Gloss", FieldKind::MultiString);
    Lexicon {
        schema: Arc::new(b.build().expect("lexicon schema is valid")),
        entry,
        sense,
        form,
        homograph,
        senses,
        components,
        component_of,
        date_modified,
        gloss,
    }
}

/// Configuration for tests: no quick retries, no autosave.
pub fn test_config() -> Config {
    Config::default()
        .with_retry(RetryConfig::no_retry())
        .with_autosave(AutosaveConfig::disabled())
}

/// Wall-clock start of every [`SharedStore`] clock.
pub const T0: Timestamp = Timestamp::from_millis(1_000_000);

/// One store, one schema, one clock; any number of clients.
#[derive(Debug)]
pub struct SharedStore {
    /// The store every client connects to.
    pub hub: StoreHub,
    /// The schema every client uses.
    pub lexicon: Lexicon,
    /// The clock every client reads.
    pub clock: Arc<ManualClock>,
}

impl Default for SharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore {
    /// Creates an empty store with the clock at [`T0`].
    pub fn new() -> Self {
        Self {
            hub: StoreHub::new(),
            lexicon: lexicon(),
            clock: Arc::new(ManualClock::new(T0)),
        }
    }

    /// Opens a client with [`test_config`].
    pub fn client(&self) -> TransactionService {
        self.client_with(test_config())
    }

    /// Opens a client with `config`.
    pub fn client_with(&self, config: Config) -> TransactionService {
        TransactionService::builder(Arc::clone(&self.lexicon.schema), Arc::new(self.hub.connect()))
            .config(config)
            .clock(self.clock.clone())
            .open()
            .expect("client opens")
    }

    /// Opens a client and loads everything stored so far.
    pub fn loaded_client(&self) -> TransactionService {
        let mut client = self.client();
        client.load_from_store().expect("store loads");
        client
    }

    /// Sets the clock to `T0 + offset` milliseconds.
    pub fn set_time(&self, offset: i64) -> Timestamp {
        let now = Timestamp::from_millis(T0.as_millis() + offset);
        self.clock.set(now);
        now
    }
}

/// Runs one undoable task creating an entry with `form`.
pub fn create_entry(client: &mut TransactionService, lexicon: &Lexicon, form: &str) -> ObjectId {
    client
        .with_undo_task("Undo create entry", "Redo create entry", |s| {
            let entry = s.create_object(lexicon.entry, None)?;
            s.set_string(entry, lexicon.form, form)?;
            Ok(entry)
        })
        .expect("entry created")
}

/// Saves and expects local changes to reach the store.
pub fn save_expecting_commit(client: &mut TransactionService) -> SaveSummary {
    match client.save().expect("save succeeds") {
        SaveOutcome::Saved(summary) => summary,
        other => panic!("expected a commit, got {other:?}"),
    }
}

/// Reads a vector field as a list of ids.
pub fn ids_in(client: &TransactionService, object: ObjectId, field: FieldId) -> Vec<ObjectId> {
    client
        .field(object, field)
        .expect("field is readable")
        .object_ids()
}

/// Reads a time field.
pub fn time_of(client: &TransactionService, object: ObjectId, field: FieldId) -> Timestamp {
    match client.field(object, field).expect("field is readable") {
        FieldValue::Time(t) => t,
        other => panic!("not a time value: {other:?}"),
    }
}

/// Snapshots of every resident object, keyed by id.
pub fn graph_state(client: &TransactionService) -> BTreeMap<ObjectId, Snapshot> {
    let ids = client.reader().read().object_ids();
    ids.into_iter()
        .map(|id| (id, client.snapshot_of(id).expect("resident object")))
        .collect()
}

/// Records every notification and batch end.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<ChangeNotification>>,
    batches: AtomicUsize,
}

impl RecordingObserver {
    /// Creates an observer with nothing recorded.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Notifications so far.
    pub fn notifications(&self) -> Vec<ChangeNotification> {
        self.seen.lock().clone()
    }

    /// Returns true if a notification named `field` of `object`.
    pub fn saw(&self, object: ObjectId, field: FieldId) -> bool {
        self.seen
            .lock()
            .iter()
            .any(|n| n.object == object && n.field == field)
    }

    /// Number of completed batches.
    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    /// Forgets everything recorded.
    pub fn clear(&self) {
        self.seen.lock().clear();
        self.batches.store(0, Ordering::SeqCst);
    }
}

impl ChangeObserver for RecordingObserver {
    fn prop_changed(&self, change: &ChangeNotification) {
        self.seen.lock().push(*change);
    }

    fn all_changes_done(&self) {
        self.batches.fetch_add(1, Ordering::SeqCst);
    }
}

/// Answers retry questions from a script, then gives up.
#[derive(Debug, Default)]
pub struct ScriptedLossHandler {
    answers: Mutex<VecDeque<bool>>,
    calls: AtomicU32,
}

impl ScriptedLossHandler {
    /// Creates a handler that answers `answers` in order.
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into_iter().collect()),
            calls: AtomicU32::new(0),
        })
    }

    /// Number of times the handler was asked.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConnectionLossHandler for ScriptedLossHandler {
    fn retry_after_failure(&self, _attempts: u32, _error: &StorageError) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answers.lock().pop_front().unwrap_or(false)
    }
}

/// Installs a test-friendly `tracing` subscriber once, filtered by
/// `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicon_resolves_names() {
        let lex = lexicon();
        assert_eq!(lex.schema.class_by_name("LexSense").unwrap(), lex.sense);
        assert_eq!(lex.schema.date_modified_field(lex.entry), Some(lex.date_modified));
        assert_eq!(lex.schema.date_modified_field(lex.sense), None);
    }

    #[test]
    fn clients_share_the_store() {
        let store = SharedStore::new();
        let mut alice = store.client();
        let entry = create_entry(&mut alice, &store.lexicon, "maji");
        save_expecting_commit(&mut alice);

        let bob = store.loaded_client();
        assert_eq!(
            bob.field(entry, store.lexicon.form).unwrap(),
            FieldValue::String("maji".into())
        );
        assert_eq!(graph_state(&bob), graph_state(&alice));
    }
}
