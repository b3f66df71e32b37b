//! In-memory multi-client backing store.

use crate::error::{StorageError, StorageResult};
use crate::store::{BackingStore, CommitBatch, CommitCursor, ForeignChanges, VersionStamp};
use lcmdb_codec::{ObjectId, Snapshot};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One commit in the shared history.
#[derive(Debug, Clone)]
struct LogEntry {
    generation: u64,
    client: u32,
    created: Vec<(ObjectId, String)>,
    modified: Vec<ObjectId>,
    deleted: Vec<ObjectId>,
}

#[derive(Debug, Default)]
struct HubState {
    /// Encoded snapshots keyed by object.
    objects: BTreeMap<ObjectId, Vec<u8>>,
    log: Vec<LogEntry>,
    generation: u64,
    next_client: u32,
    injected_failures: u32,
    read_only: bool,
}

impl HubState {
    fn take_failure(&mut self) -> StorageResult<()> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(StorageError::connection_lost("injected connection failure"));
        }
        Ok(())
    }

    fn decode(&self, id: ObjectId) -> StorageResult<Option<Snapshot>> {
        match self.objects.get(&id) {
            Some(bytes) => Snapshot::decode(bytes)
                .map(Some)
                .map_err(|source| StorageError::CorruptSnapshot { object: id, source }),
            None => Ok(None),
        }
    }
}

/// Net effect of the foreign commits on one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NetChange {
    Created,
    Modified,
    Deleted,
    Vanished,
}

/// The shared state of an in-memory store.
///
/// A hub plays the role of the file or server every client opens. Each call
/// to [`StoreHub::connect`] returns an independent client with its own
/// foreign-change cursor. Hubs are cheap to clone.
///
/// The hub can also simulate faults: transient connection loss, a read-only
/// store and corrupt persisted snapshots.
#[derive(Debug, Clone, Default)]
pub struct StoreHub {
    state: Arc<Mutex<HubState>>,
}

impl StoreHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new client connection.
    ///
    /// The client has seen everything committed so far.
    #[must_use]
    pub fn connect(&self) -> InMemoryStore {
        let mut state = self.state.lock();
        let client = state.next_client;
        state.next_client += 1;
        InMemoryStore {
            state: Arc::clone(&self.state),
            client,
            last_seen: Mutex::new(state.generation),
        }
    }

    /// Makes the next `count` store calls fail with a transient error.
    pub fn fail_next_calls(&self, count: u32) {
        self.state.lock().injected_failures = count;
    }

    /// Makes `commit` refuse batches.
    pub fn set_read_only(&self, read_only: bool) {
        self.state.lock().read_only = read_only;
    }

    /// Overwrites the persisted bytes of an object.
    pub fn corrupt_object(&self, id: ObjectId, bytes: Vec<u8>) {
        if let Some(stored) = self.state.lock().objects.get_mut(&id) {
            *stored = bytes;
        }
    }

    /// Returns the number of persisted objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Returns the number of commits so far.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.state.lock().generation
    }

    /// Decodes the persisted snapshot of an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted bytes are corrupt.
    pub fn snapshot(&self, id: ObjectId) -> StorageResult<Option<Snapshot>> {
        self.state.lock().decode(id)
    }
}

/// One client's connection to a [`StoreHub`].
#[derive(Debug)]
pub struct InMemoryStore {
    state: Arc<Mutex<HubState>>,
    client: u32,
    last_seen: Mutex<u64>,
}

impl InMemoryStore {
    /// Returns this client's id on the hub.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.client
    }
}

impl BackingStore for InMemoryStore {
    fn commit(&self, batch: &CommitBatch) -> StorageResult<bool> {
        let mut state = self.state.lock();
        state.take_failure()?;
        if state.read_only {
            return Ok(false);
        }

        let mut entry = LogEntry {
            generation: state.generation + 1,
            client: self.client,
            created: Vec::with_capacity(batch.created.len()),
            modified: Vec::with_capacity(batch.modified.len()),
            deleted: Vec::with_capacity(batch.deleted.len()),
        };

        let mut encoded = Vec::with_capacity(batch.created.len() + batch.modified.len());
        for snapshot in batch.created.iter().chain(&batch.modified) {
            encoded.push((snapshot.guid, snapshot.class.clone(), snapshot.encode()?));
        }

        let created_count = batch.created.len();
        for (index, (id, class, bytes)) in encoded.into_iter().enumerate() {
            let existed = state.objects.contains_key(&id);
            state.objects.insert(id, bytes);
            if index < created_count && !existed {
                entry.created.push((id, class));
            } else {
                entry.modified.push(id);
            }
        }

        for id in &batch.deleted {
            if state.objects.remove(id).is_some() {
                entry.deleted.push(*id);
            }
        }

        state.generation = entry.generation;
        debug!(
            client = self.client,
            generation = entry.generation,
            created = entry.created.len(),
            modified = entry.modified.len(),
            deleted = entry.deleted.len(),
            "commit applied"
        );
        state.log.push(entry);
        Ok(true)
    }

    fn unseen_foreign_changes(&self) -> StorageResult<ForeignChanges> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let last_seen = *self.last_seen.lock();

        let mut net: BTreeMap<ObjectId, NetChange> = BTreeMap::new();
        for entry in state
            .log
            .iter()
            .filter(|e| e.generation > last_seen && e.client != self.client)
        {
            for (id, _) in &entry.created {
                net.insert(*id, NetChange::Created);
            }
            for id in &entry.modified {
                net.entry(*id).or_insert(NetChange::Modified);
            }
            for id in &entry.deleted {
                let next = match net.get(id) {
                    Some(NetChange::Created) => NetChange::Vanished,
                    _ => NetChange::Deleted,
                };
                net.insert(*id, next);
            }
        }

        let mut changes = ForeignChanges {
            cursor: CommitCursor(state.generation),
            ..ForeignChanges::default()
        };
        for (id, change) in net {
            match change {
                NetChange::Created | NetChange::Modified => {
                    // A later commit of ours may have deleted it already.
                    let Some(snapshot) = state.decode(id)? else {
                        continue;
                    };
                    if change == NetChange::Created {
                        changes.created.push(snapshot);
                    } else {
                        changes.modified.push(snapshot);
                    }
                }
                NetChange::Deleted => changes.deleted.push(id),
                NetChange::Vanished => {}
            }
        }
        Ok(changes)
    }

    fn mark_seen(&self, cursor: CommitCursor) -> StorageResult<()> {
        self.state.lock().take_failure()?;
        let mut last_seen = self.last_seen.lock();
        *last_seen = (*last_seen).max(cursor.0);
        Ok(())
    }

    fn version_stamp(&self) -> StorageResult<VersionStamp> {
        let mut state = self.state.lock();
        state.take_failure()?;
        Ok(VersionStamp(state.generation))
    }

    fn new_objects_since_version(
        &self,
        stamp: VersionStamp,
        class_name: &str,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock();
        state.take_failure()?;
        if stamp.0 > state.generation {
            return Ok(true);
        }
        Ok(state
            .log
            .iter()
            .filter(|e| e.generation > stamp.0)
            .any(|e| e.created.iter().any(|(_, class)| class == class_name)))
    }

    fn load_all(&self) -> StorageResult<(Vec<Snapshot>, CommitCursor)> {
        let mut state = self.state.lock();
        state.take_failure()?;
        let mut snapshots = Vec::with_capacity(state.objects.len());
        for id in state.objects.keys() {
            if let Some(snapshot) = state.decode(*id)? {
                snapshots.push(snapshot);
            }
        }
        Ok((snapshots, CommitCursor(state.generation)))
    }
}
