//! Background committer.
//!
//! Saves hand their batch to a worker thread and return at once. Batches
//! that pile up while a commit is in flight are folded together per object,
//! so the store sees each object once per round trip.

use crate::error::{CoreError, CoreResult};
use crate::retry::RetryPolicy;
use lcmdb_codec::{ObjectId, Snapshot};
use lcmdb_storage::{BackingStore, CommitBatch};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Latest pending change of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingOp {
    Create(Snapshot),
    Modify(Snapshot),
    Delete,
}

impl PendingOp {
    /// Folds a newer op onto an older one.
    fn absorb(older: Self, newer: Self) -> Self {
        match (older, newer) {
            (Self::Create(_), Self::Modify(snapshot)) => Self::Create(snapshot),
            (_, newer) => newer,
        }
    }
}

#[derive(Debug, Default)]
struct WorkerQueue {
    pending: BTreeMap<ObjectId, PendingOp>,
    in_flight: bool,
    /// Set after a failed commit; cleared by the next submit or flush.
    stalled: bool,
    shutdown: bool,
    last_error: Option<CoreError>,
    commits: u64,
}

impl WorkerQueue {
    fn push(&mut self, id: ObjectId, op: PendingOp) {
        let op = match self.pending.remove(&id) {
            Some(older) => PendingOp::absorb(older, op),
            None => op,
        };
        self.pending.insert(id, op);
    }

    /// Puts back ops from a failed commit underneath anything newer.
    fn requeue(&mut self, failed: BTreeMap<ObjectId, PendingOp>) {
        for (id, older) in failed {
            let op = match self.pending.remove(&id) {
                Some(newer) => PendingOp::absorb(older, newer),
                None => older,
            };
            self.pending.insert(id, op);
        }
    }

    fn has_work(&self) -> bool {
        !self.pending.is_empty() && !self.stalled
    }
}

fn to_batch(ops: &BTreeMap<ObjectId, PendingOp>) -> CommitBatch {
    let mut batch = CommitBatch::default();
    for (id, op) in ops {
        match op {
            PendingOp::Create(snapshot) => batch.created.push(snapshot.clone()),
            PendingOp::Modify(snapshot) => batch.modified.push(snapshot.clone()),
            PendingOp::Delete => batch.deleted.push(*id),
        }
    }
    batch
}

#[derive(Debug, Default)]
struct WorkerShared {
    queue: Mutex<WorkerQueue>,
    wakeup: Condvar,
    idle: Condvar,
}

/// Commits batches on a dedicated thread.
#[derive(Debug)]
pub struct CommitWorker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl CommitWorker {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CommitWorkerStopped`] if the thread cannot be
    /// spawned.
    pub fn spawn(store: Arc<dyn BackingStore>, retry: RetryPolicy) -> CoreResult<Self> {
        let shared = Arc::new(WorkerShared::default());
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("lcmdb-commit".into())
            .spawn(move || run(&worker_shared, store.as_ref(), &retry))
            .map_err(|e| {
                error!(error = %e, "failed to spawn commit worker");
                CoreError::CommitWorkerStopped
            })?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Queues a batch.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::CommitWorkerStopped`] after shutdown.
    pub fn submit(&self, batch: CommitBatch) -> CoreResult<()> {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(CoreError::CommitWorkerStopped);
        }
        for snapshot in batch.created {
            queue.push(snapshot.guid, PendingOp::Create(snapshot));
        }
        for snapshot in batch.modified {
            queue.push(snapshot.guid, PendingOp::Modify(snapshot));
        }
        for id in batch.deleted {
            queue.push(id, PendingOp::Delete);
        }
        queue.stalled = false;
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Waits until every queued change reached the store or failed.
    ///
    /// A stalled queue is retried only once its error has been reported.
    ///
    /// # Errors
    ///
    /// Returns the error of the most recent failed commit, once.
    pub fn flush(&self) -> CoreResult<()> {
        let mut queue = self.shared.queue.lock();
        if queue.last_error.is_none() {
            queue.stalled = false;
            self.shared.wakeup.notify_one();
        }
        while (queue.has_work() && !queue.shutdown) || queue.in_flight {
            self.shared.idle.wait(&mut queue);
        }
        match queue.last_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Returns the number of objects waiting to be committed.
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len()
    }

    /// Returns the number of successful store commits.
    pub fn commits(&self) -> u64 {
        self.shared.queue.lock().commits
    }

    /// Drains the queue and stops the thread.
    ///
    /// # Errors
    ///
    /// Returns the last commit error, or [`CoreError::CommitWorkerStopped`]
    /// if the thread panicked.
    pub fn shutdown(mut self) -> CoreResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> CoreResult<()> {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.stalled = false;
            self.shared.wakeup.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| CoreError::CommitWorkerStopped)?;
        }
        let mut queue = self.shared.queue.lock();
        if !queue.pending.is_empty() {
            warn!(objects = queue.pending.len(), "commit worker stopped with unsaved objects");
        }
        match queue.last_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for CommitWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "commit worker shut down with an error");
            }
        }
    }
}

fn run(shared: &WorkerShared, store: &dyn BackingStore, retry: &RetryPolicy) {
    loop {
        let ops = {
            let mut queue = shared.queue.lock();
            while !queue.has_work() && !queue.shutdown {
                shared.wakeup.wait(&mut queue);
            }
            if !queue.has_work() {
                shared.idle.notify_all();
                break;
            }
            queue.in_flight = true;
            std::mem::take(&mut queue.pending)
        };

        let batch = to_batch(&ops);
        debug!(objects = batch.len(), "background commit");
        let result = retry
            .run("commit", || store.commit(&batch))
            .and_then(|accepted| {
                if accepted {
                    Ok(())
                } else {
                    Err(CoreError::CommitRejected)
                }
            });

        let mut queue = shared.queue.lock();
        queue.in_flight = false;
        match result {
            Ok(()) => queue.commits += 1,
            Err(e) => {
                error!(error = %e, objects = ops.len(), "background commit failed");
                queue.requeue(ops);
                queue.stalled = true;
                queue.last_error = Some(e);
            }
        }
        shared.idle.notify_all();
    }
}
