//! Channel-based fan-out of change notifications.
//!
//! A [`ChangeFeed`] is a ready-made [`ChangeObserver`]: register it with the
//! transaction service and hand receivers to threads that want to follow
//! edits without implementing the observer trait themselves.
//!
//! ```
//! use lcmdb_core::{ChangeFeed, ChangeObserver};
//! use std::sync::Arc;
//!
//! let feed = Arc::new(ChangeFeed::new());
//! let rx = feed.subscribe();
//! // service.add_observer(feed.clone());
//! feed.all_changes_done();
//! assert_eq!(feed.batch(), 1);
//! assert!(rx.try_recv().is_err());
//! ```

use crate::change::{ChangeNotification, ChangeObserver};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// A notification tagged with the broadcast it belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Broadcast counter, starting at 0 and bumped after each batch.
    pub batch: u64,
    /// The change.
    pub notification: ChangeNotification,
}

/// Distributes notifications to channel subscribers and keeps a bounded
/// history for polling.
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ChangeEvent>>>,
    history: RwLock<Vec<ChangeEvent>>,
    max_history: usize,
    batch: AtomicU64,
}

impl ChangeFeed {
    /// Creates a feed keeping up to 10 000 events.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_history(10_000)
    }

    /// Creates a feed with a specific history limit.
    #[must_use]
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
            batch: AtomicU64::new(0),
        }
    }

    /// Returns a receiver for all future events.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Returns the number of finished broadcasts.
    pub fn batch(&self) -> u64 {
        self.batch.load(Ordering::SeqCst)
    }

    /// Returns events from batches at or after `from_batch`, up to `limit`.
    pub fn poll(&self, from_batch: u64, limit: usize) -> Vec<ChangeEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| e.batch >= from_batch)
            .take(limit)
            .copied()
            .collect()
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the number of retained events.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }

    fn emit(&self, event: ChangeEvent) {
        {
            let mut history = self.history.write();
            history.push(event);
            if history.len() > self.max_history {
                let excess = history.len() - self.max_history;
                history.drain(0..excess);
            }
        }
        // Dropped receivers fall out here.
        self.subscribers.write().retain(|tx| tx.send(event).is_ok());
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeObserver for ChangeFeed {
    fn prop_changed(&self, change: &ChangeNotification) {
        self.emit(ChangeEvent {
            batch: self.batch(),
            notification: *change,
        });
    }

    fn all_changes_done(&self) {
        self.batch.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldId;
    use lcmdb_codec::ObjectId;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn note() -> ChangeNotification {
        ChangeNotification::new(ObjectId::new(), FieldId(1001), 0, 1, 0)
    }

    #[test]
    fn events_carry_their_batch() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        feed.prop_changed(&note());
        feed.all_changes_done();
        feed.prop_changed(&note());

        assert_eq!(rx.recv().unwrap().batch, 0);
        assert_eq!(rx.recv().unwrap().batch, 1);
        assert_eq!(feed.poll(1, 10).len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let feed = ChangeFeed::with_max_history(3);
        for _ in 0..5 {
            feed.prop_changed(&note());
        }
        assert_eq!(feed.history_len(), 3);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        drop(rx);
        let _live = feed.subscribe();
        feed.prop_changed(&note());
        assert_eq!(feed.subscriber_count(), 1);
    }

    #[test]
    fn receivers_work_across_threads() {
        let feed = Arc::new(ChangeFeed::new());
        let rx = feed.subscribe();
        let sender = Arc::clone(&feed);
        let expected = note();
        let handle = thread::spawn(move || sender.prop_changed(&expected));
        handle.join().unwrap();
        let event = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(event.notification, expected);
    }
}
