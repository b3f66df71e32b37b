//! Saving, discarding and loading.

use super::service::{Committer, TransactionService};
use crate::error::{CoreError, CoreResult};
use crate::reconcile::{ChangeReconciler, ConflictReport, LocalChanges};
use crate::types::{ClassId, Direction, SequenceNumber, StackId};
use crate::undo::UndoStack;
use crate::unit_of_work::{ChangeSet, UnitOfWork};
use lcmdb_storage::{CommitBatch, ForeignChanges, VersionStamp};
use std::cmp::Reverse;
use tracing::{debug, info, warn};

/// Net objects one save sent to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Objects created.
    pub created: usize,
    /// Objects modified.
    pub modified: usize,
    /// Objects deleted.
    pub deleted: usize,
    /// Batches of foreign changes merged before committing.
    pub reconciled_rounds: u32,
}

/// What a save did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Nothing local had to be written. Foreign changes may still have been
    /// merged.
    NothingToSave {
        /// Batches of foreign changes merged.
        reconciled_rounds: u32,
    },
    /// Local changes reached the store, or the commit worker.
    Saved(SaveSummary),
    /// Foreign changes conflict with local work. Nothing was merged or
    /// committed and local units are unchanged.
    Conflict(ConflictReport),
}

impl TransactionService {
    /// Merges unseen foreign changes and commits local work.
    ///
    /// Conflicting foreign changes stop the save before anything is applied;
    /// discarding local work then lets the next save merge them.
    ///
    /// # Errors
    ///
    /// Saving inside a task or during undo is misuse. Store failures that
    /// outlast the retry policy surface as [`CoreError::ConnectionLost`].
    pub fn save(&mut self) -> CoreResult<SaveOutcome> {
        if self.active.is_some() {
            return Err(self.misuse("cannot save while a task is open"));
        }
        if self.undo_redo_in_progress {
            return Err(self.misuse("cannot save during undo or redo"));
        }

        let mut rounds = 0;
        loop {
            let foreign = self
                .retry
                .run("unseen_foreign_changes", || self.store.unseen_foreign_changes())?;
            if foreign.is_empty() {
                break;
            }
            if rounds >= self.config.max_reconcile_rounds {
                warn!(rounds, "foreign changes keep arriving");
                return Err(CoreError::ReconcileLimit { rounds });
            }
            if let Some(report) = self.merge_foreign(&foreign)? {
                return Ok(SaveOutcome::Conflict(report));
            }
            rounds += 1;
        }

        let mut changes = ChangeSet::default();
        for stack in self.stacks.values() {
            for unit in stack.applied_unsaved() {
                unit.gather_changes(&mut changes);
            }
            for unit in stack.undone_unsaved() {
                unit.gather_inverse_changes(&mut changes);
            }
        }
        changes.normalize();

        if changes.is_empty() {
            self.finish_save();
            debug!(rounds, "nothing to save");
            return Ok(SaveOutcome::NothingToSave {
                reconciled_rounds: rounds,
            });
        }

        let batch = self.with_repo(|repo| {
            let mut batch = CommitBatch {
                deleted: changes.deleted.iter().copied().collect(),
                ..CommitBatch::default()
            };
            for (ids, out) in [
                (&changes.created, &mut batch.created),
                (&changes.modified, &mut batch.modified),
            ] {
                for &id in ids {
                    match repo.snapshot_of(id) {
                        Ok(snapshot) => out.push(snapshot),
                        Err(e) => warn!(object = %id, error = %e, "changed object is not resident, skipping"),
                    }
                }
            }
            batch
        });

        match &self.committer {
            Committer::Direct => {
                let accepted = self.retry.run("commit", || self.store.commit(&batch))?;
                if !accepted {
                    warn!(objects = batch.len(), "store rejected the commit");
                    return Err(CoreError::CommitRejected);
                }
            }
            Committer::Background(worker) => worker.submit(batch.clone())?,
        }

        self.finish_save();
        let summary = SaveSummary {
            created: batch.created.len(),
            modified: batch.modified.len(),
            deleted: batch.deleted.len(),
            reconciled_rounds: rounds,
        };
        info!(
            created = summary.created,
            modified = summary.modified,
            deleted = summary.deleted,
            rounds,
            "saved"
        );
        Ok(SaveOutcome::Saved(summary))
    }

    /// Checks one batch of foreign changes and merges it if nothing
    /// conflicts. Returns the conflicts otherwise.
    fn merge_foreign(&mut self, foreign: &ForeignChanges) -> CoreResult<Option<ConflictReport>> {
        let local = {
            let mut reverted: Vec<&UnitOfWork> = self.stacks.values().flat_map(UndoStack::undone_unsaved).collect();
            reverted.sort_by_key(|u| Reverse(u.sequence()));
            let mut applied: Vec<&UnitOfWork> = self.stacks.values().flat_map(UndoStack::applied_unsaved).collect();
            applied.sort_by_key(|u| u.sequence());
            LocalChanges::collect(
                reverted
                    .into_iter()
                    .map(|u| (u, Direction::Backward))
                    .chain(applied.into_iter().map(|u| (u, Direction::Forward))),
            )
        };

        let report = self.with_repo(|repo| ChangeReconciler::new(&self.schema, foreign, &local).check(repo));
        if !report.is_empty() {
            warn!(conflicts = report.len(), "foreign changes conflict with local work");
            for conflict in &report.conflicts {
                debug!(%conflict, "conflict");
            }
            self.conflict_pending = true;
            return Ok(Some(report));
        }

        let sequence = self.splice_sequence();
        let (unit, notifications) = {
            let mut guard = self.graph.write();
            let mut units: Vec<&mut UnitOfWork> = self
                .stacks
                .values_mut()
                .flat_map(|s| s.rebase_targets_mut())
                .collect();
            let reconciler = ChangeReconciler::new(&self.schema, foreign, &local);
            reconciler.reconcile(&mut **guard, &mut units, sequence)?
        };
        self.broadcast(&notifications);
        if unit.is_data_change() {
            self.foreign_units.push(unit);
        }
        self.retry.run("mark_seen", || self.store.mark_seen(foreign.cursor))?;
        info!(
            created = foreign.created.len(),
            modified = foreign.modified.len(),
            deleted = foreign.deleted.len(),
            "merged foreign changes"
        );
        Ok(None)
    }

    /// Picks the sequence number for merged foreign changes.
    ///
    /// The merged unit goes directly below the oldest unsaved or reverted
    /// local unit, so later local work stays later and undo of saved work
    /// still sees the foreign unit as newer.
    fn splice_sequence(&mut self) -> SequenceNumber {
        let oldest = self
            .stacks
            .values()
            .flat_map(|s| s.applied_unsaved().chain(s.undone_unsaved()).chain(s.redoable()))
            .map(UnitOfWork::sequence)
            .min();
        let Some(at) = oldest else {
            return self.allocate_sequence();
        };
        let bump = |unit: &mut UnitOfWork| {
            if unit.sequence() >= at {
                unit.set_sequence(unit.sequence().next());
            }
        };
        for stack in self.stacks.values_mut() {
            stack.units_mut().for_each(bump);
        }
        self.foreign_units.iter_mut().for_each(bump);
        self.next_sequence = self.next_sequence.next();
        at
    }

    fn finish_save(&mut self) {
        for stack in self.stacks.values_mut() {
            stack.mark_saved();
        }
        // Foreign and saved non-undoable units only matter to undo or redo
        // of older units.
        let oldest = self
            .stacks
            .values()
            .flat_map(|s| s.reachable())
            .map(UnitOfWork::sequence)
            .min();
        match oldest {
            Some(oldest) => self.foreign_units.retain(|u| u.sequence() > oldest),
            None => self.foreign_units.clear(),
        }
        for stack in self.stacks.values_mut() {
            stack.prune_history(oldest);
        }
        self.conflict_pending = false;
        self.last_save = self.clock.instant();
    }

    /// Throws away everything done since the last save.
    ///
    /// Unsaved units are reverted newest first, saved units that were undone
    /// are re-applied, and redo stacks are cleared.
    ///
    /// # Errors
    ///
    /// Discarding inside a task is misuse. If a unit fails to apply, the
    /// error is returned and the graph may be partly reverted.
    pub fn discard_unsaved_changes(&mut self) -> CoreResult<()> {
        if self.active.is_some() {
            return Err(self.misuse("cannot discard while a task is open"));
        }

        let mut applied: Vec<(StackId, UnitOfWork)> = Vec::new();
        let mut reverted: Vec<(StackId, UnitOfWork)> = Vec::new();
        for (id, stack) in &mut self.stacks {
            applied.extend(stack.take_applied_unsaved().into_iter().map(|u| (*id, u)));
            reverted.extend(stack.take_undone_unsaved().into_iter().map(|u| (*id, u)));
            stack.clear_redo();
        }
        applied.sort_by_key(|(_, u)| Reverse(u.sequence()));
        reverted.sort_by_key(|(_, u)| u.sequence());
        let (undone, redone) = (applied.len(), reverted.len());

        let mut notifications = Vec::new();
        {
            let mut guard = self.graph.write();
            for (_, unit) in &mut applied {
                unit.undo(&mut **guard)?;
                notifications.extend(unit.notifications(Direction::Backward, &**guard));
            }
            for (stack, mut unit) in reverted {
                unit.redo(&mut **guard)?;
                notifications.extend(unit.notifications(Direction::Forward, &**guard));
                if let Some(stack) = self.stacks.get_mut(&stack) {
                    stack.push_redone(unit);
                }
            }
        }

        self.broadcast(&notifications);
        self.conflict_pending = false;
        self.last_activity = self.clock.instant();
        info!(undone, redone, "unsaved changes discarded");
        Ok(())
    }

    /// Loads every stored object into the graph and acknowledges the
    /// store's history up to now.
    ///
    /// Returns the number of objects loaded.
    ///
    /// # Errors
    ///
    /// Loading inside a task is misuse. Snapshots that do not fit the schema
    /// fail the load.
    pub fn load_from_store(&mut self) -> CoreResult<usize> {
        if self.active.is_some() {
            return Err(self.misuse("cannot load while a task is open"));
        }
        let (snapshots, cursor) = self.retry.run("load_all", || self.store.load_all())?;
        {
            let mut guard = self.graph.write();
            let repo = &mut **guard;
            // Shells first so owners resolve whatever the snapshot order.
            for snapshot in &snapshots {
                if !repo.has_object(snapshot.guid) {
                    let class = self.schema.class_by_name(&snapshot.class)?;
                    repo.register_created(snapshot.guid, class, None)?;
                }
            }
            for snapshot in &snapshots {
                repo.materialize_from_snapshot(snapshot)?;
            }
        }
        self.retry.run("mark_seen", || self.store.mark_seen(cursor))?;
        info!(objects = snapshots.len(), "loaded from store");
        Ok(snapshots.len())
    }

    /// Returns the store's current version, for later
    /// [`TransactionService::new_objects_since_version`] checks.
    ///
    /// # Errors
    ///
    /// Fails if the store stays unreachable.
    pub fn version_stamp(&self) -> CoreResult<VersionStamp> {
        self.retry.run("version_stamp", || self.store.version_stamp())
    }

    /// Returns true if objects of `class` may have been created in the
    /// store since `stamp`.
    ///
    /// # Errors
    ///
    /// Fails for unknown classes or if the store stays unreachable.
    pub fn new_objects_since_version(&self, stamp: VersionStamp, class: ClassId) -> CoreResult<bool> {
        let name = self.schema.class_name(class)?;
        self.retry
            .run("new_objects_since_version", || self.store.new_objects_since_version(stamp, name))
    }

    /// Waits for the background worker to commit everything queued.
    ///
    /// # Errors
    ///
    /// Returns the error of a failed background commit, once.
    pub fn flush(&self) -> CoreResult<()> {
        match &self.committer {
            Committer::Direct => Ok(()),
            Committer::Background(worker) => worker.flush(),
        }
    }

    /// Closes the service, draining the background worker.
    ///
    /// Unsaved work is dropped with a warning; call
    /// [`TransactionService::save`] first to keep it.
    ///
    /// # Errors
    ///
    /// Returns the last background commit error.
    pub fn close(mut self) -> CoreResult<()> {
        if self.active.is_some() {
            self.rollback_open_task();
        }
        if self.unsaved_work() {
            warn!("closing with unsaved work");
        }
        let committer = std::mem::replace(&mut self.committer, Committer::Direct);
        let result = match committer {
            Committer::Direct => Ok(()),
            Committer::Background(worker) => worker.shutdown(),
        };
        info!("transaction service closed");
        result
    }
}
