//! One undo stack and its task state machine.

use crate::error::{CoreError, CoreResult};
use crate::types::{MarkHandle, SequenceNumber, StackId};
use crate::unit_of_work::UnitOfWork;
use std::collections::BTreeMap;

/// Where a stack is in the begin/end task cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// No task open.
    #[default]
    ReadyForBeginTask,
    /// A task is open and recording changes.
    ProcessingDataChanges,
    /// The task has ended and observers are being told.
    BroadcastingPropChanges,
}

/// Undoable and redoable units of one editing context.
///
/// The unsaved counter tracks the distance from the last save: a positive
/// value counts unsaved units on top of the undo stack, a negative value
/// counts saved units that were undone and sit on top of the redo stack.
#[derive(Debug)]
pub struct UndoStack {
    id: StackId,
    state: TaskState,
    current: Option<UnitOfWork>,
    undo: Vec<UnitOfWork>,
    redo: Vec<UnitOfWork>,
    marks: BTreeMap<MarkHandle, usize>,
    unsaved: i64,
    pending_inverse: Vec<UnitOfWork>,
    non_undoable: Vec<UnitOfWork>,
    saved_non_undoable: Vec<UnitOfWork>,
    suppress_date_modified: bool,
}

impl UndoStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new(id: StackId) -> Self {
        Self {
            id,
            state: TaskState::default(),
            current: None,
            undo: Vec::new(),
            redo: Vec::new(),
            marks: BTreeMap::new(),
            unsaved: 0,
            pending_inverse: Vec::new(),
            non_undoable: Vec::new(),
            saved_non_undoable: Vec::new(),
            suppress_date_modified: false,
        }
    }

    /// Returns the stack id.
    #[must_use]
    pub fn id(&self) -> StackId {
        self.id
    }

    /// Returns the task state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    /// Opens a task with a fresh unit.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] unless the stack is ready.
    pub fn begin_task(&mut self, unit: UnitOfWork) -> CoreResult<()> {
        if self.state != TaskState::ReadyForBeginTask {
            return Err(CoreError::invalid_operation(format!(
                "cannot begin a task on {} in state {:?}",
                self.id, self.state
            )));
        }
        self.current = Some(unit);
        self.suppress_date_modified = false;
        self.state = TaskState::ProcessingDataChanges;
        Ok(())
    }

    /// Returns the open unit.
    #[must_use]
    pub fn current(&self) -> Option<&UnitOfWork> {
        self.current.as_ref()
    }

    /// Returns the open unit for recording.
    pub fn current_mut(&mut self) -> Option<&mut UnitOfWork> {
        self.current.as_mut()
    }

    /// Closes the open unit and hands it back.
    pub(crate) fn take_current(&mut self) -> Option<UnitOfWork> {
        self.current.take()
    }

    /// Whether the open task skips `DateModified` stamping.
    #[must_use]
    pub fn date_modified_suppressed(&self) -> bool {
        self.suppress_date_modified
    }

    pub(crate) fn suppress_date_modified(&mut self) {
        self.suppress_date_modified = true;
    }

    /// Pushes a finished unit.
    ///
    /// An undoable unit clears the redo stack. Saved units that were undone
    /// are kept aside so their reversal still reaches the store.
    pub fn push_done(&mut self, unit: UnitOfWork) {
        if !unit.is_undoable() {
            self.non_undoable.push(unit);
            return;
        }
        if self.unsaved < 0 {
            let keep = usize::try_from(-self.unsaved).unwrap_or(usize::MAX);
            let start = self.redo.len().saturating_sub(keep);
            self.pending_inverse.extend(self.redo.drain(start..));
            self.unsaved = 0;
        }
        self.redo.clear();
        self.undo.push(unit);
        self.unsaved += 1;
    }

    /// Returns the unit the next undo would revert.
    #[must_use]
    pub fn peek_undo(&self) -> Option<&UnitOfWork> {
        self.undo.last()
    }

    /// Returns the unit the next redo would re-apply.
    #[must_use]
    pub fn peek_redo(&self) -> Option<&UnitOfWork> {
        self.redo.last()
    }

    /// Returns true if there is something to undo.
    #[must_use]
    pub fn has_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Returns true if there is something to redo.
    #[must_use]
    pub fn has_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub(crate) fn pop_for_undo(&mut self) -> Option<UnitOfWork> {
        let unit = self.undo.pop()?;
        self.unsaved -= 1;
        let depth = self.undo.len();
        self.marks.retain(|_, d| *d <= depth);
        Some(unit)
    }

    pub(crate) fn push_undone(&mut self, unit: UnitOfWork) {
        self.redo.push(unit);
    }

    pub(crate) fn abort_undo(&mut self, unit: UnitOfWork) {
        self.undo.push(unit);
        self.unsaved += 1;
    }

    pub(crate) fn pop_for_redo(&mut self) -> Option<UnitOfWork> {
        let unit = self.redo.pop()?;
        self.unsaved += 1;
        Some(unit)
    }

    pub(crate) fn push_redone(&mut self, unit: UnitOfWork) {
        self.undo.push(unit);
    }

    pub(crate) fn abort_redo(&mut self, unit: UnitOfWork) {
        self.redo.push(unit);
        self.unsaved -= 1;
    }

    /// Binds `handle` to the current undo depth.
    pub fn mark(&mut self, handle: MarkHandle) {
        self.marks.insert(handle, self.undo.len());
    }

    /// Returns true if `handle` is a mark on this stack.
    #[must_use]
    pub fn has_mark(&self, handle: MarkHandle) -> bool {
        self.marks.contains_key(&handle)
    }

    /// Returns true if any mark is set.
    #[must_use]
    pub fn has_marks(&self) -> bool {
        !self.marks.is_empty()
    }

    /// Merges every unit pushed since the mark into one and clears redo.
    ///
    /// The merged unit keeps the sequence number of the oldest unit. Returns
    /// false if nothing was pushed since the mark.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MarkNotFound`] for an unknown mark.
    pub fn collapse_to_mark(&mut self, handle: MarkHandle) -> CoreResult<bool> {
        let depth = self
            .marks
            .remove(&handle)
            .ok_or(CoreError::MarkNotFound { mark: handle })?;
        self.marks.retain(|_, d| *d <= depth);
        if self.undo.len() <= depth {
            return Ok(false);
        }

        let tail = self.undo.split_off(depth);
        let count = i64::try_from(tail.len()).unwrap_or(i64::MAX);
        if self.unsaved > 0 {
            let merged_unsaved = self.unsaved.min(count);
            self.unsaved = self.unsaved - merged_unsaved + 1;
        } else if self.unsaved < 0 {
            let keep = usize::try_from(-self.unsaved).unwrap_or(usize::MAX);
            let start = self.redo.len().saturating_sub(keep);
            self.pending_inverse.extend(self.redo.drain(start..));
            self.unsaved = 0;
        }
        self.redo.clear();

        let mut units = tail.into_iter();
        if let Some(mut merged) = units.next() {
            for later in units {
                merged.merge(later);
            }
            self.undo.push(merged);
        }
        Ok(true)
    }

    /// Drops every unit pushed since the mark.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MarkNotFound`] for an unknown mark and
    /// [`CoreError::DiscardWouldLoseData`], leaving the stack untouched, if a
    /// unit since the mark changed stored data.
    pub fn discard_to_mark(&mut self, handle: MarkHandle) -> CoreResult<()> {
        let depth = *self
            .marks
            .get(&handle)
            .ok_or(CoreError::MarkNotFound { mark: handle })?;
        if self
            .undo
            .get(depth..)
            .unwrap_or_default()
            .iter()
            .any(UnitOfWork::is_data_change)
        {
            return Err(CoreError::DiscardWouldLoseData { mark: handle });
        }
        self.marks.remove(&handle);
        self.marks.retain(|_, d| *d <= depth);
        let dropped = self.undo.len().saturating_sub(depth);
        self.undo.truncate(depth);
        if self.unsaved > 0 {
            self.unsaved -= self.unsaved.min(i64::try_from(dropped).unwrap_or(i64::MAX));
        }
        Ok(())
    }

    /// Returns the unsaved counter.
    #[must_use]
    pub fn unsaved_counter(&self) -> i64 {
        self.unsaved
    }

    /// Returns true if anything on this stack still has to reach the store.
    #[must_use]
    pub fn unsaved_work(&self) -> bool {
        self.unsaved != 0 || !self.pending_inverse.is_empty() || !self.non_undoable.is_empty()
    }

    /// Declares the current state saved.
    ///
    /// Saved non-undoable units stay applied history until
    /// [`UndoStack::prune_history`] drops them.
    pub fn mark_saved(&mut self) {
        self.unsaved = 0;
        self.pending_inverse.clear();
        self.saved_non_undoable.append(&mut self.non_undoable);
    }

    /// Drops saved non-undoable units no undo or redo can reach: those not
    /// newer than `oldest`, or all of them when nothing is left to undo or
    /// redo anywhere.
    pub(crate) fn prune_history(&mut self, oldest: Option<SequenceNumber>) {
        match oldest {
            Some(oldest) => self.saved_non_undoable.retain(|u| u.sequence() > oldest),
            None => self.saved_non_undoable.clear(),
        }
    }

    fn unsaved_len(&self) -> usize {
        usize::try_from(self.unsaved.max(0)).unwrap_or(usize::MAX)
    }

    fn undone_unsaved_len(&self) -> usize {
        usize::try_from((-self.unsaved).max(0)).unwrap_or(usize::MAX)
    }

    /// Units applied since the last save.
    pub fn applied_unsaved(&self) -> impl Iterator<Item = &UnitOfWork> {
        let start = self.undo.len().saturating_sub(self.unsaved_len());
        self.undo[start..].iter().chain(self.non_undoable.iter())
    }

    /// Saved units that are currently reverted.
    pub fn undone_unsaved(&self) -> impl Iterator<Item = &UnitOfWork> {
        let start = self.redo.len().saturating_sub(self.undone_unsaved_len());
        self.redo[start..].iter().chain(self.pending_inverse.iter())
    }

    /// Units currently applied to the graph, including saved non-undoable
    /// units that later undo checks still have to see.
    pub fn applied(&self) -> impl Iterator<Item = &UnitOfWork> {
        self.undo
            .iter()
            .chain(self.saved_non_undoable.iter())
            .chain(self.non_undoable.iter())
    }

    /// Units an undo or redo on this stack may still reach.
    pub fn reachable(&self) -> impl Iterator<Item = &UnitOfWork> {
        self.undo.iter().chain(self.redo.iter())
    }

    /// Units on the redo stack.
    pub fn redoable(&self) -> impl Iterator<Item = &UnitOfWork> {
        self.redo.iter()
    }

    /// Every unit this stack holds outside an open task.
    pub(crate) fn units_mut(&mut self) -> impl Iterator<Item = &mut UnitOfWork> {
        self.undo
            .iter_mut()
            .chain(self.redo.iter_mut())
            .chain(self.non_undoable.iter_mut())
            .chain(self.saved_non_undoable.iter_mut())
            .chain(self.pending_inverse.iter_mut())
    }

    /// Consumes the stack, returning every unit still applied to the graph.
    pub(crate) fn into_applied(self) -> Vec<UnitOfWork> {
        let mut units = self.undo;
        units.extend(self.saved_non_undoable);
        units.extend(self.non_undoable);
        units
    }

    /// Units a foreign merge must rewrite: those applied since the last
    /// save and those whose effect is currently reverted.
    pub(crate) fn rebase_targets_mut(&mut self) -> impl Iterator<Item = &mut UnitOfWork> {
        let start = self.undo.len().saturating_sub(self.unsaved_len());
        self.undo[start..]
            .iter_mut()
            .chain(self.non_undoable.iter_mut())
            .chain(self.redo.iter_mut())
            .chain(self.pending_inverse.iter_mut())
    }

    /// Removes the units applied since the last save, newest last.
    pub(crate) fn take_applied_unsaved(&mut self) -> Vec<UnitOfWork> {
        let start = self.undo.len().saturating_sub(self.unsaved_len());
        let mut taken = self.undo.split_off(start);
        taken.append(&mut self.non_undoable);
        let depth = self.undo.len();
        self.marks.retain(|_, d| *d <= depth);
        if self.unsaved > 0 {
            self.unsaved = 0;
        }
        taken
    }

    /// Removes the saved units that are currently reverted.
    pub(crate) fn take_undone_unsaved(&mut self) -> Vec<UnitOfWork> {
        let start = self.redo.len().saturating_sub(self.undone_unsaved_len());
        let mut taken = self.redo.split_off(start);
        taken.append(&mut self.pending_inverse);
        if self.unsaved < 0 {
            self.unsaved = 0;
        }
        taken
    }

    pub(crate) fn clear_redo(&mut self) {
        self.redo.clear();
    }

    /// Returns the number of undoable units.
    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    /// Returns the number of redoable units.
    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeRecord, FieldChange};
    use crate::types::{FieldId, SequenceNumber};
    use lcmdb_codec::ObjectId;

    fn data_unit(seq: u64) -> UnitOfWork {
        let mut unit = UnitOfWork::new(SequenceNumber::new(seq), true, "Undo", "Redo");
        unit.add_action(ChangeRecord::Integer(FieldChange::new(
            ObjectId::new(),
            FieldId::new(1001),
            0,
            i64::try_from(seq).unwrap(),
        )));
        unit
    }

    fn empty_unit(seq: u64) -> UnitOfWork {
        UnitOfWork::new(SequenceNumber::new(seq), true, "Undo", "Redo")
    }

    #[test]
    fn task_state_machine() {
        let mut stack = UndoStack::new(StackId(1));
        stack.begin_task(empty_unit(1)).unwrap();
        assert_eq!(stack.state(), TaskState::ProcessingDataChanges);
        assert!(stack.begin_task(empty_unit(2)).is_err());
        assert!(stack.take_current().is_some());
    }

    #[test]
    fn unsaved_counter_follows_undo_and_redo() {
        let mut stack = UndoStack::new(StackId(1));
        stack.push_done(data_unit(1));
        stack.push_done(data_unit(2));
        assert_eq!(stack.unsaved_counter(), 2);
        stack.mark_saved();

        let unit = stack.pop_for_undo().unwrap();
        stack.push_undone(unit);
        assert_eq!(stack.unsaved_counter(), -1);
        assert_eq!(stack.undone_unsaved().count(), 1);

        let unit = stack.pop_for_redo().unwrap();
        stack.push_redone(unit);
        assert_eq!(stack.unsaved_counter(), 0);
        assert!(!stack.unsaved_work());
    }

    #[test]
    fn new_work_after_undoing_saved_unit_keeps_its_inverse() {
        let mut stack = UndoStack::new(StackId(1));
        stack.push_done(data_unit(1));
        stack.mark_saved();
        let unit = stack.pop_for_undo().unwrap();
        stack.push_undone(unit);

        stack.push_done(data_unit(2));
        assert_eq!(stack.unsaved_counter(), 1);
        assert!(!stack.has_redo());
        assert_eq!(stack.undone_unsaved().count(), 1);
        assert_eq!(stack.applied_unsaved().count(), 1);
    }

    #[test]
    fn non_undoable_units_keep_redo() {
        let mut stack = UndoStack::new(StackId(1));
        stack.push_done(data_unit(1));
        let unit = stack.pop_for_undo().unwrap();
        stack.push_undone(unit);

        stack.push_done(UnitOfWork::new(SequenceNumber::new(2), false, "", ""));
        assert!(stack.has_redo());
        assert!(stack.unsaved_work());
    }

    #[test]
    fn saved_non_undoable_units_stay_applied_until_pruned() {
        let mut stack = UndoStack::new(StackId(1));
        stack.push_done(data_unit(1));
        stack.push_done(UnitOfWork::new(SequenceNumber::new(2), false, "", ""));
        stack.mark_saved();

        assert!(!stack.unsaved_work());
        assert_eq!(stack.applied().count(), 2);
        assert_eq!(stack.reachable().count(), 1);

        stack.prune_history(Some(SequenceNumber::new(1)));
        assert_eq!(stack.applied().count(), 2);
        stack.prune_history(Some(SequenceNumber::new(2)));
        assert_eq!(stack.applied().count(), 1);
        stack.prune_history(None);
        assert_eq!(stack.applied().count(), 1);
    }

    #[test]
    fn collapse_merges_and_keeps_oldest_sequence() {
        let mut stack = UndoStack::new(StackId(1));
        stack.push_done(data_unit(1));
        stack.mark(MarkHandle(7));
        stack.push_done(data_unit(2));
        stack.push_done(data_unit(3));

        assert!(stack.collapse_to_mark(MarkHandle(7)).unwrap());
        assert_eq!(stack.undo_len(), 2);
        assert_eq!(stack.peek_undo().unwrap().sequence(), SequenceNumber::new(2));
        assert_eq!(stack.peek_undo().unwrap().len(), 2);
        assert_eq!(stack.unsaved_counter(), 2);
        assert!(!stack.has_marks());
    }

    #[test]
    fn discard_refuses_data_changes() {
        let mut stack = UndoStack::new(StackId(1));
        stack.mark(MarkHandle(1));
        stack.push_done(data_unit(1));
        assert!(matches!(
            stack.discard_to_mark(MarkHandle(1)),
            Err(CoreError::DiscardWouldLoseData { .. })
        ));
        assert_eq!(stack.undo_len(), 1);

        stack.mark(MarkHandle(2));
        stack.push_done(empty_unit(2));
        stack.discard_to_mark(MarkHandle(2)).unwrap();
        assert_eq!(stack.undo_len(), 1);
        assert!(matches!(
            stack.discard_to_mark(MarkHandle(9)),
            Err(CoreError::MarkNotFound { .. })
        ));
    }

    #[test]
    fn undo_below_mark_drops_it() {
        let mut stack = UndoStack::new(StackId(1));
        stack.push_done(data_unit(1));
        stack.mark(MarkHandle(1));
        stack.pop_for_undo().unwrap();
        assert!(!stack.has_marks());
    }
}
