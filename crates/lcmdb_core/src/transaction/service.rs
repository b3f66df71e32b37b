//! Transaction service: task lifecycle, undo and redo across stacks.

use crate::change::{ChangeNotification, ChangeObserver, ChangeRecord};
use crate::clock::{Clock, SystemClock};
use crate::commit_worker::CommitWorker;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::repository::{InMemoryRepository, ObjectRepository};
use crate::retry::{ConnectionLossHandler, GiveUp, RetryPolicy};
use crate::schema::Schema;
use crate::types::{Direction, FieldId, MarkHandle, SequenceNumber, StackId};
use crate::undo::{TaskState, UndoStack};
use crate::unit_of_work::UnitOfWork;
use crate::value::FieldValue;
use lcmdb_codec::{ObjectId, Snapshot};
use lcmdb_storage::BackingStore;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub(super) type GraphLock = RwLock<Box<dyn ObjectRepository>>;
pub(super) type GraphWriteGuard = ArcRwLockWriteGuard<RawRwLock, Box<dyn ObjectRepository>>;

/// How saves reach the store.
pub(super) enum Committer {
    /// On the calling thread.
    Direct,
    /// Through the background worker.
    Background(CommitWorker),
}

/// Read-only access to the object graph for other threads.
///
/// Readers block while a task or an undo is in progress.
#[derive(Clone)]
pub struct GraphReader {
    graph: Arc<GraphLock>,
}

impl GraphReader {
    /// Waits for the graph and returns a read guard.
    pub fn read(&self) -> RwLockReadGuard<'_, Box<dyn ObjectRepository>> {
        self.graph.read()
    }

    /// Returns a read guard if no writer holds the graph.
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, Box<dyn ObjectRepository>>> {
        self.graph.try_read()
    }
}

impl fmt::Debug for GraphReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphReader").finish_non_exhaustive()
    }
}

/// Configures and opens a [`TransactionService`].
pub struct ServiceBuilder {
    schema: Arc<Schema>,
    store: Arc<dyn BackingStore>,
    config: Config,
    repository: Option<Box<dyn ObjectRepository>>,
    clock: Arc<dyn Clock>,
    loss_handler: Arc<dyn ConnectionLossHandler>,
}

impl ServiceBuilder {
    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Uses `repository` instead of a fresh in-memory one.
    #[must_use]
    pub fn repository(mut self, repository: Box<dyn ObjectRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Sets the time source.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets who decides about retrying once quick retries fail.
    #[must_use]
    pub fn connection_loss_handler(mut self, handler: Arc<dyn ConnectionLossHandler>) -> Self {
        self.loss_handler = handler;
        self
    }

    /// Opens the service with one empty undo stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the background commit worker cannot start.
    pub fn open(self) -> CoreResult<TransactionService> {
        let retry = RetryPolicy::new(self.config.retry.clone(), self.loss_handler);
        let committer = if self.config.background_commit {
            Committer::Background(CommitWorker::spawn(Arc::clone(&self.store), retry.clone())?)
        } else {
            Committer::Direct
        };
        let repository = self
            .repository
            .unwrap_or_else(|| Box::new(InMemoryRepository::new(Arc::clone(&self.schema))));
        let now = self.clock.instant();
        let first = StackId(1);
        let mut stacks = BTreeMap::new();
        stacks.insert(first, UndoStack::new(first));
        info!(
            classes = self.schema.class_count(),
            background_commit = self.config.background_commit,
            "transaction service opened"
        );
        Ok(TransactionService {
            config: self.config,
            schema: self.schema,
            graph: Arc::new(RwLock::new(repository)),
            store: self.store,
            retry,
            committer,
            stacks,
            current: first,
            active: None,
            write_guard: None,
            next_stack: 2,
            next_sequence: SequenceNumber::new(1),
            next_mark: 1,
            observers: Vec::new(),
            clock: self.clock,
            undo_redo_in_progress: false,
            conflict_pending: false,
            last_activity: now,
            last_save: now,
            foreign_units: Vec::new(),
        })
    }
}

/// Coordinates undo stacks, the object graph and the backing store.
///
/// ## Single writer
///
/// Mutation happens only inside a task. Beginning a task takes the graph's
/// write lock and ending or rolling it back releases it before observers
/// are told. Other threads read through a [`GraphReader`].
///
/// ## Sequence numbers
///
/// Every unit gets a number from one counter shared by all stacks. Undo of
/// a unit is refused while a later unit on any stack depends on it; redo is
/// refused while an earlier undone unit elsewhere would be skipped.
pub struct TransactionService {
    pub(super) config: Config,
    pub(super) schema: Arc<Schema>,
    pub(super) graph: Arc<GraphLock>,
    pub(super) store: Arc<dyn BackingStore>,
    pub(super) retry: RetryPolicy,
    pub(super) committer: Committer,
    pub(super) stacks: BTreeMap<StackId, UndoStack>,
    pub(super) current: StackId,
    pub(super) active: Option<StackId>,
    pub(super) write_guard: Option<GraphWriteGuard>,
    next_stack: u32,
    pub(super) next_sequence: SequenceNumber,
    next_mark: u64,
    observers: Vec<Arc<dyn ChangeObserver>>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) undo_redo_in_progress: bool,
    pub(super) conflict_pending: bool,
    pub(super) last_activity: Instant,
    pub(super) last_save: Instant,
    /// Applied foreign units, kept for undo interference checks.
    pub(super) foreign_units: Vec<UnitOfWork>,
}

impl fmt::Debug for TransactionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionService")
            .field("current", &self.current)
            .field("active", &self.active)
            .field("stacks", &self.stacks.len())
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl TransactionService {
    /// Starts configuring a service over `store`.
    pub fn builder(schema: Arc<Schema>, store: Arc<dyn BackingStore>) -> ServiceBuilder {
        ServiceBuilder {
            schema,
            store,
            config: Config::default(),
            repository: None,
            clock: Arc::new(SystemClock),
            loss_handler: Arc::new(GiveUp),
        }
    }

    /// Opens a service with an in-memory repository and the system clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the background commit worker cannot start.
    pub fn open(schema: Arc<Schema>, store: Arc<dyn BackingStore>, config: Config) -> CoreResult<Self> {
        Self::builder(schema, store).config(config).open()
    }

    /// Returns the schema.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a handle other threads can read the graph through.
    pub fn reader(&self) -> GraphReader {
        GraphReader {
            graph: Arc::clone(&self.graph),
        }
    }

    pub(super) fn allocate_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        sequence
    }

    /// Runs `f` against the graph, through the task's guard if one is held.
    pub(super) fn with_repo<R>(&self, f: impl FnOnce(&dyn ObjectRepository) -> R) -> R {
        match &self.write_guard {
            Some(guard) => f(&***guard),
            None => {
                let guard = self.graph.read();
                f(&**guard)
            }
        }
    }

    // ----- observers -----

    /// Registers an observer.
    pub fn add_observer(&mut self, observer: Arc<dyn ChangeObserver>) {
        self.observers.push(observer);
    }

    /// Removes an observer. Returns false if it was not registered.
    pub fn remove_observer(&mut self, observer: &Arc<dyn ChangeObserver>) -> bool {
        let before = self.observers.len();
        self.observers.retain(|o| !Arc::ptr_eq(o, observer));
        self.observers.len() != before
    }

    pub(super) fn broadcast(&self, notifications: &[ChangeNotification]) {
        if notifications.is_empty() {
            return;
        }
        debug!(count = notifications.len(), "broadcasting changes");
        for observer in &self.observers {
            for notification in notifications {
                observer.prop_changed(notification);
            }
            observer.all_changes_done();
        }
    }

    // ----- stacks -----

    /// Adds an undo stack and returns its id.
    pub fn create_undo_stack(&mut self) -> StackId {
        let id = StackId(self.next_stack);
        self.next_stack += 1;
        self.stacks.insert(id, UndoStack::new(id));
        debug!(stack = %id, "undo stack created");
        id
    }

    /// Makes `stack` the target of undo, redo and new tasks.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StackNotFound`] for an unknown stack.
    pub fn set_current_stack(&mut self, stack: StackId) -> CoreResult<()> {
        if !self.stacks.contains_key(&stack) {
            return Err(CoreError::StackNotFound { stack });
        }
        self.current = stack;
        Ok(())
    }

    /// Returns the current stack id.
    pub fn current_stack(&self) -> StackId {
        self.current
    }

    /// Returns a stack.
    pub fn stack(&self, stack: StackId) -> Option<&UndoStack> {
        self.stacks.get(&stack)
    }

    /// Removes a stack that has nothing left to save.
    ///
    /// # Errors
    ///
    /// Fails for the current stack, a stack with an open task, or one with
    /// unsaved work.
    pub fn remove_undo_stack(&mut self, stack: StackId) -> CoreResult<()> {
        let Some(target) = self.stacks.get(&stack) else {
            return Err(CoreError::StackNotFound { stack });
        };
        if stack == self.current || self.active == Some(stack) {
            return Err(CoreError::invalid_operation(format!(
                "{stack} is in use and cannot be removed"
            )));
        }
        if target.unsaved_work() {
            return Err(CoreError::invalid_operation(format!(
                "{stack} has unsaved work"
            )));
        }
        if let Some(removed) = self.stacks.remove(&stack) {
            // Its applied units still constrain undo on the remaining stacks.
            self.foreign_units.extend(removed.into_applied());
        }
        debug!(stack = %stack, "undo stack removed");
        Ok(())
    }

    // ----- tasks -----

    /// Opens an undoable task on the current stack.
    ///
    /// # Errors
    ///
    /// Beginning while another task is open is misuse: the open task is
    /// rolled back and [`CoreError::InvalidOperation`] is returned.
    pub fn begin_undo_task(
        &mut self,
        undo_text: impl Into<String>,
        redo_text: impl Into<String>,
    ) -> CoreResult<()> {
        self.begin(self.current, true, undo_text.into(), redo_text.into())
    }

    /// Opens an undoable task on a given stack.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::begin_undo_task`], plus
    /// [`CoreError::StackNotFound`].
    pub fn begin_undo_task_on(
        &mut self,
        stack: StackId,
        undo_text: impl Into<String>,
        redo_text: impl Into<String>,
    ) -> CoreResult<()> {
        self.begin(stack, true, undo_text.into(), redo_text.into())
    }

    /// Opens a task whose changes are saved but never undone.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::begin_undo_task`].
    pub fn begin_non_undoable_task(&mut self) -> CoreResult<()> {
        self.begin(self.current, false, String::new(), String::new())
    }

    fn begin(&mut self, stack: StackId, undoable: bool, undo_text: String, redo_text: String) -> CoreResult<()> {
        if self.active.is_some() {
            return Err(self.misuse("a task is already open"));
        }
        if self.undo_redo_in_progress {
            return Err(self.misuse("cannot begin a task during undo or redo"));
        }
        if !self.stacks.contains_key(&stack) {
            return Err(CoreError::StackNotFound { stack });
        }
        let sequence = self.allocate_sequence();
        let guard = self.graph.write_arc();
        let unit = UnitOfWork::new(sequence, undoable, undo_text, redo_text);
        if let Some(target) = self.stacks.get_mut(&stack) {
            target.begin_task(unit)?;
        }
        self.write_guard = Some(guard);
        self.active = Some(stack);
        debug!(stack = %stack, sequence = %sequence, undoable, "task begun");
        Ok(())
    }

    /// Returns true while a task is open.
    pub fn in_task(&self) -> bool {
        self.active.is_some()
    }

    /// Closes the open task and tells observers what changed.
    ///
    /// Touched objects get a fresh `DateModified` first. A task that
    /// changed no stored data leaves nothing on the stack.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if no task is open. If
    /// stamping fails the task is rolled back and the error returned.
    pub fn end_undo_task(&mut self) -> CoreResult<()> {
        let Some(stack_id) = self.active else {
            return Err(self.misuse("no task is open"));
        };
        if let Err(e) = self.stamp_date_modified(stack_id) {
            error!(error = %e, "stamping DateModified failed, rolling back");
            self.rollback_open_task();
            return Err(e);
        }

        let notifications = {
            let (Some(stack), Some(guard)) = (self.stacks.get_mut(&stack_id), self.write_guard.as_ref())
            else {
                return Err(CoreError::invalid_operation("task state lost"));
            };
            let Some(unit) = stack.take_current() else {
                return Err(CoreError::invalid_operation("task state lost"));
            };
            stack.set_state(TaskState::BroadcastingPropChanges);
            let notifications = unit.notifications(Direction::Forward, &***guard);
            if unit.is_data_change() {
                debug!(stack = %stack_id, sequence = %unit.sequence(), records = unit.len(), "task ended");
                stack.push_done(unit);
            } else {
                debug!(stack = %stack_id, "task ended without data changes");
            }
            notifications
        };

        self.write_guard = None;
        self.broadcast(&notifications);
        if let Some(stack) = self.stacks.get_mut(&stack_id) {
            stack.set_state(TaskState::ReadyForBeginTask);
        }
        self.active = None;
        self.last_activity = self.clock.instant();
        Ok(())
    }

    fn stamp_date_modified(&mut self, stack_id: StackId) -> CoreResult<()> {
        if !self.config.stamp_date_modified {
            return Ok(());
        }
        let now = self.clock.now();
        let schema = &self.schema;
        let (Some(stack), Some(guard)) = (self.stacks.get_mut(&stack_id), self.write_guard.as_mut()) else {
            return Ok(());
        };
        if stack.date_modified_suppressed() {
            return Ok(());
        }
        let Some(unit) = stack.current_mut() else {
            return Ok(());
        };
        let repo: &mut dyn ObjectRepository = &mut ***guard;
        for id in unit.touched_objects() {
            let Some(class) = repo.get_object(id).map(|o| o.class()) else {
                continue;
            };
            let Some(field) = schema.date_modified_field(class) else {
                continue;
            };
            let old = repo.field(id, field)?;
            let new = FieldValue::Time(now);
            if old == new {
                continue;
            }
            let def = schema.field(field)?;
            repo.set_field(id, field, new.clone())?;
            for record in ChangeRecord::from_field_values(def, id, old, new)? {
                unit.add_action(record);
            }
        }
        Ok(())
    }

    /// Reverts the open task and releases the graph without notifying.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if no task is open.
    pub fn rollback(&mut self) -> CoreResult<()> {
        if self.active.is_none() {
            return Err(CoreError::invalid_operation("no task to roll back"));
        }
        self.rollback_open_task();
        Ok(())
    }

    pub(super) fn rollback_open_task(&mut self) {
        if let Some(stack_id) = self.active.take() {
            if let Some(stack) = self.stacks.get_mut(&stack_id) {
                if let (Some(mut unit), Some(guard)) = (stack.take_current(), self.write_guard.as_mut()) {
                    if let Err(e) = unit.undo(&mut ***guard) {
                        error!(error = %e, sequence = %unit.sequence(), "rollback left the graph partly reverted");
                    } else {
                        debug!(stack = %stack_id, sequence = %unit.sequence(), "task rolled back");
                    }
                }
                stack.set_state(TaskState::ReadyForBeginTask);
            }
        }
        self.write_guard = None;
    }

    /// Rolls back any open task and builds the misuse error.
    pub(super) fn misuse(&mut self, message: &str) -> CoreError {
        error!(reason = message, "transaction service misuse");
        if self.active.is_some() {
            self.rollback_open_task();
        }
        CoreError::invalid_operation(message)
    }

    /// Runs `f` inside an undoable task, rolling back if it fails.
    ///
    /// # Errors
    ///
    /// Returns whatever `f`, begin or end returns.
    pub fn with_undo_task<R>(
        &mut self,
        undo_text: impl Into<String>,
        redo_text: impl Into<String>,
        f: impl FnOnce(&mut Self) -> CoreResult<R>,
    ) -> CoreResult<R> {
        self.begin_undo_task(undo_text, redo_text)?;
        match f(self) {
            Ok(value) => {
                self.end_undo_task()?;
                Ok(value)
            }
            Err(e) => {
                if self.active.is_some() {
                    self.rollback_open_task();
                }
                Err(e)
            }
        }
    }

    /// Stops the open task from stamping `DateModified`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if no task is open.
    pub fn suppress_date_modified(&mut self) -> CoreResult<()> {
        let stack = self
            .active
            .and_then(|id| self.stacks.get_mut(&id))
            .ok_or_else(|| CoreError::invalid_operation("no task is open"))?;
        stack.suppress_date_modified();
        Ok(())
    }

    // ----- undo and redo -----

    /// Every applied unit on every stack, plus applied foreign units.
    fn applied_units(&self) -> impl Iterator<Item = &UnitOfWork> {
        self.stacks
            .values()
            .flat_map(UndoStack::applied)
            .chain(self.foreign_units.iter())
    }

    /// Returns true if the current stack can undo.
    pub fn can_undo(&self) -> bool {
        self.can_undo_on(self.current)
    }

    /// Returns true if `stack` can undo its top unit.
    ///
    /// Refused while a task is open, while a later unit on any stack touches
    /// what the unit changed, or when undoing would leave a dangling link.
    pub fn can_undo_on(&self, stack: StackId) -> bool {
        if self.active.is_some() {
            return false;
        }
        let Some(unit) = self.stacks.get(&stack).and_then(UndoStack::peek_undo) else {
            return false;
        };
        let blocked = self
            .applied_units()
            .any(|other| other.sequence() > unit.sequence() && other.interferes_with(unit, &self.schema));
        if blocked {
            debug!(stack = %stack, sequence = %unit.sequence(), "undo blocked by a later unit");
            return false;
        }
        !self.with_repo(|repo| unit.would_dangle(repo, Direction::Backward))
    }

    /// Returns true if the current stack can redo.
    pub fn can_redo(&self) -> bool {
        self.can_redo_on(self.current)
    }

    /// Returns true if `stack` can redo its top unit.
    ///
    /// Refused while an earlier undone unit on another stack touches what
    /// the unit changes, or when redoing would leave a dangling link.
    pub fn can_redo_on(&self, stack: StackId) -> bool {
        if self.active.is_some() {
            return false;
        }
        let Some(unit) = self.stacks.get(&stack).and_then(UndoStack::peek_redo) else {
            return false;
        };
        let blocked = self
            .stacks
            .iter()
            .filter(|(id, _)| **id != stack)
            .flat_map(|(_, s)| s.redoable())
            .any(|other| other.sequence() < unit.sequence() && other.interferes_with(unit, &self.schema));
        if blocked {
            debug!(stack = %stack, sequence = %unit.sequence(), "redo blocked by an earlier undone unit");
            return false;
        }
        !self.with_repo(|repo| unit.would_dangle(repo, Direction::Forward))
    }

    /// Undoes the top unit of the current stack.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UndoRefused`] when [`TransactionService::can_undo`]
    /// is false.
    pub fn undo(&mut self) -> CoreResult<()> {
        self.undo_on(self.current)
    }

    /// Redoes the top unit of the current stack.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RedoRefused`] when [`TransactionService::can_redo`]
    /// is false.
    pub fn redo(&mut self) -> CoreResult<()> {
        self.redo_on(self.current)
    }

    /// Undoes the top unit of `stack`.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::undo`].
    pub fn undo_on(&mut self, stack: StackId) -> CoreResult<()> {
        self.step(stack, Direction::Backward)
    }

    /// Redoes the top unit of `stack`.
    ///
    /// # Errors
    ///
    /// As [`TransactionService::redo`].
    pub fn redo_on(&mut self, stack: StackId) -> CoreResult<()> {
        self.step(stack, Direction::Forward)
    }

    fn step(&mut self, stack_id: StackId, direction: Direction) -> CoreResult<()> {
        if self.active.is_some() {
            return Err(self.misuse("cannot undo or redo while a task is open"));
        }
        let allowed = match direction {
            Direction::Backward => self.can_undo_on(stack_id),
            Direction::Forward => self.can_redo_on(stack_id),
        };
        if !allowed {
            warn!(stack = %stack_id, ?direction, "undo or redo refused");
            return Err(match direction {
                Direction::Backward => CoreError::UndoRefused { stack: stack_id },
                Direction::Forward => CoreError::RedoRefused { stack: stack_id },
            });
        }

        self.undo_redo_in_progress = true;
        let result = match self.stacks.get_mut(&stack_id) {
            Some(stack) => apply_step(&self.graph, stack, direction),
            None => Err(CoreError::StackNotFound { stack: stack_id }),
        };
        self.undo_redo_in_progress = false;

        let notifications = result?;
        self.broadcast(&notifications);
        self.last_activity = self.clock.instant();
        Ok(())
    }

    // ----- marks -----

    /// Sets a mark at the current depth of the current stack.
    pub fn mark(&mut self) -> MarkHandle {
        let handle = MarkHandle(self.next_mark);
        self.next_mark += 1;
        if let Some(stack) = self.stacks.get_mut(&self.current) {
            stack.mark(handle);
        }
        handle
    }

    fn stack_with_mark(&mut self, handle: MarkHandle) -> CoreResult<&mut UndoStack> {
        self.stacks
            .values_mut()
            .find(|s| s.has_mark(handle))
            .ok_or(CoreError::MarkNotFound { mark: handle })
    }

    /// Merges everything done since `handle` into one unit.
    ///
    /// Returns false if nothing was done since the mark.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MarkNotFound`] for an unknown mark and
    /// [`CoreError::InvalidOperation`] while a task is open.
    pub fn collapse_to_mark(&mut self, handle: MarkHandle) -> CoreResult<bool> {
        if self.active.is_some() {
            return Err(self.misuse("cannot collapse to a mark while a task is open"));
        }
        self.stack_with_mark(handle)?.collapse_to_mark(handle)
    }

    /// Drops the units done since `handle`, which must hold no data changes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DiscardWouldLoseData`] if a unit since the mark
    /// changed stored data.
    pub fn discard_to_mark(&mut self, handle: MarkHandle) -> CoreResult<()> {
        if self.active.is_some() {
            return Err(self.misuse("cannot discard to a mark while a task is open"));
        }
        self.stack_with_mark(handle)?.discard_to_mark(handle)
    }

    /// Returns true if any stack holds a mark.
    pub fn has_marks(&self) -> bool {
        self.stacks.values().any(UndoStack::has_marks)
    }

    // ----- queries -----

    /// Reads a field.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not resident or the field is unknown.
    pub fn field(&self, object: ObjectId, field: FieldId) -> CoreResult<FieldValue> {
        self.with_repo(|repo| repo.field(object, field))
    }

    /// Returns true if the object is resident.
    pub fn has_object(&self, object: ObjectId) -> bool {
        self.with_repo(|repo| repo.has_object(object))
    }

    /// Returns the number of resident objects.
    pub fn object_count(&self) -> usize {
        self.with_repo(|repo| repo.len())
    }

    /// Serializes a resident object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object is not resident.
    pub fn snapshot_of(&self, object: ObjectId) -> CoreResult<Snapshot> {
        self.with_repo(|repo| repo.snapshot_of(object))
    }

    /// Returns true if the object was created since the last save.
    pub fn is_new(&self, object: ObjectId) -> bool {
        self.open_unit().is_some_and(|u| u.is_new(object))
            || self
                .stacks
                .values()
                .flat_map(UndoStack::applied_unsaved)
                .any(|u| u.is_new(object))
    }

    /// Returns true if a stored field of the object changed since the last
    /// save.
    pub fn is_modified(&self, object: ObjectId) -> bool {
        self.open_unit().is_some_and(|u| u.is_modified(object))
            || self
                .stacks
                .values()
                .flat_map(UndoStack::applied_unsaved)
                .any(|u| u.is_modified(object))
    }

    fn open_unit(&self) -> Option<&UnitOfWork> {
        self.active
            .and_then(|id| self.stacks.get(&id))
            .and_then(UndoStack::current)
    }

    /// Returns true if anything still has to reach the store.
    pub fn unsaved_work(&self) -> bool {
        self.stacks.values().any(UndoStack::unsaved_work)
    }

    /// Returns true after a save found conflicting foreign changes and
    /// until local work is discarded or a save succeeds.
    pub fn conflict_pending(&self) -> bool {
        self.conflict_pending
    }
}

/// Pops the top unit of `stack` and applies it in `direction`.
///
/// On failure the graph is put back and the unit returned to its stack.
fn apply_step(
    graph: &GraphLock,
    stack: &mut UndoStack,
    direction: Direction,
) -> CoreResult<Vec<ChangeNotification>> {
    let mut guard = graph.write();
    let popped = match direction {
        Direction::Backward => stack.pop_for_undo(),
        Direction::Forward => stack.pop_for_redo(),
    };
    let Some(mut unit) = popped else {
        return Ok(Vec::new());
    };
    let repo: &mut dyn ObjectRepository = &mut **guard;
    let applied = match direction {
        Direction::Backward => unit.undo(repo),
        Direction::Forward => unit.redo(repo),
    };
    match applied {
        Ok(()) => {
            let notifications = unit.notifications(direction, repo);
            debug!(stack = %stack.id(), sequence = %unit.sequence(), ?direction, "unit applied");
            match direction {
                Direction::Backward => stack.push_undone(unit),
                Direction::Forward => stack.push_redone(unit),
            }
            Ok(notifications)
        }
        Err(e) => {
            let restore = match direction {
                Direction::Backward => unit.redo(repo),
                Direction::Forward => unit.undo(repo),
            };
            if let Err(restore_error) = restore {
                error!(error = %restore_error, "could not restore graph after failed undo or redo");
            }
            match direction {
                Direction::Backward => stack.abort_undo(unit),
                Direction::Forward => stack.abort_redo(unit),
            }
            Err(e)
        }
    }
}
