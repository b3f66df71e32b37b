//! Periodic saving.

use super::save::SaveOutcome;
use super::service::TransactionService;
use crate::error::CoreResult;
use std::fmt;
use tracing::{debug, warn};

/// Why an autosave did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Autosave is switched off.
    Disabled,
    /// A task is open.
    TaskInProgress,
    /// An undo or redo is running.
    UndoRedoInProgress,
    /// The last save hit conflicts nobody resolved yet.
    ConflictPending,
    /// A mark is set, so the user may still collapse or discard work.
    MarksExist,
    /// The user was active too recently, or the last save was too recent.
    TooRecent,
    /// Nothing is unsaved.
    NothingToSave,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disabled => "autosave disabled",
            Self::TaskInProgress => "task in progress",
            Self::UndoRedoInProgress => "undo or redo in progress",
            Self::ConflictPending => "conflict pending",
            Self::MarksExist => "marks exist",
            Self::TooRecent => "too recent",
            Self::NothingToSave => "nothing to save",
        };
        f.write_str(text)
    }
}

/// Result of an autosave attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutosaveDecision {
    /// The save did not run.
    Skipped(SkipReason),
    /// The save ran.
    Saved(SaveOutcome),
}

impl TransactionService {
    fn autosave_blocker(&self) -> Option<SkipReason> {
        let policy = &self.config.autosave;
        if !policy.enabled {
            return Some(SkipReason::Disabled);
        }
        if self.active.is_some() {
            return Some(SkipReason::TaskInProgress);
        }
        if self.undo_redo_in_progress {
            return Some(SkipReason::UndoRedoInProgress);
        }
        if self.conflict_pending {
            return Some(SkipReason::ConflictPending);
        }
        if self.has_marks() {
            return Some(SkipReason::MarksExist);
        }
        if !self.unsaved_work() {
            return Some(SkipReason::NothingToSave);
        }
        let now = self.clock.instant();
        if now.saturating_duration_since(self.last_activity) < policy.min_idle
            || now.saturating_duration_since(self.last_save) < policy.interval
        {
            return Some(SkipReason::TooRecent);
        }
        None
    }

    /// Saves if the autosave policy allows it right now.
    ///
    /// Meant to be called from a timer. Never saves in the middle of user
    /// work: open tasks, marks, recent activity and pending conflicts all
    /// postpone it.
    ///
    /// # Errors
    ///
    /// Returns whatever [`TransactionService::save`] returns.
    pub fn try_autosave(&mut self) -> CoreResult<AutosaveDecision> {
        if let Some(reason) = self.autosave_blocker() {
            debug!(%reason, "autosave skipped");
            return Ok(AutosaveDecision::Skipped(reason));
        }
        let outcome = self.save()?;
        if let SaveOutcome::Conflict(report) = &outcome {
            warn!(conflicts = report.len(), "autosave found conflicting changes");
        }
        Ok(AutosaveDecision::Saved(outcome))
    }
}
