//! The transaction service and everything that drives it.

mod autosave;
mod mutate;
mod save;
mod service;

pub use autosave::{AutosaveDecision, SkipReason};
pub use save::{SaveOutcome, SaveSummary};
pub use service::{GraphReader, ServiceBuilder, TransactionService};

#[cfg(test)]
mod tests;
