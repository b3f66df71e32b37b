//! Retrying backing store calls across connection loss.

use crate::config::RetryConfig;
use crate::error::{CoreError, CoreResult};
use lcmdb_storage::{StorageError, StorageResult};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decides whether to keep trying once quick retries are used up.
///
/// Implementations typically ask the user, or wait for the network to come
/// back, before returning.
pub trait ConnectionLossHandler: Send + Sync {
    /// Returns true to try the call again.
    fn retry_after_failure(&self, attempts: u32, error: &StorageError) -> bool;
}

/// A handler that never retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct GiveUp;

impl ConnectionLossHandler for GiveUp {
    fn retry_after_failure(&self, _attempts: u32, _error: &StorageError) -> bool {
        false
    }
}

/// Bounded quick retries followed by a caller-supplied retry loop.
#[derive(Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    handler: Arc<dyn ConnectionLossHandler>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(config: RetryConfig, handler: Arc<dyn ConnectionLossHandler>) -> Self {
        Self { config, handler }
    }

    /// Runs `call` until it succeeds, fails permanently, or the handler
    /// gives up.
    ///
    /// # Errors
    ///
    /// Non-transient storage errors are returned as they are. Transient ones
    /// become [`CoreError::ConnectionLost`] once nobody wants to retry.
    pub fn run<T>(&self, operation: &str, mut call: impl FnMut() -> StorageResult<T>) -> CoreResult<T> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match call() {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(operation, attempts, "store call recovered");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_transient() => {
                    if attempts <= self.config.immediate_retries {
                        warn!(operation, attempts, %error, "transient store failure, retrying");
                        if !self.config.retry_delay.is_zero() {
                            std::thread::sleep(self.config.retry_delay);
                        }
                        continue;
                    }
                    if self.handler.retry_after_failure(attempts, &error) {
                        warn!(operation, attempts, %error, "retrying at the handler's request");
                        continue;
                    }
                    return Err(CoreError::ConnectionLost {
                        attempts,
                        message: error.to_string(),
                    });
                }
                Err(error) => return Err(error.into()),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default(), Arc::new(GiveUp))
    }
}
