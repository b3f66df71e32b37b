//! Session configuration.

use std::time::Duration;

/// Configuration for a transaction service session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether ending a task stamps `DateModified` on every touched object.
    pub stamp_date_modified: bool,

    /// Whether commits are handed to a background worker instead of running inline.
    pub background_commit: bool,

    /// Retry behavior for backing store calls.
    pub retry: RetryConfig,

    /// Autosave policy.
    pub autosave: AutosaveConfig,

    /// How many times a save re-checks for foreign commits before giving up.
    pub max_reconcile_rounds: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stamp_date_modified: true,
            background_commit: false,
            retry: RetryConfig::default(),
            autosave: AutosaveConfig::default(),
            max_reconcile_rounds: 8,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether `DateModified` is stamped at the end of each task.
    #[must_use]
    pub const fn stamp_date_modified(mut self, value: bool) -> Self {
        self.stamp_date_modified = value;
        self
    }

    /// Sets whether commits run on the background worker.
    #[must_use]
    pub const fn background_commit(mut self, value: bool) -> Self {
        self.background_commit = value;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the autosave configuration.
    #[must_use]
    pub fn with_autosave(mut self, autosave: AutosaveConfig) -> Self {
        self.autosave = autosave;
        self
    }

    /// Sets the reconciliation round limit.
    #[must_use]
    pub const fn max_reconcile_rounds(mut self, rounds: u32) -> Self {
        self.max_reconcile_rounds = rounds;
        self
    }
}

/// Configuration for retrying transient store failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Quick retries attempted before the connection loss handler is asked.
    pub immediate_retries: u32,
    /// Delay between quick retries.
    pub retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            immediate_retries: 3,
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl RetryConfig {
    /// Creates a retry configuration.
    #[must_use]
    pub const fn new(immediate_retries: u32, retry_delay: Duration) -> Self {
        Self {
            immediate_retries,
            retry_delay,
        }
    }

    /// Creates a configuration with no quick retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            immediate_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }
}

/// Configuration for periodic autosave.
#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    /// Whether autosave runs at all.
    pub enabled: bool,
    /// Minimum time between two saves.
    pub interval: Duration,
    /// Minimum time since the last user activity.
    pub min_idle: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            min_idle: Duration::from_secs(2),
        }
    }
}

impl AutosaveConfig {
    /// Creates a disabled autosave configuration.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the save interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the idle threshold.
    #[must_use]
    pub const fn with_min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.stamp_date_modified);
        assert!(!config.background_commit);
        assert!(config.autosave.enabled);
        assert_eq!(config.retry.immediate_retries, 3);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .stamp_date_modified(false)
            .background_commit(true)
            .with_retry(RetryConfig::no_retry())
            .with_autosave(AutosaveConfig::disabled())
            .max_reconcile_rounds(2);

        assert!(!config.stamp_date_modified);
        assert!(config.background_commit);
        assert_eq!(config.retry.immediate_retries, 0);
        assert!(!config.autosave.enabled);
        assert_eq!(config.max_reconcile_rounds, 2);
    }
}
