//! Bounded retry with exponential backoff for transient backend failures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy applied inside the adapter before a provider is given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first call (0 = no retries).
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (2.0 doubles each time).
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_backoff_ms: u64,
}

/// Hard ceiling on retries regardless of configuration.
pub const MAX_RETRIES_CAP: u32 = 2;

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Configured retry count, capped at [`MAX_RETRIES_CAP`].
    pub fn effective_retries(&self) -> u32 {
        self.max_retries.min(MAX_RETRIES_CAP)
    }

    /// Backoff before retry number `retry` (1-indexed; 0 means no delay).
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(retry as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    /// Whether another retry is allowed after `retries_done` retries.
    pub fn should_retry(&self, retries_done: u32) -> bool {
        retries_done < self.effective_retries()
    }

    pub fn backoff_duration(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retry))
    }
}

impl Default for RetryPolicy {
    /// Default: 2 retries, 250ms initial backoff, 2x multiplier, 2s max.
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 250,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2_000,
        }
    }
}
