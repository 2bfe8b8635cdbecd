//! Retry policy value object.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for transient store errors.
///
/// The defaults give four retries spaced 256, 512, 1024 and 2048 ms apart
/// (plus jitter when enabled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    #[serde(default = "default_true")]
    pub use_jitter: bool,
}

fn default_max_retries() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    256
}

fn default_max_delay_ms() -> u64 {
    2048
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    /// A policy with millisecond-scale delays, for tests.
    pub fn fast(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
            use_jitter: false,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt.min(31) as i32);
        let delay_ms = base_delay.min(self.max_delay_ms as f64) as u64;

        if self.use_jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            Duration::from_millis(delay_ms + jitter)
        } else {
            Duration::from_millis(delay_ms)
        }
    }

    /// Longest time a caller can spend sleeping between attempts before the
    /// policy gives up, jitter included.
    pub fn max_total_delay(&self) -> Duration {
        let base: u64 = (0..self.max_retries)
            .map(|attempt| {
                let delay = self.initial_delay_ms as f64
                    * self.backoff_multiplier.powi(attempt.min(31) as i32);
                delay.min(self.max_delay_ms as f64) as u64
            })
            .sum();
        if self.use_jitter {
            Duration::from_millis(base + base / 4)
        } else {
            Duration::from_millis(base)
        }
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            use_jitter: default_true(),
        }
    }
}
