//! Session configuration

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How far registration looks for memoized results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoizationScope {
    /// Only calls registered during this session are reused eagerly.
    /// Terminal records a worker happens to claim are still honored.
    Session,
    /// Registration consults storage and adopts terminal records left by
    /// earlier sessions, skipping scheduling entirely.
    Persistent,
}

/// Backoff policy for infrastructure errors (broker or storage unavailable).
///
/// Infrastructure retries never mark a call failed; after `max_attempts`
/// the claim is returned to the queue and picked up again later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Initial interval between retries in seconds
    pub initial_interval: f64,
    /// Backoff multiplier for each retry
    pub backoff_factor: f64,
    /// Maximum interval between retries in seconds
    pub max_interval: f64,
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,
    /// Whether to add random jitter to intervals
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: 0.1,
            backoff_factor: 2.0,
            max_interval: 5.0,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-indexed), with exponential
    /// backoff capped at `max_interval` and optional jitter of up to 25%.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.initial_interval * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_interval);

        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped * (1.0 + rng.gen_range(0.0..0.25))
        } else {
            capped
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Configuration of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Concurrent executor tasks in this process
    pub workers: usize,
    /// Whether memoization reaches across sessions
    pub memoization: MemoizationScope,
    /// Backoff policy for infrastructure errors
    pub retry: RetryConfig,
    /// How long one claim poll waits before re-checking for cancellation,
    /// in milliseconds
    pub claim_poll_ms: u64,
    /// Capacity of the in-process terminal-event channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            memoization: MemoizationScope::Session,
            retry: RetryConfig::default(),
            claim_poll_ms: 250,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub(crate) fn claim_poll(&self) -> Duration {
        Duration::from_millis(self.claim_poll_ms)
    }
}
