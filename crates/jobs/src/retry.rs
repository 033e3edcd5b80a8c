//! Retry policy: a pure function from failure history to the next step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::HandlerError;

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the job as `Delayed` for `delay`, then try again.
    Retry { delay: Duration },
    /// Give up; the job becomes `Failed`.
    Terminal,
}

/// Exponential backoff with a cap and a maximum retry count.
///
/// The delay before retry number `n + 1` (i.e. after `n` previous retries) is
/// `min(base_delay * multiplier^n, max_delay)`, optionally spread by a
/// deterministic jitter fraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt (0 = never retry).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor per retry; values below 1.0 are treated as 1.0.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Jitter fraction (0.0-1.0), deterministic per retry count.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that fails on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Constant delay between retries.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff applied after a failure when `retry_count` retries already happened.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let multiplier = if self.multiplier.is_finite() {
            self.multiplier.max(1.0)
        } else {
            1.0
        };

        if base_ms == 0.0 {
            return Duration::ZERO;
        }

        let exp = multiplier.powi(retry_count.min(i32::MAX as u32) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            // Spread retries of different counts without a random source.
            let pseudo_random = (((retry_count as f64 + 1.0) * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }

    /// Decide the fate of a job that failed with `error` after `retry_count` retries.
    pub fn decide(&self, retry_count: u32, error: &HandlerError) -> RetryDecision {
        if !error.is_retryable() || retry_count >= self.max_retries {
            return RetryDecision::Terminal;
        }
        RetryDecision::Retry {
            delay: self.delay_for(retry_count),
        }
    }
}
