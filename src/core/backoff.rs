//! Exponential backoff for failed jobs.
//!
//! The delay after a failure is `base ^ attempts`, in seconds, where
//! `attempts` already counts the failure being handled. There is no jitter
//! and no upper bound.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default exponent base used when the config table has no `backoff_base`.
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// Backoff policy applied to every failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Exponent base, in seconds. Always finite and positive.
    base: f64,
}

impl BackoffPolicy {
    /// Create a policy with the given base.
    ///
    /// Returns `None` unless `base` is finite and strictly positive.
    pub fn exponential(base: f64) -> Option<Self> {
        (base.is_finite() && base > 0.0).then_some(Self { base })
    }

    /// The configured base.
    pub fn base(&self) -> f64 {
        self.base
    }

    /// Delay in (fractional) seconds for the given post-increment attempt count.
    pub fn delay_secs(&self, attempts: u32) -> f64 {
        self.base.powf(f64::from(attempts))
    }

    /// Delay as a `Duration`, truncated toward zero to whole milliseconds.
    ///
    /// Saturates instead of overflowing for very large attempt counts.
    pub fn delay(&self, attempts: u32) -> Duration {
        let millis = (self.delay_secs(attempts) * 1000.0).trunc();
        // `as` saturates for out-of-range floats.
        Duration::from_millis(millis as u64)
    }

    /// Earliest time the job becomes eligible again.
    pub fn next_run(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = self.delay(attempts);
        i64::try_from(delay.as_millis())
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
        }
    }
}
