//! Worker type definitions.
//!
//! This module contains the error type, tuning options, and run summary for
//! the worker loop.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Sleep between empty polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Consecutive empty polls tolerated before the worker exits.
pub const DEFAULT_MAX_IDLE_CYCLES: u32 = 10;

/// Errors that stop a worker before its loop starts.
///
/// Nothing inside the claim/execute/update cycle is fatal; those failures
/// are reported as events instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The config table could not be read.
    #[error("failed to load configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Why a worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// The queue stayed empty for more than the idle limit.
    Idle,
    /// Shutdown was requested.
    Cancelled,
}

/// Counters for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    /// Jobs claimed and executed.
    pub processed: u64,
    /// Jobs that exited 0.
    pub completed: u64,
    /// Failures rescheduled with backoff.
    pub retried: u64,
    /// Failures moved to the dead-letter queue.
    pub dead: u64,
    /// Cycles where claiming raised an error.
    pub claim_errors: u64,
}

/// Tuning knobs for the worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// The loop exits once this many consecutive polls have been exceeded.
    pub max_idle_cycles: u32,
}

impl WorkerOptions {
    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the idle cycle limit.
    pub fn with_max_idle_cycles(mut self, cycles: u32) -> Self {
        self.max_idle_cycles = cycles;
        self
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_idle_cycles: DEFAULT_MAX_IDLE_CYCLES,
        }
    }
}
