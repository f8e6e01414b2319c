//! Job records and the enqueue request that creates them.
//!
//! A [`Job`] is the persisted unit of work. A [`JobRequest`] is the validated
//! caller input; it is turned into a `Job` by the queue facade once the
//! default retry budget is known.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::backoff::BackoffPolicy;
use super::types::{JobId, JobState};

/// Errors raised while validating enqueue input.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The payload was not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The payload had no `command`, or it was blank.
    #[error("command required")]
    MissingCommand,

    /// The supplied id was blank.
    #[error("job id must not be empty")]
    EmptyId,
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// Shell command line executed by the worker.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of failed executions so far.
    pub attempts: u32,
    /// Failures tolerated before the job is dead-lettered.
    pub max_retries: u32,
    /// When the job was enqueued. FIFO key for claiming.
    pub created_at: DateTime<Utc>,
    /// Time of the most recent state transition.
    pub updated_at: DateTime<Utc>,
    /// Earliest time a pending job may be claimed.
    pub next_run: DateTime<Utc>,
    /// Reason for the last failure, if any.
    pub last_error: Option<String>,
}

impl Job {
    /// Create a new pending job, eligible immediately.
    pub fn new(id: JobId, command: impl Into<String>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id,
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_run: now,
            last_error: None,
        }
    }

    /// Set the creation time (and the initial `updated_at`/`next_run`).
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self.next_run = at;
        self
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run <= now
    }

    /// Decide what happens to a claimed job after its command exited with `code`.
    pub fn resolve(&self, code: i32, backoff: &BackoffPolicy, now: DateTime<Utc>) -> Resolution {
        if code == 0 {
            return Resolution::Complete;
        }

        let attempts = self.attempts.saturating_add(1);
        let error = format!("exit({})", code);
        if attempts > self.max_retries {
            Resolution::Dead { attempts, error }
        } else {
            Resolution::Retry {
                attempts,
                delay_secs: backoff.delay_secs(attempts),
                next_run: backoff.next_run(now, attempts),
                error,
            }
        }
    }
}

/// Outcome of one execution of a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Exit status 0.
    Complete,
    /// Failed with retries left; back to `pending` at `next_run`.
    Retry {
        attempts: u32,
        delay_secs: f64,
        next_run: DateTime<Utc>,
        error: String,
    },
    /// Failed with no retries left.
    Dead { attempts: u32, error: String },
}

/// Validated enqueue input.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobRequest {
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Command line to execute.
    #[serde(default)]
    pub command: Option<String>,
    /// Per-job retry budget; the configured default applies when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobRequest {
    /// Create a request for the given command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: Some(command.into()),
            max_retries: None,
        }
    }

    /// Parse a request from a JSON object such as
    /// `{"id": "job1", "command": "echo hi", "max_retries": 2}`.
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        let request: JobRequest = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    /// Set the job id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Check the request can become a job.
    pub fn validate(&self) -> Result<(), RequestError> {
        match &self.command {
            Some(command) if !command.trim().is_empty() => {}
            _ => return Err(RequestError::MissingCommand),
        }
        if matches!(&self.id, Some(id) if id.trim().is_empty()) {
            return Err(RequestError::EmptyId);
        }
        Ok(())
    }

    /// Build the pending job, using `default_max_retries` when unset.
    pub fn into_job(self, default_max_retries: u32) -> Result<Job, RequestError> {
        self.validate()?;
        let id = self.id.map(JobId::new).unwrap_or_else(JobId::generate);
        let command = self.command.ok_or(RequestError::MissingCommand)?;
        Ok(Job::new(
            id,
            command,
            self.max_retries.unwrap_or(default_max_retries),
        ))
    }
}
