//! Storage abstraction for persisting jobs and queue configuration.
//!
//! This module provides a trait-based storage abstraction with
//! pluggable backends (in-memory, SQLite). Every mutation is a single-row
//! conditional update, so backends only need row-level atomicity plus one
//! transactional read-modify-write for [`Storage::claim_next`].

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::core::job::Job;
use crate::core::types::{JobId, JobState};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// A conditional update found the job in an unexpected state.
    #[error("job {id} is not {expected}")]
    StateConflict { id: JobId, expected: JobState },

    /// The database was busy or locked by another connection.
    #[error("storage busy: {0}")]
    Busy(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// A persisted value could not be decoded.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Busy(_))
    }
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
}

impl StateCounts {
    /// Add `n` jobs to the bucket for `state`.
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Processing => self.processing += n,
            JobState::Completed => self.completed += n,
            JobState::Dead => self.dead += n,
        }
    }

    /// Count for a single state.
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }

    /// Total number of jobs.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }
}

/// Storage trait for persisting queue state.
#[async_trait]
pub trait Storage: Send + Sync {
    // Job operations

    /// Insert a new job. Fails with `DuplicateKey` if the id exists.
    async fn insert_job(&self, job: Job) -> Result<(), StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError>;

    /// List jobs, optionally filtered by state, oldest first.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, StorageError>;

    /// Count jobs per state.
    async fn state_counts(&self) -> Result<StateCounts, StorageError>;

    // Claim protocol and transitions

    /// Atomically claim the oldest eligible pending job.
    ///
    /// Selects `state = pending AND next_run <= now` ordered by creation,
    /// re-checks it is still pending and flips it to `processing` inside one
    /// transaction. Returns `None` when nothing is eligible or another
    /// worker won the race; never retries within a call.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError>;

    /// `processing -> completed`, clearing `last_error`.
    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError>;

    /// `processing -> pending` with a new attempt count and eligibility time.
    async fn schedule_retry(
        &self,
        id: &JobId,
        attempts: u32,
        next_run: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// `processing -> dead`.
    async fn mark_dead(
        &self,
        id: &JobId,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// `dead -> pending` with `attempts = 0` and `next_run = now`.
    async fn retry_dead(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StorageError>;

    // Config operations

    /// Get a config value.
    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Insert or replace a config value.
    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// List all config entries ordered by key.
    async fn list_config(&self) -> Result<Vec<(String, String)>, StorageError>;
}

#[async_trait]
impl<S: Storage + ?Sized> Storage for Arc<S> {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        (**self).insert_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        (**self).get_job(id).await
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, StorageError> {
        (**self).list_jobs(state).await
    }

    async fn state_counts(&self) -> Result<StateCounts, StorageError> {
        (**self).state_counts().await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError> {
        (**self).claim_next(now).await
    }

    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        (**self).complete_job(id, now).await
    }

    async fn schedule_retry(
        &self,
        id: &JobId,
        attempts: u32,
        next_run: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        (**self)
            .schedule_retry(id, attempts, next_run, error, now)
            .await
    }

    async fn mark_dead(
        &self,
        id: &JobId,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        (**self).mark_dead(id, attempts, error, now).await
    }

    async fn retry_dead(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StorageError> {
        (**self).retry_dead(id, now).await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get_config(key).await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set_config(key, value).await
    }

    async fn list_config(&self) -> Result<Vec<(String, String)>, StorageError> {
        (**self).list_config().await
    }
}
