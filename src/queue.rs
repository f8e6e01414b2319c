//! Operator-facing queue operations.
//!
//! [`JobQueue`] is what the CLI talks to: enqueueing, inspecting, the
//! dead-letter queue and configuration. Workers use the store directly.

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{ConfigError, QueueConfig, validate_setting};
use crate::core::job::{Job, JobRequest, RequestError};
use crate::core::types::{JobId, JobState};
use crate::storage::{StateCounts, Storage, StorageError};

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The enqueue request was rejected.
    #[error("invalid job request: {0}")]
    InvalidRequest(#[from] RequestError),

    /// A config key was empty.
    #[error("config key must not be empty")]
    EmptyConfigKey,

    /// Configuration could not be read.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store rejected the operation.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Queue facade over a storage backend.
pub struct JobQueue<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> JobQueue<S> {
    /// Create a queue over the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a queue over shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// The underlying storage, for building workers.
    pub fn storage(&self) -> Arc<S> {
        Arc::clone(&self.storage)
    }

    /// Add a pending job, eligible immediately.
    ///
    /// Jobs without `max_retries` get the configured `default_max_retries`.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job, QueueError> {
        request.validate()?;
        let default_max_retries = QueueConfig::load_default_max_retries(&*self.storage).await?;
        let job = request.into_job(default_max_retries)?;
        self.storage.insert_job(job.clone()).await?;
        tracing::info!(job_id = %job.id, max_retries = job.max_retries, "enqueued");
        Ok(job)
    }

    /// Look up one job.
    pub async fn get(&self, id: &JobId) -> Result<Job, QueueError> {
        Ok(self.storage.get_job(id).await?)
    }

    /// Jobs in FIFO order, optionally restricted to one state.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, QueueError> {
        Ok(self.storage.list_jobs(state).await?)
    }

    /// Job counts per state.
    pub async fn status(&self) -> Result<StateCounts, QueueError> {
        Ok(self.storage.state_counts().await?)
    }

    /// Dead jobs, most recently failed last.
    pub async fn dead_letters(&self) -> Result<Vec<Job>, QueueError> {
        let mut jobs = self.storage.list_jobs(Some(JobState::Dead)).await?;
        jobs.sort_by_key(|job| job.updated_at);
        Ok(jobs)
    }

    /// Move a dead job back to pending with a fresh retry budget.
    pub async fn retry_dead(&self, id: &JobId) -> Result<Job, QueueError> {
        let job = self.storage.retry_dead(id, Utc::now()).await?;
        tracing::info!(job_id = %job.id, "requeued from DLQ");
        Ok(job)
    }

    /// Every config entry, sorted by key.
    pub async fn config_get(&self) -> Result<Vec<(String, String)>, QueueError> {
        Ok(self.storage.list_config().await?)
    }

    /// A single config value.
    pub async fn config_value(&self, key: &str) -> Result<Option<String>, QueueError> {
        Ok(self.storage.get_config(key).await?)
    }

    /// Set a config value. Running workers keep the value they started with.
    ///
    /// Values are stored as given. One that workers cannot parse is logged
    /// here and replaced by its default when read.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(QueueError::EmptyConfigKey);
        }
        if let Err(e) = validate_setting(key, value) {
            tracing::warn!(error = %e, "stored value will be ignored by workers");
        }
        self.storage.set_config(key, value).await?;
        tracing::info!(key, value, "config updated");
        Ok(())
    }
}
