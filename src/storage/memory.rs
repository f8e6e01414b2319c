//! In-memory storage implementation.
//!
//! Provides a single-process backend for tests and embedding. One mutex
//! guards the whole queue, which makes every operation (including the claim
//! read-modify-write) atomic within the process. Data is not persisted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::{StateCounts, Storage, StorageError};
use crate::core::backoff::DEFAULT_BACKOFF_BASE;
use crate::core::job::Job;
use crate::core::types::{JobId, JobState};

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Insertion sequence per job, the FIFO tie-break for equal `created_at`.
    seq: HashMap<JobId, u64>,
    next_seq: u64,
    config: BTreeMap<String, String>,
}

impl Inner {
    fn ordered(&self) -> Vec<&Job> {
        let mut jobs: Vec<_> = self.jobs.values().collect();
        jobs.sort_by_key(|job| (job.created_at, self.seq.get(&job.id).copied()));
        jobs
    }

    fn transition(&mut self, id: &JobId, expected: JobState) -> Result<&mut Job, StorageError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;
        if job.state != expected {
            return Err(StorageError::StateConflict {
                id: id.clone(),
                expected,
            });
        }
        Ok(job)
    }
}

/// In-memory storage backend.
///
/// Thread-safe storage using a Mutex for exclusive access.
pub struct InMemoryStorage {
    inner: Mutex<Inner>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage seeded with default config.
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner
            .config
            .insert("backoff_base".into(), DEFAULT_BACKOFF_BASE.to_string());
        inner
            .config
            .insert("default_max_retries".into(), "3".into());
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        if inner.jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seq.insert(job.id.clone(), seq);
        inner.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        inner
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner
            .ordered()
            .into_iter()
            .filter(|job| state.is_none_or(|s| job.state == s))
            .cloned()
            .collect())
    }

    async fn state_counts(&self) -> Result<StateCounts, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut counts = StateCounts::default();
        for job in inner.jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let Some(id) = inner
            .ordered()
            .into_iter()
            .find(|job| job.is_eligible(now))
            .map(|job| job.id.clone())
        else {
            return Ok(None);
        };

        match inner.transition(&id, JobState::Pending) {
            Ok(job) => {
                job.state = JobState::Processing;
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            Err(StorageError::StateConflict { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let job = inner.transition(id, JobState::Processing)?;
        job.state = JobState::Completed;
        job.last_error = None;
        job.updated_at = now;
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &JobId,
        attempts: u32,
        next_run: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let job = inner.transition(id, JobState::Processing)?;
        job.state = JobState::Pending;
        job.attempts = attempts;
        job.next_run = next_run;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: &JobId,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let job = inner.transition(id, JobState::Processing)?;
        job.state = JobState::Dead;
        job.attempts = attempts;
        job.last_error = Some(error.to_string());
        job.updated_at = now;
        Ok(())
    }

    async fn retry_dead(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        let job = inner.transition(id, JobState::Dead)?;
        job.state = JobState::Pending;
        job.attempts = 0;
        job.next_run = now;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        inner.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn list_config(&self) -> Result<Vec<(String, String)>, StorageError> {
        let inner = self.inner.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(inner
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
