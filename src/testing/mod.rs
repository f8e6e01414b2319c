//! Testing utilities for users of the queuectl library.
//!
//! This module provides helpers for testing code that drives the queue:
//!
//! - [`ScriptedExecutor`]: An executor that returns preset exit statuses
//! - [`RecordingHandler`]: An event handler that keeps every event
//! - [`FailingStorage`]: A store wrapper that fails a set number of calls
//! - [`TestHarness`]: A queue and worker wired to in-memory storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::job::{Job, JobRequest};
use crate::core::types::{JobId, JobState};
use crate::events::{Event, EventBus, EventHandler};
use crate::execution::CommandExecutor;
use crate::queue::{JobQueue, QueueError};
use crate::storage::{InMemoryStorage, StateCounts, Storage, StorageError};
use crate::worker::{Worker, WorkerError, WorkerOptions, WorkerSummary};

/// An executor that never spawns anything.
///
/// Each call pops the next status from the script. Once the script runs out
/// the last status repeats (0 for an empty script). Clones share the script
/// and the command log.
///
/// # Example
///
/// ```
/// use queuectl::testing::ScriptedExecutor;
///
/// // Fails twice, then succeeds
/// let executor = ScriptedExecutor::new([1, 1, 0]);
/// assert_eq!(executor.call_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Default)]
struct ScriptState {
    script: VecDeque<i32>,
    last: i32,
    commands: Vec<String>,
}

impl ScriptedExecutor {
    /// Return `statuses` in order, then keep returning the last one.
    pub fn new(statuses: impl IntoIterator<Item = i32>) -> Self {
        let script: VecDeque<i32> = statuses.into_iter().collect();
        let last = script.back().copied().unwrap_or(0);
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                script,
                last,
                commands: Vec::new(),
            })),
        }
    }

    /// Return `status` for every command.
    pub fn always(status: i32) -> Self {
        Self::new([status])
    }

    /// Commands executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Number of commands executed so far.
    pub fn call_count(&self) -> usize {
        self.lock().commands.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, command: &str) -> i32 {
        let mut state = self.lock();
        state.commands.push(command.to_string());
        match state.script.pop_front() {
            Some(status) => status,
            None => state.last,
        }
    }
}

/// An event handler that records every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: tokio::sync::Mutex<Vec<Event>>,
}

impl RecordingHandler {
    /// Create a shareable handler, ready for [`EventBus::register`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All events received so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// How many times `job_id` was picked up for execution.
    pub async fn processing_count(&self, job_id: &str) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| {
                matches!(e, Event::JobProcessing { job_id: id, .. } if id.as_str() == job_id)
            })
            .count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

/// A store wrapper that fails some calls before passing them through.
///
/// Claims and post-execution updates (complete, retry, dead) each have their
/// own budget of failures. While a budget lasts, the call returns
/// [`StorageError::Busy`] without touching the wrapped store.
///
/// # Example
///
/// ```
/// use queuectl::testing::FailingStorage;
/// use queuectl::InMemoryStorage;
///
/// // The first two claims report a busy database
/// let storage = FailingStorage::new(InMemoryStorage::new()).fail_claims(2);
/// ```
pub struct FailingStorage<S> {
    inner: S,
    budget: Mutex<FailureBudget>,
}

#[derive(Default)]
struct FailureBudget {
    claims: u32,
    updates: u32,
}

impl<S: Storage> FailingStorage<S> {
    /// Wrap `inner` with no failures scheduled.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            budget: Mutex::new(FailureBudget::default()),
        }
    }

    /// Fail the next `count` claims.
    pub fn fail_claims(self, count: u32) -> Self {
        self.lock().claims = count;
        self
    }

    /// Fail the next `count` post-execution updates.
    pub fn fail_updates(self, count: u32) -> Self {
        self.lock().updates = count;
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FailureBudget> {
        self.budget.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take(&self, pick: fn(&mut FailureBudget) -> &mut u32, op: &str) -> Result<(), StorageError> {
        let mut budget = self.lock();
        let remaining = pick(&mut budget);
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        Err(StorageError::Busy(format!("injected {} failure", op)))
    }
}

#[async_trait]
impl<S: Storage> Storage for FailingStorage<S> {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, StorageError> {
        self.inner.list_jobs(state).await
    }

    async fn state_counts(&self) -> Result<StateCounts, StorageError> {
        self.inner.state_counts().await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError> {
        self.take(|b| &mut b.claims, "claim")?;
        self.inner.claim_next(now).await
    }

    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        self.take(|b| &mut b.updates, "update")?;
        self.inner.complete_job(id, now).await
    }

    async fn schedule_retry(
        &self,
        id: &JobId,
        attempts: u32,
        next_run: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.take(|b| &mut b.updates, "update")?;
        self.inner
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
        self.take(|b| &mut b.updates, "update")?;
        self.inner.mark_dead(id, attempts, error, now).await
    }

    async fn retry_dead(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StorageError> {
        self.inner.retry_dead(id, now).await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.inner.get_config(key).await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.set_config(key, value).await
    }

    async fn list_config(&self) -> Result<Vec<(String, String)>, StorageError> {
        self.inner.list_config().await
    }
}

/// A queue plus worker over shared in-memory storage.
///
/// Workers built by the harness poll every few milliseconds and give up
/// after a couple of idle cycles, so `run_worker` returns as soon as the
/// queue has drained.
///
/// # Example
///
/// ```
/// use queuectl::testing::{ScriptedExecutor, TestHarness};
/// use queuectl::{JobRequest, JobState};
///
/// # tokio_test_block(async {
/// let harness = TestHarness::new().with_executor(ScriptedExecutor::always(0));
/// let job = harness.enqueue(JobRequest::new("echo hi")).await.unwrap();
/// harness.run_worker().await.unwrap();
///
/// let job = harness.queue().get(&job.id).await.unwrap();
/// assert_eq!(job.state, JobState::Completed);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct TestHarness {
    queue: JobQueue<InMemoryStorage>,
    executor: Arc<dyn CommandExecutor>,
    events: Arc<RecordingHandler>,
    options: WorkerOptions,
}

impl TestHarness {
    /// Create a harness whose executor succeeds for every command.
    pub fn new() -> Self {
        Self {
            queue: JobQueue::new(InMemoryStorage::new()),
            executor: Arc::new(ScriptedExecutor::always(0)),
            events: RecordingHandler::new(),
            options: WorkerOptions::default()
                .with_poll_interval(Duration::from_millis(5))
                .with_max_idle_cycles(2),
        }
    }

    /// Use a different executor for workers.
    pub fn with_executor(mut self, executor: impl CommandExecutor + 'static) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Override the worker options.
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// The queue under test.
    pub fn queue(&self) -> &JobQueue<InMemoryStorage> {
        &self.queue
    }

    /// Events recorded from every worker run.
    pub fn events(&self) -> &RecordingHandler {
        &self.events
    }

    /// Enqueue a job.
    pub async fn enqueue(&self, request: JobRequest) -> Result<Job, QueueError> {
        self.queue.enqueue(request).await
    }

    /// Build a worker over the harness storage.
    pub async fn worker(&self) -> Worker<InMemoryStorage> {
        let bus = EventBus::new();
        bus.register(self.events.clone()).await;
        Worker::with_storage(self.queue.storage())
            .with_shared_executor(Arc::clone(&self.executor))
            .with_event_bus(bus)
            .with_options(self.options)
    }

    /// Run one worker until the queue is drained.
    pub async fn run_worker(&self) -> Result<WorkerSummary, WorkerError> {
        self.worker().await.run(CancellationToken::new()).await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
