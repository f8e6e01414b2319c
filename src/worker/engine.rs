//! The worker loop.
//!
//! One cycle: claim the oldest eligible job, run its command, record the
//! outcome. Empty cycles sleep for the poll interval; once the idle limit is
//! exceeded the loop returns so workers drain the queue and stop rather than
//! polling forever.

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::types::{StopReason, WorkerError, WorkerOptions, WorkerSummary};
use crate::config::QueueConfig;
use crate::core::job::{Job, Resolution};
use crate::events::{Event, EventBus};
use crate::execution::{CommandExecutor, ShellExecutor};
use crate::storage::Storage;

/// A single-threaded worker bound to one store.
pub struct Worker<S: Storage> {
    /// Name reported in events.
    name: String,
    /// Storage backend.
    storage: Arc<S>,
    /// Runs job commands.
    executor: Arc<dyn CommandExecutor>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Poll interval and idle limit.
    options: WorkerOptions,
}

impl<S: Storage> Worker<S> {
    /// Create a new worker with the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new worker with shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            name: format!("worker-{}", std::process::id()),
            storage,
            executor: Arc::new(ShellExecutor::new()),
            event_bus: Arc::new(EventBus::new()),
            options: WorkerOptions::default(),
        }
    }

    /// Set the name reported in events.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the command executor.
    pub fn with_executor(mut self, executor: impl CommandExecutor + 'static) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    /// Set a shared command executor.
    pub fn with_shared_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Set the loop options.
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// The worker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until the queue stays empty past the idle limit or `cancel` fires.
    ///
    /// Configuration is read once here; changes made while the loop runs
    /// are not picked up. Cancellation is observed between cycles and
    /// during idle sleeps, never while a command is executing.
    pub async fn run(&self, cancel: CancellationToken) -> Result<WorkerSummary, WorkerError> {
        let config = QueueConfig::load(&*self.storage).await?;
        self.emit(Event::WorkerStarted {
            worker: self.name.clone(),
            timestamp: Utc::now(),
        })
        .await;

        let mut summary = WorkerSummary::default();
        let mut idle_cycles: u32 = 0;

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let claimed = match self.storage.claim_next(Utc::now()).await {
                Ok(job) => job,
                Err(e) => {
                    summary.claim_errors += 1;
                    self.emit(Event::ClaimFailed {
                        worker: self.name.clone(),
                        error: e.to_string(),
                        timestamp: Utc::now(),
                    })
                    .await;
                    None
                }
            };

            let Some(job) = claimed else {
                idle_cycles += 1;
                if idle_cycles > self.options.max_idle_cycles {
                    break StopReason::Idle;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
                continue;
            };

            idle_cycles = 0;
            self.process(job, &config, &mut summary).await;
        };

        self.emit(Event::WorkerStopped {
            worker: self.name.clone(),
            reason,
            summary,
            timestamp: Utc::now(),
        })
        .await;

        Ok(summary)
    }

    /// Execute a claimed job and persist the outcome.
    async fn process(&self, job: Job, config: &QueueConfig, summary: &mut WorkerSummary) {
        self.emit(Event::JobProcessing {
            worker: self.name.clone(),
            job_id: job.id.clone(),
            command: job.command.clone(),
            attempt: job.attempts.saturating_add(1),
            timestamp: Utc::now(),
        })
        .await;

        let started = Instant::now();
        let code = self.executor.execute(&job.command).await;
        let now = Utc::now();
        summary.processed += 1;

        let resolution = job.resolve(code, &config.backoff, now);
        let recorded = match &resolution {
            Resolution::Complete => self.storage.complete_job(&job.id, now).await,
            Resolution::Retry {
                attempts,
                next_run,
                error,
                ..
            } => {
                self.storage
                    .schedule_retry(&job.id, *attempts, *next_run, error, now)
                    .await
            }
            Resolution::Dead { attempts, error } => {
                self.storage.mark_dead(&job.id, *attempts, error, now).await
            }
        };

        if let Err(e) = recorded {
            self.emit(Event::UpdateFailed {
                worker: self.name.clone(),
                job_id: job.id,
                error: e.to_string(),
                timestamp: Utc::now(),
            })
            .await;
            return;
        }

        let event = match resolution {
            Resolution::Complete => {
                summary.completed += 1;
                Event::JobCompleted {
                    worker: self.name.clone(),
                    job_id: job.id,
                    duration: started.elapsed(),
                    timestamp: now,
                }
            }
            Resolution::Retry {
                attempts,
                delay_secs,
                ..
            } => {
                summary.retried += 1;
                Event::RetryScheduled {
                    worker: self.name.clone(),
                    job_id: job.id,
                    exit_code: code,
                    attempts,
                    delay_secs,
                    timestamp: now,
                }
            }
            Resolution::Dead { attempts, .. } => {
                summary.dead += 1;
                Event::JobDeadLettered {
                    worker: self.name.clone(),
                    job_id: job.id,
                    exit_code: code,
                    attempts,
                    timestamp: now,
                }
            }
        };
        self.emit(event).await;
    }

    async fn emit(&self, event: Event) {
        self.event_bus.emit(event).await;
    }
}

impl<S: Storage + 'static> Worker<S> {
    /// Run the worker on its own task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<WorkerSummary, WorkerError>> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobRequest;
    use crate::core::types::{JobId, JobState};
    use crate::storage::InMemoryStorage;
    use crate::testing::{FailingStorage, RecordingHandler, ScriptedExecutor};
    use chrono::TimeDelta;
    use std::time::Duration;

    fn fast_options() -> WorkerOptions {
        WorkerOptions::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_max_idle_cycles(2)
    }

    async fn enqueue(storage: &InMemoryStorage, id: &str, max_retries: u32) {
        let job = JobRequest::new("cmd")
            .with_id(id)
            .with_max_retries(max_retries)
            .into_job(3)
            .unwrap();
        storage.insert_job(job).await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_job_completes() {
        let storage = Arc::new(InMemoryStorage::new());
        enqueue(&storage, "job1", 3).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::always(0))
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.completed, 1);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_failure_with_zero_retries_goes_dead() {
        let storage = Arc::new(InMemoryStorage::new());
        enqueue(&storage, "job1", 0).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::always(1))
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.dead, 1);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("exit(1)"));
    }

    #[tokio::test]
    async fn test_failure_schedules_retry_with_backoff() {
        let storage = Arc::new(InMemoryStorage::new());
        enqueue(&storage, "job1", 3).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::always(2))
            .with_options(fast_options());
        let before = Utc::now();
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        // Backoff (2s) outlasts the idle window, so the job runs once
        assert_eq!(summary.processed, 1);
        assert_eq!(summary.retried, 1);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("exit(2)"));
        let delay = job.next_run - before;
        assert!(delay >= TimeDelta::milliseconds(2000));
        assert!(delay < TimeDelta::milliseconds(3000));
    }

    #[tokio::test]
    async fn test_backoff_base_is_read_from_config() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.set_config("backoff_base", "0.001").await.unwrap();
        enqueue(&storage, "job1", 2).await;

        // 0.001^n seconds is effectively immediate, so every retry runs
        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::always(1))
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.retried, 2);
        assert_eq!(summary.dead, 1);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.set_config("backoff_base", "0.001").await.unwrap();
        enqueue(&storage, "flaky", 3).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::new([1, 1, 0]))
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.retried, 2);
        let job = storage.get_job(&JobId::new("flaky")).await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn test_processes_oldest_first() {
        let storage = Arc::new(InMemoryStorage::new());
        let base = Utc::now() - TimeDelta::seconds(10);
        for (id, offset) in [("b", 1), ("a", 0), ("c", 2)] {
            let job = Job::new(JobId::new(id), format!("run {}", id), 0)
                .with_created_at(base + TimeDelta::seconds(offset));
            storage.insert_job(job).await.unwrap();
        }

        let executor = ScriptedExecutor::always(0);
        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(executor.clone())
            .with_options(fast_options());
        worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(executor.commands(), ["run a", "run b", "run c"]);
    }

    #[tokio::test]
    async fn test_idle_worker_exits() {
        let storage = InMemoryStorage::new();
        let handler = RecordingHandler::new();
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        let worker = Worker::new(storage)
            .with_event_bus(bus)
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary, WorkerSummary::default());
        let events = handler.events().await;
        assert!(matches!(
            events.last(),
            Some(Event::WorkerStopped {
                reason: StopReason::Idle,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_claims_nothing() {
        let storage = Arc::new(InMemoryStorage::new());
        enqueue(&storage, "job1", 3).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::always(0))
            .with_options(fast_options());
        let summary = worker.run(cancel).await.unwrap();

        assert_eq!(summary.processed, 0);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_idle_sleep() {
        let storage = InMemoryStorage::new();
        let worker = Worker::new(storage).with_options(
            WorkerOptions::default()
                .with_poll_interval(Duration::from_secs(60))
                .with_max_idle_cycles(100),
        );

        let cancel = CancellationToken::new();
        let handle = worker.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(summary.processed, 0);
    }

    #[tokio::test]
    async fn test_emits_lifecycle_events() {
        let storage = Arc::new(InMemoryStorage::new());
        enqueue(&storage, "ok", 0).await;
        enqueue(&storage, "bad", 0).await;

        let handler = RecordingHandler::new();
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_name("w1")
            .with_event_bus(bus)
            .with_executor(ScriptedExecutor::new([0, 5]))
            .with_options(fast_options());
        worker.run(CancellationToken::new()).await.unwrap();

        let events = handler.events().await;
        assert!(matches!(events.first(), Some(Event::WorkerStarted { .. })));
        assert_eq!(handler.processing_count("ok").await, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::JobCompleted { job_id, .. } if job_id.as_str() == "ok"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::JobDeadLettered { job_id, exit_code: 5, attempts: 1, .. } if job_id.as_str() == "bad"
        )));
        assert!(events.iter().all(|e| e.worker() == "w1"));
    }

    #[tokio::test]
    async fn test_invalid_backoff_base_falls_back_to_default() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.set_config("backoff_base", "zero").await.unwrap();
        enqueue(&storage, "job1", 3).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::always(1))
            .with_options(fast_options());
        let before = Utc::now();
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.retried, 1);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        let delay = job.next_run - before;
        assert!(delay >= TimeDelta::milliseconds(2000));
        assert!(delay < TimeDelta::milliseconds(3000));
    }

    #[tokio::test]
    async fn test_claim_errors_count_as_empty_cycles() {
        let storage = Arc::new(FailingStorage::new(InMemoryStorage::new()).fail_claims(2));
        enqueue(storage.inner(), "job1", 3).await;

        let handler = RecordingHandler::new();
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        // Two failed claims stay within the idle limit of two
        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_event_bus(bus)
            .with_executor(ScriptedExecutor::always(0))
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.claim_errors, 2);
        assert_eq!(summary.completed, 1);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Completed);

        let events = handler.events().await;
        let failed = events
            .iter()
            .filter(|e| matches!(e, Event::ClaimFailed { .. }))
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_persistent_claim_errors_end_in_idle_exit() {
        let storage = Arc::new(FailingStorage::new(InMemoryStorage::new()).fail_claims(100));
        enqueue(storage.inner(), "job1", 3).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_executor(ScriptedExecutor::always(0))
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.claim_errors, 3);
        assert_eq!(summary.processed, 0);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_failed_outcome_write_emits_update_failed() {
        let storage = Arc::new(FailingStorage::new(InMemoryStorage::new()).fail_updates(1));
        enqueue(storage.inner(), "job1", 3).await;

        let handler = RecordingHandler::new();
        let bus = EventBus::new();
        bus.register(handler.clone()).await;

        let worker = Worker::with_storage(Arc::clone(&storage))
            .with_event_bus(bus)
            .with_executor(ScriptedExecutor::always(0))
            .with_options(fast_options());
        let summary = worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(summary.completed, 0);
        let job = storage.get_job(&JobId::new("job1")).await.unwrap();
        assert_eq!(job.state, JobState::Processing);

        let events = handler.events().await;
        assert!(events.iter().any(|e| matches!(
            e,
            Event::UpdateFailed { job_id, .. } if job_id.as_str() == "job1"
        )));
        assert!(!events.iter().any(|e| matches!(e, Event::JobCompleted { .. })));
    }
}
