//! Job lifecycle integration tests.
//!
//! Runs real shell commands against a SQLite-backed queue and checks the
//! retry, backoff and dead-letter transitions end to end.

use chrono::TimeDelta;
use queuectl::testing::ScriptedExecutor;
use queuectl::{
    BackoffPolicy, JobId, JobQueue, JobRequest, JobState, QueueError, Resolution, SqliteStorage,
    Storage, StorageError, Worker,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::common::{fast_options, temp_store};

async fn queue() -> (tempfile::TempDir, JobQueue<SqliteStorage>) {
    let (dir, storage) = temp_store().await;
    (dir, JobQueue::new(storage))
}

async fn drain(queue: &JobQueue<SqliteStorage>) {
    Worker::with_storage(queue.storage())
        .with_options(fast_options())
        .run(CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_successful_command_completes() {
    let (_dir, queue) = queue().await;
    let job = queue
        .enqueue(JobRequest::new("echo hello from the queue").with_id("ok"))
        .await
        .unwrap();

    drain(&queue).await;

    let job = queue.get(&job.id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 0);
    assert!(job.last_error.is_none());
}

#[tokio::test]
async fn test_zero_retries_goes_straight_to_dlq() {
    let (_dir, queue) = queue().await;
    queue
        .enqueue(JobRequest::new("exit 1").with_id("doomed").with_max_retries(0))
        .await
        .unwrap();

    drain(&queue).await;

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id.as_str(), "doomed");
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("exit(1)"));
}

#[tokio::test]
async fn test_unknown_program_is_exit_127() {
    let (_dir, queue) = queue().await;
    queue
        .enqueue(
            JobRequest::new("no-such-program-for-queuectl")
                .with_id("missing")
                .with_max_retries(0),
        )
        .await
        .unwrap();

    drain(&queue).await;

    let job = queue.get(&JobId::new("missing")).await.unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.last_error.as_deref(), Some("exit(127)"));
}

#[tokio::test]
async fn test_first_failure_backs_off_by_base() {
    let (_dir, queue) = queue().await;
    queue
        .enqueue(JobRequest::new("exit 4").with_id("flaky"))
        .await
        .unwrap();

    drain(&queue).await;

    let job = queue.get(&JobId::new("flaky")).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("exit(4)"));
    assert_eq!(job.next_run - job.updated_at, TimeDelta::seconds(2));
}

#[tokio::test]
async fn test_backoff_doubles_until_dead() {
    let (_dir, storage) = temp_store().await;
    let queue = JobQueue::new(storage);
    let storage = queue.storage();
    let policy = BackoffPolicy::default();
    queue
        .enqueue(JobRequest::new("false").with_id("job").with_max_retries(3))
        .await
        .unwrap();

    // Claim each attempt at its scheduled time instead of sleeping through it
    let mut at = queue.get(&JobId::new("job")).await.unwrap().next_run;
    let mut delays = Vec::new();
    loop {
        let job = storage.claim_next(at).await.unwrap().unwrap();
        match job.resolve(1, &policy, at) {
            Resolution::Retry {
                attempts,
                next_run,
                error,
                ..
            } => {
                storage
                    .schedule_retry(&job.id, attempts, next_run, &error, at)
                    .await
                    .unwrap();
                let early = next_run - TimeDelta::milliseconds(1);
                assert!(storage.claim_next(early).await.unwrap().is_none());
                delays.push((next_run - at).num_seconds());
                at = next_run;
            }
            Resolution::Dead { attempts, error } => {
                storage.mark_dead(&job.id, attempts, &error, at).await.unwrap();
                break;
            }
            Resolution::Complete => unreachable!(),
        }
    }

    assert_eq!(delays, [2, 4, 8]);
    let job = queue.get(&JobId::new("job")).await.unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 4);
}

#[tokio::test]
async fn test_dlq_retry_round_trip() {
    let (_dir, queue) = queue().await;
    queue
        .enqueue(JobRequest::new("work").with_id("job").with_max_retries(0))
        .await
        .unwrap();

    let executor = ScriptedExecutor::new([1, 0]);
    let worker = Worker::with_storage(queue.storage())
        .with_executor(executor.clone())
        .with_options(fast_options());
    worker.run(CancellationToken::new()).await.unwrap();
    assert_eq!(queue.dead_letters().await.unwrap().len(), 1);

    let requeued = queue.retry_dead(&JobId::new("job")).await.unwrap();
    assert_eq!(requeued.state, JobState::Pending);
    assert_eq!(requeued.attempts, 0);

    worker.run(CancellationToken::new()).await.unwrap();
    let job = queue.get(&JobId::new("job")).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.last_error.is_none());
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_retry_dead_rejects_live_jobs() {
    let (_dir, queue) = queue().await;
    queue
        .enqueue(JobRequest::new("true").with_id("live"))
        .await
        .unwrap();

    let result = queue.retry_dead(&JobId::new("live")).await;
    assert!(matches!(
        result,
        Err(QueueError::Storage(StorageError::StateConflict { .. }))
    ));
}

#[tokio::test]
async fn test_completion_is_recorded_once() {
    let (_dir, storage) = temp_store().await;
    let storage = Arc::new(storage);
    let queue = JobQueue::with_storage(Arc::clone(&storage));
    queue
        .enqueue(JobRequest::new("true").with_id("once"))
        .await
        .unwrap();

    let now = chrono::Utc::now();
    let job = storage.claim_next(now).await.unwrap().unwrap();
    storage.complete_job(&job.id, now).await.unwrap();

    let again = storage.complete_job(&job.id, now).await;
    assert!(matches!(again, Err(StorageError::StateConflict { .. })));
    let retry = storage
        .schedule_retry(&job.id, 1, now, "exit(1)", now)
        .await;
    assert!(matches!(retry, Err(StorageError::StateConflict { .. })));

    let job = queue.get(&job.id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn test_queue_survives_reopen() {
    let (dir, storage) = temp_store().await;
    let queue = JobQueue::new(storage);
    queue
        .enqueue(JobRequest::new("true").with_id("durable"))
        .await
        .unwrap();
    queue.config_set("backoff_base", "3").await.unwrap();
    queue.storage().close().await;
    drop(queue);

    let reopened = JobQueue::new(
        SqliteStorage::new(dir.path().join("queue.db"))
            .await
            .unwrap(),
    );
    let jobs = reopened.list(Some(JobState::Pending)).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id.as_str(), "durable");
    assert_eq!(
        reopened.config_value("backoff_base").await.unwrap().as_deref(),
        Some("3")
    );
}
