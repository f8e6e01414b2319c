//! Claim protocol integration tests.
//!
//! Several workers, each with its own connection pool, drain one database
//! file. Every job must be executed exactly once and in FIFO order.

use chrono::{TimeDelta, Utc};
use queuectl::testing::{RecordingHandler, ScriptedExecutor};
use queuectl::{
    EventBus, Job, JobId, JobQueue, JobRequest, JobState, SqliteStorage, Storage, Worker,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::common::{fast_options, temp_store};

#[tokio::test]
async fn test_two_workers_never_run_the_same_job() {
    let (dir, first) = temp_store().await;
    let second = SqliteStorage::new(dir.path().join("queue.db"))
        .await
        .unwrap();
    let first = Arc::new(first);
    let second = Arc::new(second);

    let queue = JobQueue::with_storage(Arc::clone(&first));
    for i in 0..30 {
        queue
            .enqueue(JobRequest::new(format!("job {}", i)).with_id(format!("job_{}", i)))
            .await
            .unwrap();
    }

    let handler = RecordingHandler::new();
    let mut handles = Vec::new();
    for (name, storage) in [("a", first.clone()), ("b", second.clone())] {
        let bus = EventBus::new();
        bus.register(handler.clone()).await;
        let worker = Worker::with_storage(storage)
            .with_name(name)
            .with_executor(ScriptedExecutor::always(0))
            .with_event_bus(bus)
            .with_options(fast_options());
        handles.push(worker.spawn(CancellationToken::new()));
    }

    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().unwrap().processed;
    }

    assert_eq!(processed, 30);
    for i in 0..30 {
        assert_eq!(handler.processing_count(&format!("job_{}", i)).await, 1);
    }
    let counts = queue.status().await.unwrap();
    assert_eq!(counts.completed, 30);
    assert_eq!(counts.total(), 30);

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_worker_runs_jobs_oldest_first() {
    let (_dir, storage) = temp_store().await;
    let base = Utc::now() - TimeDelta::minutes(1);
    for (id, offset) in [("third", 3), ("first", 1), ("second", 2)] {
        let job = Job::new(JobId::new(id), format!("echo {}", id), 0)
            .with_created_at(base + TimeDelta::seconds(offset));
        storage.insert_job(job).await.unwrap();
    }

    let executor = ScriptedExecutor::always(0);
    let worker = Worker::new(storage)
        .with_executor(executor.clone())
        .with_options(fast_options());
    worker.run(CancellationToken::new()).await.unwrap();

    assert_eq!(
        executor.commands(),
        ["echo first", "echo second", "echo third"]
    );
}

#[tokio::test]
async fn test_jobs_scheduled_in_the_future_wait() {
    let (_dir, storage) = temp_store().await;
    let mut later = Job::new(JobId::new("later"), "true", 0);
    later.next_run = Utc::now() + TimeDelta::hours(1);
    storage.insert_job(later).await.unwrap();
    storage
        .insert_job(Job::new(JobId::new("now"), "true", 0))
        .await
        .unwrap();

    let storage = Arc::new(storage);
    let worker = Worker::with_storage(Arc::clone(&storage))
        .with_executor(ScriptedExecutor::always(0))
        .with_options(fast_options());
    let summary = worker.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.processed, 1);
    let later = storage.get_job(&JobId::new("later")).await.unwrap();
    assert_eq!(later.state, JobState::Pending);
}
