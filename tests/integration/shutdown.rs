//! Worker stop integration tests.
//!
//! Tests that a worker exits on its own once the queue stays empty, and
//! that a shutdown request lets the job in hand finish before the loop
//! returns.

use queuectl::testing::RecordingHandler;
use queuectl::{
    Event, EventBus, JobId, JobQueue, JobRequest, JobState, StopReason, Storage, Worker,
    WorkerHandle, WorkerOptions,
};
use std::time::Duration;
use tokio::time::Instant;

use crate::common::{fast_options, temp_store, wait_for_state};

#[tokio::test]
async fn test_idle_worker_exits_after_idle_limit() {
    let (_dir, storage) = temp_store().await;
    let options = WorkerOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_max_idle_cycles(5);

    let handle = WorkerHandle::new();
    let start = Instant::now();
    let summary = Worker::new(storage)
        .with_options(options)
        .run(handle.token())
        .await
        .unwrap();

    // Five sleeps happen before the sixth empty poll ends the loop
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(summary.processed, 0);
    assert!(!handle.is_shutdown_requested());
}

#[tokio::test]
async fn test_shutdown_waits_for_running_job() {
    let (_dir, storage) = temp_store().await;
    let queue = JobQueue::new(storage);
    queue
        .enqueue(JobRequest::new("sleep 0.5").with_id("slow"))
        .await
        .unwrap();
    queue
        .enqueue(JobRequest::new("true").with_id("next"))
        .await
        .unwrap();

    let handler = RecordingHandler::new();
    let bus = EventBus::new();
    bus.register(handler.clone()).await;

    let handle = WorkerHandle::new();
    let worker = Worker::with_storage(queue.storage())
        .with_event_bus(bus)
        .with_options(fast_options());
    let task = worker.spawn(handle.token());

    let storage = queue.storage();
    wait_for_state(
        &*storage,
        &JobId::new("slow"),
        JobState::Processing,
        Duration::from_secs(5),
    )
    .await;
    handle.shutdown();

    let summary = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.completed, 1);
    let slow = storage.get_job(&JobId::new("slow")).await.unwrap();
    assert_eq!(slow.state, JobState::Completed);
    let next = storage.get_job(&JobId::new("next")).await.unwrap();
    assert_eq!(next.state, JobState::Pending);

    let events = handler.events().await;
    assert!(matches!(
        events.last(),
        Some(Event::WorkerStopped {
            reason: StopReason::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_polling() {
    let (_dir, storage) = temp_store().await;
    let options = WorkerOptions::default()
        .with_poll_interval(Duration::from_secs(30))
        .with_max_idle_cycles(10);

    let handle = WorkerHandle::new();
    let task = Worker::new(storage)
        .with_options(options)
        .spawn(handle.token());

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();

    let summary = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(summary.processed, 0);
}
