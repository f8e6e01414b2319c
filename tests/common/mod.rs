//! Common test utilities shared across integration tests.

use queuectl::{Job, JobId, JobState, SqliteStorage, Storage, WorkerOptions};
use std::time::Duration;
use tempfile::TempDir;

/// Open a fresh queue database in a temporary directory.
///
/// Keep the returned `TempDir` alive for as long as the store is used.
pub async fn temp_store() -> (TempDir, SqliteStorage) {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::new(dir.path().join("queue.db"))
        .await
        .unwrap();
    (dir, storage)
}

/// Worker options that poll quickly and go idle after a few empty cycles.
pub fn fast_options() -> WorkerOptions {
    WorkerOptions::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_max_idle_cycles(3)
}

/// Wait for a job to reach an expected state, polling storage.
///
/// Polls every 10ms and panics if the timeout is reached first.
pub async fn wait_for_state(
    storage: &dyn Storage,
    id: &JobId,
    expected: JobState,
    timeout: Duration,
) -> Job {
    let start = tokio::time::Instant::now();
    loop {
        let job = storage.get_job(id).await.unwrap();
        if job.state == expected {
            return job;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {} to reach {}, current state: {}",
                id, expected, job.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
