//! Worker lifecycle events and event handling.
//!
//! The worker loop reports what it does as [`Event`] values on an
//! [`EventBus`]. Handlers decide where events go; [`TracingHandler`] writes
//! them to the `tracing` subscriber, tests record them in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::types::JobId;
use crate::worker::{StopReason, WorkerSummary};

/// Lifecycle events emitted by a worker.
#[derive(Debug, Clone)]
pub enum Event {
    /// A worker loop has started.
    WorkerStarted {
        worker: String,
        timestamp: DateTime<Utc>,
    },

    /// Claiming failed; the cycle is treated as empty.
    ClaimFailed {
        worker: String,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A job was claimed and its command is about to run.
    JobProcessing {
        worker: String,
        job_id: JobId,
        command: String,
        /// 1-indexed execution number.
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A job's command exited with status 0.
    JobCompleted {
        worker: String,
        job_id: JobId,
        duration: Duration,
        timestamp: DateTime<Utc>,
    },

    /// A job failed and was put back in the queue.
    RetryScheduled {
        worker: String,
        job_id: JobId,
        exit_code: i32,
        /// Failed executions so far.
        attempts: u32,
        delay_secs: f64,
        timestamp: DateTime<Utc>,
    },

    /// A job exhausted its retries.
    JobDeadLettered {
        worker: String,
        job_id: JobId,
        exit_code: i32,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// Recording the outcome of an executed job failed.
    UpdateFailed {
        worker: String,
        job_id: JobId,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A worker loop has exited.
    WorkerStopped {
        worker: String,
        reason: StopReason,
        summary: WorkerSummary,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::WorkerStarted { timestamp, .. }
            | Event::ClaimFailed { timestamp, .. }
            | Event::JobProcessing { timestamp, .. }
            | Event::JobCompleted { timestamp, .. }
            | Event::RetryScheduled { timestamp, .. }
            | Event::JobDeadLettered { timestamp, .. }
            | Event::UpdateFailed { timestamp, .. }
            | Event::WorkerStopped { timestamp, .. } => *timestamp,
        }
    }

    /// The job this event is about, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Event::JobProcessing { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::RetryScheduled { job_id, .. }
            | Event::JobDeadLettered { job_id, .. }
            | Event::UpdateFailed { job_id, .. } => Some(job_id),
            _ => None,
        }
    }

    /// The worker that emitted this event.
    pub fn worker(&self) -> &str {
        match self {
            Event::WorkerStarted { worker, .. }
            | Event::ClaimFailed { worker, .. }
            | Event::JobProcessing { worker, .. }
            | Event::JobCompleted { worker, .. }
            | Event::RetryScheduled { worker, .. }
            | Event::JobDeadLettered { worker, .. }
            | Event::UpdateFailed { worker, .. }
            | Event::WorkerStopped { worker, .. } => worker,
        }
    }
}

/// Handler for receiving worker events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes events to the active `tracing` subscriber.
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::WorkerStarted { worker, .. } => {
                tracing::info!(worker = %worker, "worker starting");
            }
            Event::ClaimFailed { worker, error, .. } => {
                tracing::warn!(worker = %worker, error = %error, "claim error");
            }
            Event::JobProcessing {
                worker,
                job_id,
                command,
                attempt,
                ..
            } => {
                tracing::info!(worker = %worker, job_id = %job_id, command = %command, attempt, "processing");
            }
            Event::JobCompleted {
                worker,
                job_id,
                duration,
                ..
            } => {
                tracing::info!(worker = %worker, job_id = %job_id, duration = ?duration, "completed");
            }
            Event::RetryScheduled {
                worker,
                job_id,
                exit_code,
                attempts,
                delay_secs,
                ..
            } => {
                tracing::warn!(
                    worker = %worker,
                    job_id = %job_id,
                    exit_code,
                    attempts,
                    "retry scheduled in {}s",
                    delay_secs
                );
            }
            Event::JobDeadLettered {
                worker,
                job_id,
                exit_code,
                attempts,
                ..
            } => {
                tracing::error!(worker = %worker, job_id = %job_id, exit_code, attempts, "moved to DLQ");
            }
            Event::UpdateFailed {
                worker,
                job_id,
                error,
                ..
            } => {
                tracing::error!(worker = %worker, job_id = %job_id, error = %error, "failed to record job outcome");
            }
            Event::WorkerStopped {
                worker,
                reason,
                summary,
                ..
            } => {
                tracing::info!(
                    worker = %worker,
                    reason = ?reason,
                    processed = summary.processed,
                    completed = summary.completed,
                    retried = summary.retried,
                    dead = summary.dead,
                    "worker stopped"
                );
            }
        }
    }
}
