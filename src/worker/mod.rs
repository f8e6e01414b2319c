//! Worker loop for processing queued jobs.
//!
//! Each worker repeatedly claims the oldest eligible job, runs its command,
//! and records the outcome (completed, retried with backoff, or dead). Many
//! workers, usually in separate processes, can share one store.

mod engine;
mod handle;
mod types;

pub use engine::Worker;
pub use handle::WorkerHandle;
pub use types::{
    DEFAULT_MAX_IDLE_CYCLES, DEFAULT_POLL_INTERVAL, StopReason, WorkerError, WorkerOptions,
    WorkerSummary,
};
