//! A persistent shell job queue.
//!
//! Jobs are shell command lines stored in SQLite. Any number of worker
//! processes claim them oldest-first, run them through `sh -c` and record
//! the outcome. Failures are retried with exponential backoff until the
//! job's retry budget is spent, after which the job lands in a dead-letter
//! queue for an operator to inspect and requeue.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod queue;
pub mod storage;
pub mod supervisor;
pub mod testing;
pub mod worker;

pub use config::{ConfigError, QueueConfig};
pub use core::backoff::BackoffPolicy;
pub use core::job::{Job, JobRequest, RequestError, Resolution};
pub use core::types::{JobId, JobState};
pub use events::{Event, EventBus, EventHandler, TracingHandler};
pub use execution::{CommandExecutor, ShellExecutor};
pub use queue::{JobQueue, QueueError};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{InMemoryStorage, StateCounts, Storage, StorageError};
pub use supervisor::{PidManifest, StopReport, Supervisor, SupervisorError};
pub use worker::{StopReason, Worker, WorkerError, WorkerHandle, WorkerOptions, WorkerSummary};
