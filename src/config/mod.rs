//! Queue configuration.
//!
//! Queue-wide settings are stored next to the jobs so every worker process
//! sees the same values.

mod error;
mod types;

pub use error::ConfigError;
pub use types::{
    BACKOFF_BASE_KEY, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRIES_KEY, QueueConfig,
    validate_setting,
};
