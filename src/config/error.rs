//! Configuration error types.
//!
//! This module defines error types for loading and validating queue settings.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config value could not be parsed or is out of range.
    #[error("invalid value for '{key}': {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },

    /// Reading the config table failed.
    #[error("failed to read configuration: {0}")]
    Storage(#[from] StorageError),
}
