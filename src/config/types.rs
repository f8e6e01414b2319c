//! Queue configuration snapshot.
//!
//! Settings live in the store's `config` table as plain strings. A worker
//! reads them once on start, so later changes only affect new workers.
//! A value that does not parse is logged and replaced by its default; only
//! failing to read the table is an error.

use serde::Serialize;

use super::error::ConfigError;
use crate::core::backoff::BackoffPolicy;
use crate::storage::Storage;

/// Config key for the backoff exponent base.
pub const BACKOFF_BASE_KEY: &str = "backoff_base";
/// Config key for the retry budget of jobs enqueued without one.
pub const DEFAULT_MAX_RETRIES_KEY: &str = "default_max_retries";
/// Retry budget used when the config table has no entry.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Parsed queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueConfig {
    /// Backoff applied after each failed attempt.
    pub backoff: BackoffPolicy,
    /// Retry budget for jobs that do not set `max_retries`.
    pub default_max_retries: u32,
}

impl QueueConfig {
    /// Read and parse the config table. Missing or invalid values fall back
    /// to defaults.
    pub async fn load(storage: &dyn Storage) -> Result<Self, ConfigError> {
        let config = Self {
            backoff: read_setting(storage, BACKOFF_BASE_KEY, parse_backoff_base)
                .await?
                .unwrap_or_default(),
            default_max_retries: Self::load_default_max_retries(storage).await?,
        };

        tracing::debug!(
            backoff_base = config.backoff.base(),
            default_max_retries = config.default_max_retries,
            "Loaded queue configuration"
        );
        Ok(config)
    }

    /// Read only the retry budget for new jobs.
    pub async fn load_default_max_retries(storage: &dyn Storage) -> Result<u32, ConfigError> {
        Ok(read_setting(storage, DEFAULT_MAX_RETRIES_KEY, parse_max_retries)
            .await?
            .unwrap_or(DEFAULT_MAX_RETRIES))
    }
}

async fn read_setting<T>(
    storage: &dyn Storage,
    key: &str,
    parse: fn(&str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = storage.get_config(key).await? else {
        return Ok(None);
    };
    match parse(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring invalid config value, using default");
            Ok(None)
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Check whether [`QueueConfig::load`] will accept a value.
///
/// Unknown keys are always accepted.
pub fn validate_setting(key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        BACKOFF_BASE_KEY => parse_backoff_base(value).map(drop),
        DEFAULT_MAX_RETRIES_KEY => parse_max_retries(value).map(drop),
        _ => Ok(()),
    }
}

fn parse_backoff_base(raw: &str) -> Result<BackoffPolicy, ConfigError> {
    let invalid = |reason| ConfigError::InvalidValue {
        key: BACKOFF_BASE_KEY.to_string(),
        value: raw.to_string(),
        reason,
    };
    let base: f64 = raw.trim().parse().map_err(|_| invalid("not a number"))?;
    BackoffPolicy::exponential(base).ok_or_else(|| invalid("must be a positive number"))
}

fn parse_max_retries(raw: &str) -> Result<u32, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: DEFAULT_MAX_RETRIES_KEY.to_string(),
            value: raw.to_string(),
            reason: "must be a non-negative integer",
        })
}
