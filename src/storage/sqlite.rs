//! SQLite storage implementation.
//!
//! Provides durable storage in a single SQLite file opened in WAL mode, so
//! several worker processes can share one queue. Cross-process exclusion
//! comes from SQLite's write lock: the claim runs inside `BEGIN IMMEDIATE`
//! and flips the row with a compare-and-swap on `state`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::error::DatabaseError;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{StateCounts, Storage, StorageError};
use crate::core::job::Job;
use crate::core::types::{JobId, JobState, ParseStateError};

/// How long a connection waits on another writer before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_JOB: &str = "SELECT id, command, state, attempts, max_retries, created_at, updated_at, next_run, last_error FROM jobs";

type JobRow = (
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    Option<String>,
);

/// SQLite storage backend.
///
/// Provides persistent storage with automatic schema migration.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the queue database at the given path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite database (useful for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Other(e.to_string()))?;

        // A single connection that never expires, or the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Explain why a conditional update on `id` touched no rows.
    async fn conflict(&self, id: &JobId, expected: JobState) -> StorageError {
        match self.get_job(id).await {
            Ok(_) => StorageError::StateConflict {
                id: id.clone(),
                expected,
            },
            Err(e) => e,
        }
    }
}

fn map_sqlx_error(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if is_busy(&**db) => StorageError::Busy(e.to_string()),
        sqlx::Error::PoolTimedOut => StorageError::Busy(e.to_string()),
        _ => StorageError::Other(e.to_string()),
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy(db: &dyn DatabaseError) -> bool {
    db.code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, 5 | 6))
}

fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::SerializationError(format!("invalid timestamp: {}", millis)))
}

fn to_count(value: i64, column: &str) -> Result<u32, StorageError> {
    u32::try_from(value)
        .map_err(|_| StorageError::SerializationError(format!("invalid {}: {}", column, value)))
}

fn parse_state(s: &str) -> Result<JobState, StorageError> {
    s.parse()
        .map_err(|e: ParseStateError| StorageError::SerializationError(e.to_string()))
}

fn row_to_job(row: JobRow) -> Result<Job, StorageError> {
    Ok(Job {
        id: JobId::new(row.0),
        command: row.1,
        state: parse_state(&row.2)?,
        attempts: to_count(row.3, "attempts")?,
        max_retries: to_count(row.4, "max_retries")?,
        created_at: from_millis(row.5)?,
        updated_at: from_millis(row.6)?,
        next_run: from_millis(row.7)?,
        last_error: row.8,
    })
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn insert_job(&self, job: Job) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at, next_run, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .bind(to_millis(job.next_run))
        .bind(&job.last_error)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StorageError::DuplicateKey(format!("job: {}", job.id)))
            }
            Err(e) => Err(map_sqlx_error(e)),
        }
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let row: JobRow = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_JOB))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        row_to_job(row)
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, StorageError> {
        let rows: Vec<JobRow> = match state {
            Some(state) => {
                sqlx::query_as(&format!(
                    "{} WHERE state = ? ORDER BY created_at, rowid",
                    SELECT_JOB
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(&format!("{} ORDER BY created_at, rowid", SELECT_JOB))
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn state_counts(&self) -> Result<StateCounts, StorageError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let mut counts = StateCounts::default();
        for (state, n) in rows {
            counts.add(parse_state(&state)?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, StorageError> {
        let now_ms = to_millis(now);
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(map_sqlx_error)?;

        let candidate: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE state = 'pending' AND next_run <= ? ORDER BY created_at, rowid LIMIT 1",
        )
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let Some((id,)) = candidate else {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(None);
        };

        // Compare-and-swap: only a job that is still pending can be claimed.
        let claimed = sqlx::query(
            "UPDATE jobs SET state = 'processing', updated_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(now_ms)
        .bind(&id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(None);
        }

        let row: JobRow = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_JOB))
            .bind(&id)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        row_to_job(row).map(Some)
    }

    async fn complete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'completed', last_error = NULL, updated_at = ? WHERE id = ? AND state = 'processing'",
        )
        .bind(to_millis(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, JobState::Processing).await);
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &JobId,
        attempts: u32,
        next_run: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'pending', attempts = ?, next_run = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'processing'
            "#,
        )
        .bind(i64::from(attempts))
        .bind(to_millis(next_run))
        .bind(error)
        .bind(to_millis(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, JobState::Processing).await);
        }
        Ok(())
    }

    async fn mark_dead(
        &self,
        id: &JobId,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'dead', attempts = ?, last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'processing'
            "#,
        )
        .bind(i64::from(attempts))
        .bind(error)
        .bind(to_millis(now))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, JobState::Processing).await);
        }
        Ok(())
    }

    async fn retry_dead(&self, id: &JobId, now: DateTime<Utc>) -> Result<Job, StorageError> {
        let now_ms = to_millis(now);
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'pending', attempts = 0, next_run = ?, updated_at = ?
            WHERE id = ? AND state = 'dead'
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(self.conflict(id, JobState::Dead).await);
        }
        self.get_job(id).await
    }

    async fn get_config(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_config(&self) -> Result<Vec<(String, String)>, StorageError> {
        sqlx::query_as("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }
}
