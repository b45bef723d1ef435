//! SQLite database connection management.
//!
//! Provides a connection pool to the SQLite database with WAL mode
//! enabled, so readers never block the single writer. The database file
//! and its parent directories are created automatically.
//!
//! Every connection carries a busy timeout: a transaction that needs the
//! write lock while another transaction holds it waits up to
//! `db.busy_timeout_ms`, then fails with `SQLITE_BUSY`, which the engines
//! treat as transient and retry.
//!
//! The engines lock a row by opening their transaction with a no-op
//! `UPDATE` on it. SQLite grants the write lock for the whole database,
//! not the row, so writers to unrelated reports or projects also queue
//! behind each other. Correctness per row is unaffected; throughput is
//! one writer at a time.
//!
//! Timestamps are stored as Unix milliseconds. Any instant compared
//! against a stored one must first be truncated the same way.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Create a connection pool to the configured SQLite database.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(config.db.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Current time truncated to the millisecond precision stored on disk.
pub fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Decode a JSON text column. A corrupt value is an error, never a default.
pub(crate) fn decode_json<T: DeserializeOwned>(
    column: &'static str,
    raw: &str,
) -> crate::error::Result<T> {
    serde_json::from_str(raw).map_err(|e| crate::error::Error::decode(column, e))
}
