//! SQLite connection setup and schema.
//!
//! One database file holds three tables: `jobs`, `dlq` and `config`. Several
//! processes may open the same file; WAL mode plus a busy timeout lets their
//! transactions interleave, and anything that still collides surfaces as
//! [`QueueError::Contention`](jobq_core::QueueError::Contention).

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use jobq_core::{QueueConfig, QueueError, QueueResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::jobs::sqlite::map_sqlx_error;

/// How long a connection waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_CONNECTIONS: u32 = 8;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id                TEXT PRIMARY KEY,
        command           TEXT NOT NULL,
        state             TEXT NOT NULL,
        attempts          INTEGER NOT NULL DEFAULT 0,
        max_retries       INTEGER NOT NULL,
        base_backoff      INTEGER NOT NULL,
        priority          INTEGER NOT NULL DEFAULT 0,
        run_at            TEXT NOT NULL,
        next_run_at       TEXT NULL,
        lease_expires_at  TEXT NULL,
        worker_id         TEXT NULL,
        last_error        TEXT NULL,
        created_at        TEXT NOT NULL,
        updated_at        TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (state, priority, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS dlq (
        id           TEXT PRIMARY KEY,
        original_id  TEXT NOT NULL,
        command      TEXT NOT NULL,
        attempts     INTEGER NOT NULL,
        last_error   TEXT NULL,
        created_at   TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    )
    "#,
];

/// Open (creating if needed) the queue database at `path` and migrate it.
pub async fn connect(path: impl AsRef<Path>) -> QueueResult<SqlitePool> {
    let path = path.as_ref();
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    migrate(&pool).await?;
    info!(path = %path.display(), "queue database ready");
    Ok(pool)
}

/// A private in-memory database, for tests and benchmarks.
///
/// Every connection to `:memory:` is a separate database, so the pool is
/// pinned to a single connection that never expires.
pub async fn connect_in_memory() -> QueueResult<SqlitePool> {
    let options = SqliteConnectOptions::new().in_memory(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Create the tables if missing and seed config defaults without touching
/// values an operator has already set.
pub async fn migrate(pool: &SqlitePool) -> QueueResult<()> {
    for statement in SCHEMA {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
    }

    let seeded_at = encode_ts(Utc::now());
    for (key, value) in QueueConfig::default().entries() {
        sqlx::query("INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)")
            .bind(key.as_str())
            .bind(value)
            .bind(&seeded_at)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("seed_config", e))?;
    }

    debug!("schema migrated");
    Ok(())
}

/// Canonical text form of a timestamp.
///
/// Fixed-width UTC with microseconds, so string order in SQL matches time
/// order.
pub(crate) fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(column: &str, raw: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| QueueError::store(format!("invalid timestamp in {column}: '{raw}' ({e})")))
}
