//! SQLite-backed job store.
//!
//! ## Claim protocol
//!
//! `claim_next` runs in one transaction:
//! 1. select the best eligible row (lowest `priority`, then oldest
//!    `created_at`);
//! 2. update it to `processing`, guarded by the same eligibility predicate;
//! 3. zero rows affected means another claimer won, reported as `Contention`;
//! 4. re-read and return the row.
//!
//! Eligible means waiting (`pending`/`failed`) with its run time reached, or
//! `processing` with an expired lease.
//!
//! ## Error mapping
//!
//! | SQLite result code | `QueueError` |
//! |---|---|
//! | `SQLITE_BUSY` (5), `SQLITE_BUSY_RECOVERY` (261) | `Contention` |
//! | `SQLITE_BUSY_SNAPSHOT` (517) | `Contention` |
//! | `SQLITE_LOCKED` (6), `SQLITE_LOCKED_SHAREDCACHE` (262) | `Contention` |
//! | any other database error | `Store` |
//! | pool closed / timed out, I/O, decode | `Store` |

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use jobq_core::{
    decide, ConfigKey, DeadLetterEntry, DeadLetterId, ExecutionOutcome, Job, JobId, JobState,
    QueueError, QueueResult, Resolution,
};

use super::store::JobStore;
use crate::db::{decode_ts, encode_ts};

/// Job store over a SQLite pool.
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn upsert(&self, job: &Job) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO jobs (
                id, command, state, attempts, max_retries, base_backoff, priority,
                run_at, next_run_at, lease_expires_at, worker_id, last_error,
                created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(i64::from(job.base_backoff))
        .bind(job.priority)
        .bind(encode_ts(job.run_at))
        .bind(job.next_run_at.map(encode_ts))
        .bind(job.lease_expires_at.map(encode_ts))
        .bind(job.worker_id.as_deref())
        .bind(job.last_error.as_deref())
        .bind(encode_ts(job.created_at))
        .bind(encode_ts(job.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(level = "debug", skip(self, lease, now))]
    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let now_text = encode_ts(now);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("claim_next.begin", e))?;

        let row = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE (state IN ('pending', 'failed') AND COALESCE(next_run_at, run_at) <= ?1)
               OR (state = 'processing' AND lease_expires_at < ?1)
            ORDER BY priority ASC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(&now_text)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next.select", e))?;

        let Some(row) = row else {
            return Err(QueueError::NoJobAvailable);
        };

        let mut job = row_to_job(&row)?;
        let previous_worker = job.worker_id.clone();
        let reclaim = job.lease_expired(now);
        job.claim(worker_id, lease, now)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing', worker_id = ?2, lease_expires_at = ?3, updated_at = ?1
            WHERE id = ?4
              AND ((state IN ('pending', 'failed') AND COALESCE(next_run_at, run_at) <= ?1)
                   OR (state = 'processing' AND lease_expires_at < ?1))
            "#,
        )
        .bind(&now_text)
        .bind(worker_id)
        .bind(job.lease_expires_at.map(encode_ts))
        .bind(job.id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("claim_next.update", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::contention(format!(
                "job {} was claimed by another worker",
                job.id
            )));
        }

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(job.id.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_next.reread", e))?;
        let claimed = row_to_job(&row)?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("claim_next.commit", e))?;

        if reclaim {
            warn!(
                job_id = %claimed.id,
                worker_id,
                previous_worker = previous_worker.as_deref().unwrap_or("unknown"),
                "reclaimed job with expired lease"
            );
        } else {
            debug!(job_id = %claimed.id, worker_id, "claimed job");
        }

        Ok(claimed)
    }

    #[instrument(skip(self, claimed, outcome, now), fields(job_id = %claimed.id), err)]
    async fn resolve(
        &self,
        claimed: &Job,
        outcome: &ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> QueueResult<Resolution> {
        let id = &claimed.id;
        let holder = claimed.worker_id.as_deref().unwrap_or("nobody");
        let lease_lost = || {
            QueueError::lease_lost(format!(
                "job {id} is no longer held by {holder} under this claim"
            ))
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("resolve.begin", e))?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("resolve.select", e))?;

        let mut job = match row {
            Some(row) => row_to_job(&row)?,
            None => return Err(QueueError::not_found(format!("job {id}"))),
        };

        if !job.is_held_under(claimed) {
            return Err(lease_lost());
        }

        let resolution = decide(&job, outcome, now);
        job.apply(&resolution, now)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?1, attempts = ?2, next_run_at = ?3, last_error = ?4,
                lease_expires_at = NULL, updated_at = ?5
            WHERE id = ?6 AND state = 'processing' AND worker_id = ?7 AND lease_expires_at = ?8
            "#,
        )
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(job.next_run_at.map(encode_ts))
        .bind(job.last_error.as_deref())
        .bind(encode_ts(now))
        .bind(id.as_str())
        .bind(holder)
        .bind(claimed.lease_expires_at.map(encode_ts))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("resolve.update", e))?;

        if result.rows_affected() == 0 {
            return Err(lease_lost());
        }

        if let Resolution::DeadLetter { .. } = &resolution {
            let entry = DeadLetterEntry::new(
                job.id.clone(),
                job.command.clone(),
                job.attempts,
                job.last_error.clone(),
                now,
            );
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO dlq
                    (id, original_id, command, attempts, last_error, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(entry.id.as_str())
            .bind(entry.original_id.as_str())
            .bind(&entry.command)
            .bind(i64::from(entry.attempts))
            .bind(entry.last_error.as_deref())
            .bind(encode_ts(entry.created_at))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("resolve.dead_letter", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("resolve.commit", e))?;

        Ok(resolution)
    }

    async fn list_by_state(&self, state: JobState) -> QueueResult<Vec<Job>> {
        let rows =
            sqlx::query("SELECT * FROM jobs WHERE state = ?1 ORDER BY created_at ASC, id ASC")
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(row_to_job).collect()
    }

    async fn state_counts(&self) -> QueueResult<BTreeMap<JobState, u64>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("state_counts", e))?;

        let mut counts: BTreeMap<JobState, u64> =
            JobState::ALL.into_iter().map(|state| (state, 0)).collect();
        for row in rows {
            let state: String = row.try_get("state").map_err(decode_error)?;
            let state = parse_state(&state)?;
            let n: i64 = row.try_get("n").map_err(decode_error)?;
            counts.insert(state, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn active_workers(&self) -> QueueResult<Vec<(String, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, COUNT(*) AS n FROM jobs
            WHERE state = 'processing' AND worker_id IS NOT NULL
            GROUP BY worker_id
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_workers", e))?;

        rows.iter()
            .map(|row| {
                let worker: String = row.try_get("worker_id").map_err(decode_error)?;
                let n: i64 = row.try_get("n").map_err(decode_error)?;
                Ok((worker, n.max(0) as u64))
            })
            .collect()
    }

    async fn list_dead_letters(&self) -> QueueResult<Vec<DeadLetterEntry>> {
        let rows = sqlx::query("SELECT * FROM dlq ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(row_to_dead_letter).collect()
    }

    async fn get_dead_letter(&self, id: &DeadLetterId) -> QueueResult<Option<DeadLetterEntry>> {
        let row = sqlx::query("SELECT * FROM dlq WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_dead_letter", e))?;

        row.as_ref().map(row_to_dead_letter).transpose()
    }

    async fn config_entries(&self) -> QueueResult<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("config_entries", e))?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("key").map_err(decode_error)?,
                    row.try_get("value").map_err(decode_error)?,
                ))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn set_config(&self, key: ConfigKey, value: &str) -> QueueResult<()> {
        sqlx::query(
            r#"
            INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key.as_str())
        .bind(value)
        .bind(encode_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_config", e))?;

        Ok(())
    }
}

/// Map a sqlx error to the queue error model.
///
/// Busy and locked databases are contention, not failures.
pub fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("5" | "6" | "261" | "262" | "517") => QueueError::Contention(msg),
                _ => QueueError::Store(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            QueueError::store(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            QueueError::store(format!("timed out waiting for a connection in {}", operation))
        }
        _ => QueueError::store(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(err: sqlx::Error) -> QueueError {
    map_sqlx_error("decode_row", err)
}

fn parse_state(raw: &str) -> QueueResult<JobState> {
    raw.parse()
        .map_err(|_| QueueError::store(format!("unknown job state '{raw}' in jobs table")))
}

fn to_u32(column: &str, value: i64) -> QueueResult<u32> {
    u32::try_from(value)
        .map_err(|_| QueueError::store(format!("{column} out of range in jobs table: {value}")))
}

fn optional_ts(row: &SqliteRow, column: &str) -> QueueResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column).map_err(decode_error)?;
    raw.as_deref().map(|raw| decode_ts(column, raw)).transpose()
}

fn required_ts(row: &SqliteRow, column: &str) -> QueueResult<DateTime<Utc>> {
    let raw: String = row.try_get(column).map_err(decode_error)?;
    decode_ts(column, &raw)
}

fn row_to_job(row: &SqliteRow) -> QueueResult<Job> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let id = JobId::new(id).map_err(|e| QueueError::store(format!("bad id in jobs table: {e}")))?;
    let state: String = row.try_get("state").map_err(decode_error)?;

    Ok(Job {
        id,
        command: row.try_get("command").map_err(decode_error)?,
        state: parse_state(&state)?,
        attempts: to_u32("attempts", row.try_get("attempts").map_err(decode_error)?)?,
        max_retries: to_u32("max_retries", row.try_get("max_retries").map_err(decode_error)?)?,
        base_backoff: to_u32("base_backoff", row.try_get("base_backoff").map_err(decode_error)?)?,
        priority: row.try_get("priority").map_err(decode_error)?,
        run_at: required_ts(row, "run_at")?,
        next_run_at: optional_ts(row, "next_run_at")?,
        lease_expires_at: optional_ts(row, "lease_expires_at")?,
        worker_id: row.try_get("worker_id").map_err(decode_error)?,
        last_error: row.try_get("last_error").map_err(decode_error)?,
        created_at: required_ts(row, "created_at")?,
        updated_at: required_ts(row, "updated_at")?,
    })
}

fn row_to_dead_letter(row: &SqliteRow) -> QueueResult<DeadLetterEntry> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let original_id: String = row.try_get("original_id").map_err(decode_error)?;
    let attempts: i64 = row.try_get("attempts").map_err(decode_error)?;

    Ok(DeadLetterEntry {
        id: DeadLetterId::new(id)
            .map_err(|e| QueueError::store(format!("bad id in dlq table: {e}")))?,
        original_id: JobId::new(original_id)
            .map_err(|e| QueueError::store(format!("bad original_id in dlq table: {e}")))?,
        command: row.try_get("command").map_err(decode_error)?,
        attempts: to_u32("attempts", attempts)?,
        last_error: row.try_get("last_error").map_err(decode_error)?,
        created_at: required_ts(row, "created_at")?,
    })
}
