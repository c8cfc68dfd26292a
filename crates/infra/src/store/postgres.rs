//! Postgres-backed job store.
//!
//! ## Atomicity
//!
//! - `claim` is one `UPDATE … FROM (SELECT … FOR UPDATE SKIP LOCKED)` statement.
//!   Rows locked by a concurrent claimant are skipped rather than waited on, so
//!   no two claimants (threads or processes) can receive the same job.
//! - `complete`, `fail`, `renew`, `cancel` and `reclaim_expired` lock their rows
//!   with `SELECT … FOR UPDATE` inside a transaction, apply the transition
//!   methods of [`Job`] and write the row back.
//!
//! All timestamps come from the database clock (`now()`), so claimants on
//! different hosts agree on lease expiry.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|-----------------------|------------|
//! | Database (unique violation) | `23505` | `Storage` |
//! | Database (serialization / deadlock) | `40001`, `40P01` | `StoreUnavailable` |
//! | Database (connection exception / shutdown) | `08xxx`, `57P0x` | `StoreUnavailable` |
//! | Database (other) | any other | `Storage` |
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | N/A | `StoreUnavailable` |
//! | Decode / other | N/A | `Storage` |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{FromRow, Postgres, Row, Transaction};
use tracing::{debug, info, instrument};

use taskmill_core::{
    Backoff, Job, JobId, JobState, JobStats, QueueError, QueueResult, WorkerId,
};

use super::{ClaimRequest, JobStore};
use crate::config::PostgresConfig;

const JOB_COLUMNS: &str = "id, job_type, payload, state, attempts, max_attempts, priority, \
     not_before, claimed_by, claim_expires_at, last_error, created_at, updated_at";

/// Upper bound on rows handled by one reclaim sweep transaction.
const RECLAIM_BATCH: i64 = 500;

/// Idempotent schema setup, executed in order by [`PostgresJobStore::migrate`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS taskmill_jobs (
        id                UUID PRIMARY KEY,
        job_type          TEXT NOT NULL,
        payload           JSONB NOT NULL,
        state             TEXT NOT NULL CHECK (state IN
                              ('created', 'active', 'completed', 'failed', 'retrying', 'expired')),
        attempts          INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts      INTEGER NOT NULL CHECK (max_attempts >= 1),
        priority          INTEGER NOT NULL DEFAULT 0,
        not_before        TIMESTAMPTZ NOT NULL,
        claimed_by        UUID NULL,
        claim_expires_at  TIMESTAMPTZ NULL,
        last_error        TEXT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL,
        CHECK (attempts <= max_attempts)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS taskmill_jobs_claimable_idx
        ON taskmill_jobs (job_type, priority DESC, not_before ASC, created_at ASC)
        WHERE state IN ('created', 'retrying')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS taskmill_jobs_lease_idx
        ON taskmill_jobs (claim_expires_at)
        WHERE state = 'active'
    "#,
];

/// Postgres job store.
///
/// `Clone` is cheap: the pool is reference counted.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool. Fails with `StoreUnavailable` if the database
    /// cannot be reached.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &PostgresConfig) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the job table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> QueueResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        info!("job schema ready");
        Ok(())
    }

    /// Lock one row, apply `f` at the database's `now()`, write it back.
    ///
    /// If `f` rejects the transition the transaction is dropped (rolled back).
    async fn update_job<T, F>(
        &self,
        operation: &'static str,
        id: JobId,
        f: F,
    ) -> QueueResult<(Job, T)>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> QueueResult<T> + Send,
        T: Send,
    {
        let mut tx = self.begin(operation).await?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}, now() AS db_now FROM taskmill_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or(QueueError::NotFound(id))?;

        let now: DateTime<Utc> = row
            .try_get("db_now")
            .map_err(|e| map_sqlx_error(operation, e))?;
        let mut job = decode_job(&row)?;

        let out = f(&mut job, now)?;
        write_job(&mut tx, operation, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        Ok((job, out))
    }

    async fn begin(&self, operation: &'static str) -> QueueResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: Job) -> QueueResult<JobId> {
        let attempts = db_count("attempts", job.attempts, job.id)?;
        let max_attempts = db_count("max_attempts", job.max_attempts, job.id)?;
        sqlx::query(&format!(
            "INSERT INTO taskmill_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        ))
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(attempts)
        .bind(max_attempts)
        .bind(job.priority)
        .bind(job.not_before)
        .bind(job.claimed_by.map(uuid::Uuid::from))
        .bind(job.claim_expires_at)
        .bind(&job.last_error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::storage(format!("job already exists: {}", job.id))
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM taskmill_jobs WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self, request), fields(worker = %worker, limit = request.limit), err)]
    async fn claim(&self, worker: WorkerId, request: &ClaimRequest) -> QueueResult<Vec<Job>> {
        if request.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE taskmill_jobs AS j
            SET state = 'active',
                attempts = j.attempts + 1,
                claimed_by = $1,
                claim_expires_at = now() + make_interval(secs => $2),
                updated_at = now()
            FROM (
                SELECT id
                FROM taskmill_jobs
                WHERE state IN ('created', 'retrying')
                  AND not_before <= now()
                  AND job_type = ANY($3)
                ORDER BY priority DESC, not_before ASC, created_at ASC, id ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            ) AS next
            WHERE j.id = next.id
            RETURNING {}
            "#,
            prefixed_columns("j")
        ))
        .bind(worker.as_uuid())
        .bind(request.lease.as_secs_f64())
        .bind(&request.types)
        .bind(i64::try_from(request.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        // RETURNING does not preserve the subquery order.
        let mut jobs = rows.iter().map(decode_job).collect::<QueueResult<Vec<_>>>()?;
        jobs.sort_by(Job::claim_order);

        debug!(claimed = jobs.len(), "claimed jobs");
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn renew(
        &self,
        id: JobId,
        worker: WorkerId,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let (_, expires) = self
            .update_job("renew", id, |job, now| job.renew(worker, lease, now))
            .await?;
        Ok(expires)
    }

    #[instrument(skip(self), err)]
    async fn complete(&self, id: JobId, worker: WorkerId) -> QueueResult<Job> {
        let (job, ()) = self
            .update_job("complete", id, |job, now| job.complete(worker, now))
            .await?;
        Ok(job)
    }

    #[instrument(skip(self, backoff), err)]
    async fn fail(
        &self,
        id: JobId,
        worker: WorkerId,
        reason: &str,
        retryable: bool,
        backoff: &Backoff,
    ) -> QueueResult<Job> {
        let backoff = *backoff;
        let (job, ()) = self
            .update_job("fail", id, |job, now| {
                job.fail(worker, reason, retryable, &backoff, now)
            })
            .await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn cancel(&self, id: JobId) -> QueueResult<Option<Job>> {
        let (job, cancelled) = self
            .update_job("cancel", id, |job, now| Ok(job.cancel(now)))
            .await?;
        Ok(cancelled.then_some(job))
    }

    #[instrument(skip(self, backoff), err)]
    async fn reclaim_expired(&self, backoff: &Backoff) -> QueueResult<Vec<Job>> {
        let mut tx = self.begin("reclaim_expired").await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}, now() AS db_now
            FROM taskmill_jobs
            WHERE state = 'active' AND claim_expires_at <= now()
            ORDER BY claim_expires_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(RECLAIM_BATCH)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_expired", e))?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let now: DateTime<Utc> = row
                .try_get("db_now")
                .map_err(|e| map_sqlx_error("reclaim_expired", e))?;
            let mut job = decode_job(row)?;
            job.reclaim(backoff, now)?;
            write_job(&mut tx, "reclaim_expired", &job).await?;
            reclaimed.push(job);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("reclaim_expired", e))?;
        Ok(reclaimed)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> QueueResult<JobStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM taskmill_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let total: i64 = row.try_get("total").map_err(|e| map_sqlx_error("stats", e))?;
            stats.add(state.parse()?, u64::try_from(total).unwrap_or(0));
        }
        Ok(stats)
    }
}

async fn write_job(
    tx: &mut Transaction<'static, Postgres>,
    operation: &'static str,
    job: &Job,
) -> QueueResult<()> {
    let attempts = db_count("attempts", job.attempts, job.id)?;
    sqlx::query(
        r#"
        UPDATE taskmill_jobs
        SET state = $2,
            attempts = $3,
            not_before = $4,
            claimed_by = $5,
            claim_expires_at = $6,
            last_error = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.state.as_str())
    .bind(attempts)
    .bind(job.not_before)
    .bind(job.claimed_by.map(uuid::Uuid::from))
    .bind(job.claim_expires_at)
    .bind(&job.last_error)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

/// Counters are `INTEGER` columns.
fn db_count(name: &str, value: u32, id: JobId) -> QueueResult<i32> {
    i32::try_from(value)
        .map_err(|_| QueueError::storage(format!("{name} {value} out of range on job {id}")))
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn decode_job(row: &PgRow) -> QueueResult<Job> {
    JobRow::from_row(row)
        .map_err(|e| QueueError::storage(format!("failed to decode job row: {e}")))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Serialization failure / deadlock: the statement can be retried.
                Some("40001") | Some("40P01") => QueueError::unavailable(msg),
                // Connection exception, admin shutdown, crash shutdown, cannot connect now.
                Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                    QueueError::unavailable(msg)
                }
                _ => QueueError::storage(msg),
            }
        }
        sqlx::Error::Io(e) => QueueError::unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => QueueError::unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            QueueError::unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            QueueError::unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::WorkerCrashed => {
            QueueError::unavailable(format!("connection worker crashed in {operation}"))
        }
        sqlx::Error::Configuration(e) => {
            QueueError::configuration(format!("database configuration in {operation}: {e}"))
        }
        other => QueueError::storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    payload: serde_json::Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    not_before: DateTime<Utc>,
    claimed_by: Option<uuid::Uuid>,
    claim_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            not_before: row.try_get("not_before")?,
            claimed_by: row.try_get("claimed_by")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let count = |name: &str, v: i32| {
            u32::try_from(v)
                .map_err(|_| QueueError::storage(format!("negative {name} on job {}", row.id)))
        };
        Ok(Job {
            id: JobId::from_uuid(row.id),
            state: row.state.parse::<JobState>()?,
            attempts: count("attempts", row.attempts)?,
            max_attempts: count("max_attempts", row.max_attempts)?,
            job_type: row.job_type,
            payload: row.payload,
            priority: row.priority,
            not_before: row.not_before,
            claimed_by: row.claimed_by.map(WorkerId::from_uuid),
            claim_expires_at: row.claim_expires_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(state: &str, attempts: i32) -> JobRow {
        let now = Utc::now();
        JobRow {
            id: uuid::Uuid::now_v7(),
            job_type: "email".into(),
            payload: serde_json::json!({"to": "x"}),
            state: state.into(),
            attempts,
            max_attempts: 3,
            priority: 2,
            not_before: now,
            claimed_by: None,
            claim_expires_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn row_converts_to_job() {
        let job = Job::try_from(row("retrying", 1)).unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.priority, 2);
    }

    #[test]
    fn corrupt_rows_are_storage_errors() {
        assert!(matches!(
            Job::try_from(row("paused", 0)),
            Err(QueueError::Storage(_))
        ));
        assert!(matches!(
            Job::try_from(row("created", -1)),
            Err(QueueError::Storage(_))
        ));
    }

    #[test]
    fn counters_beyond_integer_range_are_rejected() {
        let id = JobId::new();
        assert_eq!(db_count("max_attempts", 5, id).unwrap(), 5);
        assert_eq!(db_count("max_attempts", i32::MAX as u32, id).unwrap(), i32::MAX);
        assert!(matches!(
            db_count("max_attempts", 3_000_000_000, id),
            Err(QueueError::Storage(_))
        ));
    }

    #[test]
    fn returning_columns_are_qualified() {
        let cols = prefixed_columns("j");
        assert!(cols.starts_with("j.id, j.job_type"));
        assert!(cols.ends_with("j.updated_at"));
    }

    #[test]
    fn pool_exhaustion_is_transient() {
        assert!(map_sqlx_error("claim", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("claim", sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx_error("get", sqlx::Error::RowNotFound).is_transient());
    }
}
