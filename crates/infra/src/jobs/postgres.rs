//! Postgres-backed job store.
//!
//! All time comparisons use the database clock (`NOW()`), so any number of
//! processes sharing the database agree on eligibility and liveness.
//!
//! ## Claiming
//!
//! `claim_batch` is a single statement:
//!
//! ```sql
//! UPDATE jobs SET status = 'running', ...
//! WHERE id IN (SELECT id FROM jobs WHERE <eligible> ORDER BY queued_at
//!              LIMIT $n FOR UPDATE SKIP LOCKED)
//! ```
//!
//! Concurrent claimers skip rows locked by each other instead of waiting, so
//! no row is returned twice and no claimer blocks on another.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (check / not-null violation) | `23514` / `23502` | `Corrupt` |
//! | Database (unique violation) | `23505` | `Validation` |
//! | Database (invalid text representation) | `22P02` | `Validation` |
//! | Database (datetime field overflow) | `22008` | `Validation` |
//! | Database (other) | any other | `Unavailable` |
//! | Decode / ColumnDecode / ColumnNotFound | N/A | `Corrupt` |
//! | PoolClosed / PoolTimedOut / Io / Tls / other | N/A | `Unavailable` |

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};

use fediq_core::{JobId, QueueName};
use fediq_jobs::{Job, JobException, JobRecord, JobStatus, RetryDecision, orphan_exception};

use super::store::{JobFilter, JobStats, JobStore, NewJob, StoreError};

/// Idempotent DDL for the `jobs` table.
pub const SCHEMA: &str = include_str!("../../migrations/0001_jobs.sql");

macro_rules! job_columns {
    () => {
        "id, queue, status::text AS status, queued_at, started_at, finished_at, \
         delayed_until, heartbeat_at, retry_count, exception_message, exception_source, data"
    };
}

/// Postgres job store.
///
/// `Send + Sync` and cheap to clone; all operations go through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `job_status` type, the `jobs` table and its indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    /// Explain why `operation` matched no running row for `id`.
    async fn rejection(&self, id: JobId, operation: &'static str) -> StoreError {
        let row = sqlx::query("SELECT status::text AS status FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(None) => StoreError::NotFound(id),
            Ok(Some(row)) => match row
                .try_get::<String, _>("status")
                .map_err(|e| map_sqlx_error(operation, e))
                .and_then(|s| parse_status(&s))
            {
                Ok(from) => StoreError::InvalidTransition {
                    id,
                    from,
                    operation,
                },
                Err(e) => e,
            },
            Err(e) => map_sqlx_error(operation, e),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue, job_id), err)]
    async fn enqueue(&self, job: NewJob) -> Result<Job, StoreError> {
        job.check_delay(Utc::now())?;
        let id = JobId::new();
        Span::current().record("job_id", tracing::field::display(id));

        let delay_ms = job.effective_delay().map(duration_millis);
        let status = if delay_ms.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Queued
        };

        let row = sqlx::query(concat!(
            "INSERT INTO jobs (id, queue, status, queued_at, delayed_until, retry_count, data) \
             VALUES ($1, $2, $3::job_status, NOW(), \
                     NOW() + ($4::bigint * INTERVAL '1 millisecond'), 0, $5) \
             RETURNING ",
            job_columns!()
        ))
        .bind(id.as_uuid())
        .bind(job.queue.as_str())
        .bind(status.as_str())
        .bind(delay_ms)
        .bind(job.data)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("enqueue", e))?;

        job_from_row(&row)
    }

    #[instrument(skip(self), fields(queue = %queue, claimed), err)]
    async fn claim_batch(&self, queue: &QueueName, max: usize) -> Result<Vec<Job>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(concat!(
            "UPDATE jobs \
             SET status = 'running', \
                 started_at = COALESCE(started_at, NOW()), \
                 heartbeat_at = NOW(), \
                 delayed_until = NULL \
             WHERE id IN ( \
                 SELECT id FROM jobs \
                 WHERE queue = $1 \
                   AND (status = 'queued' OR (status = 'delayed' AND delayed_until <= NOW())) \
                 ORDER BY queued_at, id \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED) \
             RETURNING ",
            job_columns!()
        ))
        .bind(queue.as_str())
        .bind(i64::try_from(max).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by(|a, b| {
            a.queued_at()
                .cmp(&b.queued_at())
                .then_with(|| a.id().cmp(&b.id()))
        });

        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn complete(&self, id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs \
             SET status = 'completed', finished_at = NOW(), heartbeat_at = NULL \
             WHERE id = $1 AND status = 'running' \
             RETURNING ",
            job_columns!()
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.rejection(id, "complete").await),
        }
    }

    #[instrument(skip(self, exception), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        exception: JobException,
        decision: RetryDecision,
    ) -> Result<Job, StoreError> {
        let query = match decision {
            RetryDecision::Retry { delay } => sqlx::query(concat!(
                "UPDATE jobs \
                 SET status = 'delayed', \
                     delayed_until = NOW() + ($2::bigint * INTERVAL '1 millisecond'), \
                     heartbeat_at = NULL, \
                     retry_count = retry_count + 1, \
                     exception_message = $3, \
                     exception_source = $4 \
                 WHERE id = $1 AND status = 'running' \
                 RETURNING ",
                job_columns!()
            ))
            .bind(id.as_uuid())
            .bind(duration_millis(delay)),
            RetryDecision::Terminal => sqlx::query(concat!(
                "UPDATE jobs \
                 SET status = 'failed', \
                     finished_at = NOW(), \
                     heartbeat_at = NULL, \
                     exception_message = $2, \
                     exception_source = $3 \
                 WHERE id = $1 AND status = 'running' \
                 RETURNING ",
                job_columns!()
            ))
            .bind(id.as_uuid()),
        };

        let row = query
            .bind(exception.message)
            .bind(exception.source)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("fail", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.rejection(id, "fail").await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn heartbeat(&self, id: JobId) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE jobs SET heartbeat_at = NOW() WHERE id = $1 AND status = 'running'")
                .bind(id.as_uuid())
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.rejection(id, "heartbeat").await {
            StoreError::InvalidTransition { .. } => Ok(false),
            other => Err(other),
        }
    }

    #[instrument(skip(self), fields(recovered), err)]
    async fn requeue_orphaned(&self, liveness_timeout: Duration) -> Result<u64, StoreError> {
        let exception = orphan_exception(liveness_timeout);

        let result = sqlx::query(
            "UPDATE jobs \
             SET status = 'queued', \
                 heartbeat_at = NULL, \
                 retry_count = retry_count + 1, \
                 exception_message = $2, \
                 exception_source = $3 \
             WHERE status = 'running' \
               AND heartbeat_at < NOW() - ($1::bigint * INTERVAL '1 millisecond')",
        )
        .bind(duration_millis(liveness_timeout))
        .bind(exception.message)
        .bind(exception.source)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_orphaned", e))?;

        let recovered = result.rows_affected();
        Span::current().record("recovered", recovered);
        Ok(recovered)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs \
              WHERE ($1::text IS NULL OR queue = $1) \
                AND ($2::text IS NULL OR status = $2::job_status) \
              ORDER BY queued_at, id \
              LIMIT $3"
        ))
        .bind(filter.queue.as_ref().map(QueueName::as_str))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn stats(&self, queue: &QueueName) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status::text AS status, COUNT(*) AS count \
             FROM jobs WHERE queue = $1 GROUP BY status",
        )
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in &rows {
            let (status, count) = status_count(row)?;
            stats.add(status, count);
        }
        Ok(stats)
    }

    #[instrument(skip(self), err)]
    async fn stats_by_queue(&self) -> Result<BTreeMap<QueueName, JobStats>, StoreError> {
        let rows = sqlx::query(
            "SELECT queue, status::text AS status, COUNT(*) AS count \
             FROM jobs GROUP BY queue, status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats_by_queue", e))?;

        let mut by_queue: BTreeMap<QueueName, JobStats> = BTreeMap::new();
        for row in &rows {
            let queue: String = row
                .try_get("queue")
                .map_err(|e| map_sqlx_error("stats_by_queue", e))?;
            let queue = QueueName::new(queue).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let (status, count) = status_count(row)?;
            by_queue.entry(queue).or_default().add(status, count);
        }
        Ok(by_queue)
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_status(s: &str) -> Result<JobStatus, StoreError> {
    s.parse()
        .map_err(|e: fediq_core::DomainError| StoreError::Corrupt(e.to_string()))
}

fn status_count(row: &PgRow) -> Result<(JobStatus, u64), StoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| map_sqlx_error("stats", e))?;
    let count: i64 = row
        .try_get("count")
        .map_err(|e| map_sqlx_error("stats", e))?;
    Ok((parse_status(&status)?, u64::try_from(count).unwrap_or(0)))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode job row: {e}")))?;
    let record = JobRecord::try_from(row)?;
    Job::try_from(record).map_err(|e| StoreError::Corrupt(e.to_string()))
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") | Some("23502") => StoreError::Corrupt(msg),
                Some("23505") | Some("22P02") | Some("22008") => StoreError::Validation(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("failed to decode row in {operation}: {err}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

/// Internal row representation for decoding from Postgres.
struct JobRow {
    id: uuid::Uuid,
    queue: String,
    status: String,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    delayed_until: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    retry_count: i32,
    exception_message: Option<String>,
    exception_source: Option<String>,
    data: Vec<u8>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            status: row.try_get("status")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            delayed_until: row.try_get("delayed_until")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            retry_count: row.try_get("retry_count")?,
            exception_message: row.try_get("exception_message")?,
            exception_source: row.try_get("exception_source")?,
            data: row.try_get("data")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            queue: QueueName::new(row.queue).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            status: parse_status(&row.status)?,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            delayed_until: row.delayed_until,
            heartbeat_at: row.heartbeat_at,
            retry_count: u32::try_from(row.retry_count).map_err(|_| {
                StoreError::Corrupt(format!("negative retry_count {}", row.retry_count))
            })?,
            exception_message: row.exception_message,
            exception_source: row.exception_source,
            data: row.data,
        })
    }
}
