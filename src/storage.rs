//! Raw SQL access to the job and execution tables.
//!
//! Everything here is a thin function over `sqlx` queries; higher layers
//! (scheduler, cron manager, administrative actions) compose these instead of
//! embedding SQL themselves.

use crate::errors::EnqueueError;
use crate::schema::{Execution, Job};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

/// Create (or update) the `lockstep_jobs` and `lockstep_executions` tables.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}

/// Parameters for a new job row.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    /// Type identifier used for dispatch.
    pub job_type: &'a str,
    /// Serialized payload.
    pub data: Value,
    /// Target queue.
    pub queue_name: &'a str,
    /// Priority (higher runs first).
    pub priority: i32,
    /// Earliest eligible run time; `None` means now.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Deduplication/throttle key. When set, the insert is skipped if another
    /// unfinished job with the same key exists.
    pub concurrency_key: Option<&'a str>,
}

/// Insert a job row, honoring the concurrency-key deduplication rule.
///
/// Returns `None` if an unfinished job with the same `concurrency_key`
/// already exists and the insert was skipped.
pub async fn insert_job(pool: &PgPool, job: NewJob<'_>) -> Result<Option<Uuid>, EnqueueError> {
    let id = match job.concurrency_key {
        Some(key) => {
            sqlx::query_scalar::<_, Uuid>(
                r"
                INSERT INTO lockstep_jobs
                    (job_type, data, queue_name, priority, scheduled_at, concurrency_key)
                SELECT $1, $2, $3, $4, COALESCE($5, now()), $6
                WHERE NOT EXISTS (
                    SELECT 1 FROM lockstep_jobs
                    WHERE concurrency_key = $6 AND finished_at IS NULL
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id
                ",
            )
            .bind(job.job_type)
            .bind(&job.data)
            .bind(job.queue_name)
            .bind(job.priority)
            .bind(job.scheduled_at)
            .bind(key)
            .fetch_optional(pool)
            .await?
        }
        None => Some(
            sqlx::query_scalar::<_, Uuid>(
                r"
                INSERT INTO lockstep_jobs
                    (job_type, data, queue_name, priority, scheduled_at)
                VALUES ($1, $2, $3, $4, COALESCE($5, now()))
                RETURNING id
                ",
            )
            .bind(job.job_type)
            .bind(&job.data)
            .bind(job.queue_name)
            .bind(job.priority)
            .bind(job.scheduled_at)
            .fetch_one(pool)
            .await?,
        ),
    };

    Ok(id)
}

/// Insert a cron-triggered job keyed by `(cron_key, cron_at)`.
///
/// Returns `None` when another process already materialized this trigger; the
/// unique index arbitrates and a conflict is success-by-another, not an error.
pub async fn insert_cron_job(
    pool: &PgPool,
    job: NewJob<'_>,
    cron_key: &str,
    cron_at: DateTime<Utc>,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r"
        INSERT INTO lockstep_jobs
            (job_type, data, queue_name, priority, scheduled_at, cron_key, cron_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (cron_key, cron_at) WHERE cron_key IS NOT NULL DO NOTHING
        RETURNING id
        ",
    )
    .bind(job.job_type)
    .bind(&job.data)
    .bind(job.queue_name)
    .bind(job.priority)
    .bind(cron_at)
    .bind(cron_key)
    .bind(cron_at)
    .fetch_optional(pool)
    .await
}

/// The eligibility predicate used by the candidate scan.
///
/// A job is a candidate when it is not explicitly terminated, its due time has
/// arrived, and no execution terminates it: a closed error-free execution means
/// succeeded, and a failure at or after `scheduled_at` means discarded (a retry
/// moves `scheduled_at` strictly past the failure, which un-blocks the job).
/// Open executions do NOT exclude a job here: a live holder defends it with the
/// advisory lock, and a stale one left behind by a crashed process must stay
/// reclaimable.
const CANDIDATE_PREDICATE: &str = r"
    finished_at IS NULL
    AND scheduled_at <= now()
    AND NOT EXISTS (
        SELECT 1 FROM lockstep_executions e
        WHERE e.job_id = lockstep_jobs.id
          AND e.finished_at IS NOT NULL
          AND (e.error_message IS NULL OR e.finished_at >= lockstep_jobs.scheduled_at)
    )
";

/// Fetch up to `limit` claimable jobs, best first.
///
/// Ordered by priority descending, then due time, then creation order for
/// fairness. `queues` of `None` scans every queue (the `*` rule).
pub async fn next_candidates(
    pool: &PgPool,
    queues: Option<&[String]>,
    limit: i64,
) -> Result<Vec<Job>, sqlx::Error> {
    let order = "ORDER BY priority DESC, scheduled_at ASC, created_at ASC LIMIT $1";

    match queues {
        Some(queues) => {
            let sql = format!(
                "SELECT * FROM lockstep_jobs WHERE queue_name = ANY($2) AND {CANDIDATE_PREDICATE} {order}"
            );
            sqlx::query_as::<_, Job>(&sql)
                .bind(limit)
                .bind(queues)
                .fetch_all(pool)
                .await
        }
        None => {
            let sql = format!("SELECT * FROM lockstep_jobs WHERE {CANDIDATE_PREDICATE} {order}");
            sqlx::query_as::<_, Job>(&sql)
                .bind(limit)
                .fetch_all(pool)
                .await
        }
    }
}

/// Fetch a single job row by id.
pub async fn find_job<'e>(
    executor: impl sqlx::PgExecutor<'e>,
    id: Uuid,
) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>("SELECT * FROM lockstep_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// Fetch the most recent execution of a job, if any.
pub async fn latest_execution(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<Option<Execution>, sqlx::Error> {
    sqlx::query_as::<_, Execution>(
        r"
        SELECT * FROM lockstep_executions
        WHERE job_id = $1
        ORDER BY created_at DESC, started_at DESC
        LIMIT 1
        ",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Number of execution rows recorded for a job.
pub async fn execution_count(pool: &PgPool, job_id: Uuid) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM lockstep_executions WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(pool)
        .await
}

/// Open a new execution row for a claimed job.
pub async fn start_execution(
    conn: &mut PgConnection,
    job_id: Uuid,
    worker_name: &str,
) -> Result<Execution, sqlx::Error> {
    sqlx::query_as::<_, Execution>(
        r"
        INSERT INTO lockstep_executions (job_id, worker_name)
        VALUES ($1, $2)
        RETURNING *
        ",
    )
    .bind(job_id)
    .bind(worker_name)
    .fetch_one(&mut *conn)
    .await
}

/// Error details recorded on a failed execution.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    /// Classification, e.g. `"payload"`, `"discarded"`, `"interrupted"`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Captured trace, when available.
    pub trace: Option<String>,
}

impl ExecutionError {
    /// Build a `"payload"` error from a job failure.
    pub fn payload(error: &anyhow::Error) -> Self {
        Self {
            kind: "payload".into(),
            message: error.to_string(),
            trace: Some(format!("{error:?}")),
        }
    }
}

/// Close an execution, recording the outcome.
///
/// A failed outcome also bumps the job's retry counter in the same statement,
/// so an observer never sees a closed failure next to a stale counter. Only
/// still-open executions are updated; if an administrator already closed this
/// attempt, the worker's finish is a no-op.
pub async fn finish_execution(
    conn: &mut PgConnection,
    execution_id: Uuid,
    error: Option<&ExecutionError>,
) -> Result<(), sqlx::Error> {
    match error {
        None => {
            sqlx::query(
                "UPDATE lockstep_executions SET finished_at = now()
                 WHERE id = $1 AND finished_at IS NULL",
            )
            .bind(execution_id)
            .execute(&mut *conn)
            .await?;
        }
        Some(error) => {
            sqlx::query(
                r"
                WITH closed AS (
                    UPDATE lockstep_executions
                    SET finished_at = now(),
                        error_kind = $2,
                        error_message = $3,
                        error_trace = $4
                    WHERE id = $1 AND finished_at IS NULL
                    RETURNING job_id
                )
                UPDATE lockstep_jobs
                SET retries = retries + 1
                WHERE id = (SELECT job_id FROM closed)
                ",
            )
            .bind(execution_id)
            .bind(&error.kind)
            .bind(&error.message)
            .bind(&error.trace)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

/// Insert an already-closed execution row.
///
/// Used by the administrative discard action when a job has no open attempt to
/// close: the discard is still recorded as history.
pub async fn insert_closed_execution(
    conn: &mut PgConnection,
    job_id: Uuid,
    error: &ExecutionError,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO lockstep_executions
            (job_id, finished_at, error_kind, error_message, error_trace, worker_name)
        VALUES ($1, now(), $2, $3, $4, 'admin')
        ",
    )
    .bind(job_id)
    .bind(&error.kind)
    .bind(&error.message)
    .bind(&error.trace)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Move a job's due time, re-opening eligibility.
pub async fn set_scheduled_at(
    conn: &mut PgConnection,
    job_id: Uuid,
    scheduled_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE lockstep_jobs SET scheduled_at = $2 WHERE id = $1")
        .bind(job_id)
        .bind(scheduled_at)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Move a job's due time to the store clock, re-opening eligibility past any
/// failure recorded in the same or an earlier transaction.
pub async fn set_scheduled_at_now(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE lockstep_jobs SET scheduled_at = now() WHERE id = $1")
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Pull a future due time back to the store clock.
///
/// Run before recording a discard so the failure's `finished_at` lands at or
/// after `scheduled_at` and the record pins the job.
pub async fn clamp_scheduled_at(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE lockstep_jobs SET scheduled_at = LEAST(scheduled_at, now()) WHERE id = $1",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Mark a job as explicitly terminated.
pub async fn mark_finished(conn: &mut PgConnection, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE lockstep_jobs SET finished_at = now() WHERE id = $1 AND finished_at IS NULL",
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a job row (executions cascade with it).
pub async fn delete_job(conn: &mut PgConnection, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM lockstep_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Fetch jobs (optionally queue-filtered) paired with their latest execution.
///
/// Two simple queries stitched in memory; the administrative surface derives
/// states from the pairs rather than duplicating the lifecycle rules in SQL.
pub async fn jobs_with_latest_execution(
    pool: &PgPool,
    queue: Option<&str>,
) -> Result<Vec<(Job, Option<Execution>)>, sqlx::Error> {
    let jobs = match queue {
        Some(queue) => {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM lockstep_jobs WHERE queue_name = $1 ORDER BY created_at ASC",
            )
            .bind(queue)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, Job>("SELECT * FROM lockstep_jobs ORDER BY created_at ASC")
                .fetch_all(pool)
                .await?
        }
    };

    let ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
    let executions = sqlx::query_as::<_, Execution>(
        r"
        SELECT DISTINCT ON (job_id) *
        FROM lockstep_executions
        WHERE job_id = ANY($1)
        ORDER BY job_id, created_at DESC, started_at DESC
        ",
    )
    .bind(&ids)
    .fetch_all(pool)
    .await?;

    let mut latest: HashMap<Uuid, Execution> = executions
        .into_iter()
        .map(|execution| (execution.job_id, execution))
        .collect();

    Ok(jobs
        .into_iter()
        .map(|job| {
            let execution = latest.remove(&job.id);
            (job, execution)
        })
        .collect())
}
