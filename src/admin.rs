//! Administrative actions over jobs: retry, discard, force-discard, destroy,
//! reschedule, and their batch variants.
//!
//! These are the operations a dashboard or operator tooling drives. Each one
//! reports success or failure per job; batch variants aggregate counts.

use crate::errors::AdminError;
use crate::lock::LockArbiter;
use crate::notifier;
use crate::schema::{Execution, Job, JobState};
use crate::storage::{self, ExecutionError};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

/// Handle for administrative job mutations.
#[derive(Debug, Clone)]
pub struct Admin {
    pool: PgPool,
    arbiter: LockArbiter,
}

/// An administrative action, for batch application.
#[derive(Debug, Clone, Copy)]
pub enum AdminAction {
    /// Discarded → queued; history kept, eligibility reset.
    Retry,
    /// Running/queued/scheduled → discarded.
    Discard,
    /// Terminate the holder's session, then mark the job finished.
    ForceDiscard,
    /// Remove a terminal job's row entirely.
    Destroy,
    /// Move the job's earliest eligible run time.
    Reschedule(DateTime<Utc>),
}

/// Which jobs a batch action applies to.
#[derive(Debug, Clone)]
pub enum JobSelection {
    /// An explicit id set.
    Ids(Vec<Uuid>),
    /// Everything matching a filter.
    Matching {
        /// The filter criterion.
        filter: JobFilter,
        /// When false, only the first page of matches (the "visible page")
        /// is affected; when true, every match is.
        all_matching: bool,
    },
}

/// Filter criterion for batch selection.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Restrict to one queue.
    pub queue: Option<String>,
    /// Restrict to jobs in one derived state.
    pub state: Option<JobState>,
    /// Page size used when `all_matching` is false. Defaults to 25.
    pub page_size: Option<usize>,
}

/// Aggregate result of a batch action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Jobs the action succeeded on.
    pub succeeded: usize,
    /// Jobs the action failed on (wrong state, missing row, storage error).
    pub failed: usize,
}

impl Admin {
    /// Create an administrative handle over the shared pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            arbiter: LockArbiter::new(),
        }
    }

    /// The lock arbiter used by [`force_discard`](Self::force_discard);
    /// exposed for ownership queries in supervising code and tests.
    pub fn arbiter(&self) -> &LockArbiter {
        &self.arbiter
    }

    /// Re-open a discarded job for a new execution attempt.
    ///
    /// Moves `scheduled_at` strictly past the recorded failure, which makes it
    /// stop pinning the job, without touching the execution history. Uses the
    /// store clock so a skewed client cannot land the new due time before the
    /// failure. The cleared error remains visible on the old execution row.
    pub async fn retry(&self, job_id: Uuid) -> Result<(), AdminError> {
        let (job, state) = self.job_state(job_id).await?;
        if state != JobState::Discarded {
            return Err(AdminError::InvalidState {
                id: job_id,
                action: "retried",
            });
        }

        let mut conn = self.pool.acquire().await?;
        storage::set_scheduled_at_now(&mut conn, job_id).await?;
        drop(conn);

        notifier::publish(&self.pool, &job.queue_name).await?;
        info!(job.id = %job_id, "job retried");
        Ok(())
    }

    /// Mark a running or pending job as discarded.
    ///
    /// Closes the open execution with a `"discarded"` error, or records a
    /// synthetic closed one when no attempt exists, so the discard is part of
    /// the job's history either way. A future `scheduled_at` is pulled back
    /// first so the record pins the job even when it was not yet due. The
    /// holder of a running job is not interrupted; its eventual finish becomes
    /// a no-op.
    pub async fn discard(&self, job_id: Uuid) -> Result<(), AdminError> {
        let (_, state) = self.job_state(job_id).await?;
        if state.is_terminal() {
            return Err(AdminError::InvalidState {
                id: job_id,
                action: "discarded",
            });
        }

        let error = ExecutionError {
            kind: "discarded".into(),
            message: "discarded by administrator".into(),
            trace: None,
        };

        let mut conn = self.pool.acquire().await?;
        storage::clamp_scheduled_at(&mut conn, job_id).await?;
        let latest = storage::latest_execution(&mut conn, job_id).await?;
        match latest.filter(Execution::is_open) {
            Some(open) => storage::finish_execution(&mut conn, open.id, Some(&error)).await?,
            None => storage::insert_closed_execution(&mut conn, job_id, &error).await?,
        }

        info!(job.id = %job_id, "job discarded");
        Ok(())
    }

    /// Forcibly terminate a job that appears running but may be orphaned.
    ///
    /// Bypasses the normal claim protocol: the holder's entire database
    /// session is terminated (releasing its advisory locks), any open
    /// execution is closed, and the job is marked finished. Use when a normal
    /// discard would be unsafe because the true holder is unresponsive.
    pub async fn force_discard(&self, job_id: Uuid) -> Result<(), AdminError> {
        self.job_state(job_id).await?;

        let terminated = self.arbiter.force_release(&self.pool, job_id).await?;
        if terminated > 0 {
            warn!(job.id = %job_id, sessions = terminated, "terminated lock-holding session");
        }

        let mut conn = self.pool.acquire().await?;
        let latest = storage::latest_execution(&mut conn, job_id).await?;
        if let Some(open) = latest.filter(Execution::is_open) {
            let error = ExecutionError {
                kind: "discarded".into(),
                message: "forcibly discarded by administrator".into(),
                trace: None,
            };
            storage::finish_execution(&mut conn, open.id, Some(&error)).await?;
        }
        storage::mark_finished(&mut conn, job_id).await?;

        info!(job.id = %job_id, "job force-discarded");
        Ok(())
    }

    /// Remove a terminal job's row (and its execution history).
    pub async fn destroy(&self, job_id: Uuid) -> Result<(), AdminError> {
        let (_, state) = self.job_state(job_id).await?;
        if !state.is_terminal() {
            return Err(AdminError::InvalidState {
                id: job_id,
                action: "destroyed",
            });
        }

        let mut conn = self.pool.acquire().await?;
        storage::delete_job(&mut conn, job_id).await?;
        info!(job.id = %job_id, "job destroyed");
        Ok(())
    }

    /// Move a job's earliest eligible run time.
    pub async fn reschedule(
        &self,
        job_id: Uuid,
        new_time: DateTime<Utc>,
    ) -> Result<(), AdminError> {
        let (job, state) = self.job_state(job_id).await?;
        if state == JobState::Finished {
            return Err(AdminError::InvalidState {
                id: job_id,
                action: "rescheduled",
            });
        }

        let mut conn = self.pool.acquire().await?;
        storage::set_scheduled_at(&mut conn, job_id, new_time).await?;
        drop(conn);

        if new_time <= Utc::now() {
            notifier::publish(&self.pool, &job.queue_name).await?;
        }
        info!(job.id = %job_id, scheduled_at = %new_time, "job rescheduled");
        Ok(())
    }

    /// Apply `action` to every selected job, returning aggregate counts.
    ///
    /// Per-job failures (wrong state, vanished row) are counted, not raised;
    /// only a failure to resolve the selection itself is an error.
    pub async fn batch(
        &self,
        action: AdminAction,
        selection: JobSelection,
    ) -> Result<BatchOutcome, AdminError> {
        let ids = self.resolve(selection).await?;
        let mut outcome = BatchOutcome::default();

        for job_id in ids {
            let result = match action {
                AdminAction::Retry => self.retry(job_id).await,
                AdminAction::Discard => self.discard(job_id).await,
                AdminAction::ForceDiscard => self.force_discard(job_id).await,
                AdminAction::Destroy => self.destroy(job_id).await,
                AdminAction::Reschedule(new_time) => self.reschedule(job_id, new_time).await,
            };

            match result {
                Ok(()) => outcome.succeeded += 1,
                Err(error) => {
                    warn!(job.id = %job_id, %error, "batch action failed for job");
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// List jobs with their derived states, applying `filter`.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<(Job, JobState)>, AdminError> {
        let now = Utc::now();
        let pairs = storage::jobs_with_latest_execution(&self.pool, filter.queue.as_deref()).await?;

        Ok(pairs
            .into_iter()
            .map(|(job, latest)| {
                let state = JobState::derive(&job, latest.as_ref(), now);
                (job, state)
            })
            .filter(|(_, state)| filter.state.is_none_or(|wanted| wanted == *state))
            .collect())
    }

    async fn resolve(&self, selection: JobSelection) -> Result<Vec<Uuid>, AdminError> {
        match selection {
            JobSelection::Ids(ids) => Ok(ids),
            JobSelection::Matching {
                filter,
                all_matching,
            } => {
                let mut ids: Vec<Uuid> = self
                    .list(&filter)
                    .await?
                    .into_iter()
                    .map(|(job, _)| job.id)
                    .collect();
                if !all_matching {
                    ids.truncate(filter.page_size.unwrap_or(25));
                }
                Ok(ids)
            }
        }
    }

    async fn job_state(&self, job_id: Uuid) -> Result<(Job, JobState), AdminError> {
        let job = storage::find_job(&self.pool, job_id)
            .await?
            .ok_or(AdminError::NotFound(job_id))?;

        let mut conn = self.pool.acquire().await?;
        let latest = storage::latest_execution(&mut conn, job_id).await?;
        let state = JobState::derive(&job, latest.as_ref(), Utc::now());
        Ok((job, state))
    }
}
