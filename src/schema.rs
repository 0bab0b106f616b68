//! Database row types and the derived job lifecycle.
//!
//! A [`Job`] row never stores its state directly. The state is derived from the
//! job's own columns plus its most recent [`Execution`], so concurrent writers
//! only ever append attempt history instead of fighting over a status column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Represents a job record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job.
    pub id: Uuid,
    /// Queue the job belongs to.
    pub queue_name: String,
    /// Priority of the job (higher = more important).
    pub priority: i32,
    /// Type identifier for the job (used for dispatch).
    pub job_type: String,
    /// JSON data containing the job payload.
    pub data: Value,
    /// Earliest time the job is eligible to run.
    pub scheduled_at: DateTime<Utc>,
    /// Identity of the cron schedule that produced this job, if any.
    pub cron_key: Option<String>,
    /// The trigger timestamp for a cron-produced job; unique per `cron_key`.
    pub cron_at: Option<DateTime<Utc>>,
    /// Application-defined deduplication/throttle key.
    pub concurrency_key: Option<String>,
    /// Number of retry attempts made.
    pub retries: i32,
    /// Set when the job has been explicitly terminated (destroyed jobs are
    /// deleted outright; force-discarded jobs keep their row with this set).
    pub finished_at: Option<DateTime<Utc>>,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
}

/// Represents one attempt to run a [`Job`].
#[derive(Debug, Clone, FromRow)]
pub struct Execution {
    /// Unique identifier for the execution.
    pub id: Uuid,
    /// The job this attempt belongs to.
    pub job_id: Uuid,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished; `None` while the attempt is in flight.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error classification, e.g. `"payload"` or `"discarded"`.
    pub error_kind: Option<String>,
    /// Human-readable error message for a failed attempt.
    pub error_message: Option<String>,
    /// Captured trace/backtrace for a failed attempt.
    pub error_trace: Option<String>,
    /// Name of the worker that ran the attempt.
    pub worker_name: String,
    /// Timestamp when the execution row was created.
    pub created_at: DateTime<Utc>,
}

impl Execution {
    /// Whether this attempt is still in flight.
    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }

    /// Whether this attempt finished with an error.
    pub fn is_errored(&self) -> bool {
        self.finished_at.is_some() && self.error_message.is_some()
    }
}

/// The derived lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// No attempt yet and the due time is in the future.
    Scheduled,
    /// Due to run, with no attempt blocking it.
    Queued,
    /// An attempt is currently in flight.
    Running,
    /// The latest attempt finished without error.
    Succeeded,
    /// The latest attempt failed and no retry has been scheduled since.
    Discarded,
    /// The job was explicitly terminated (force-discarded or destroyed).
    Finished,
}

impl JobState {
    /// All states, in lifecycle order. Used by filters and the test matrix.
    pub const ALL: [JobState; 6] = [
        JobState::Scheduled,
        JobState::Queued,
        JobState::Running,
        JobState::Succeeded,
        JobState::Discarded,
        JobState::Finished,
    ];

    /// Derive the state of `job` from its most recent execution.
    ///
    /// A failed attempt pins the job in `Discarded` unless `scheduled_at` has
    /// been moved strictly past the failure time. The administrative retry
    /// action re-opens the job that way, using the store clock, without
    /// touching the attempt history; a discard clamps `scheduled_at` to the
    /// failure time or earlier, so its record always pins.
    pub fn derive(job: &Job, latest: Option<&Execution>, now: DateTime<Utc>) -> JobState {
        if job.finished_at.is_some() {
            return JobState::Finished;
        }

        match latest {
            Some(execution) if execution.is_open() => JobState::Running,
            Some(execution) => match execution.finished_at {
                Some(finished_at) if execution.is_errored() => {
                    if job.scheduled_at > finished_at {
                        // Retried since the failure; eligibility is back on.
                        Self::by_due_time(job, now)
                    } else {
                        JobState::Discarded
                    }
                }
                _ => JobState::Succeeded,
            },
            None => Self::by_due_time(job, now),
        }
    }

    fn by_due_time(job: &Job, now: DateTime<Utc>) -> JobState {
        if job.scheduled_at > now {
            JobState::Scheduled
        } else {
            JobState::Queued
        }
    }

    /// Whether a job in this state may be picked up by a worker.
    pub fn is_claimable(self) -> bool {
        matches!(self, JobState::Queued)
    }

    /// Whether this state permits no further attempts without administrative
    /// intervention.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Discarded | JobState::Finished
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Scheduled => "scheduled",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Discarded => "discarded",
            JobState::Finished => "finished",
        };
        f.write_str(name)
    }
}
