use crate::errors::EnqueueError;
use crate::notifier;
use crate::storage::{self, NewJob};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

/// The default queue name used when no specific queue is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Trait for defining jobs that can be enqueued and executed by a
/// [`Capsule`](crate::Capsule).
pub trait JobHandler: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job type.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Default priority of the job (higher runs first).
    ///
    /// [`submit`] can be used to override the priority per instance.
    const PRIORITY: i32 = 0;

    /// Queue this job type runs on.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Per-instance deduplication/throttle key.
    ///
    /// When `Some`, enqueueing is skipped while another unfinished job with
    /// the same key exists.
    fn concurrency_key(&self) -> Option<String> {
        None
    }

    /// Execute the job. This method defines the payload's logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Enqueue this job to run as soon as a worker picks it up.
    ///
    /// Returns the job id, or `None` if deduplicated away.
    #[instrument(name = "lockstep.enqueue", skip(self, pool), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Option<Uuid>, EnqueueError>> {
        self.enqueue_at(pool, None)
    }

    /// Enqueue this job with an explicit earliest run time.
    fn enqueue_at<'a>(
        &'a self,
        pool: &'a PgPool,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'a, Result<Option<Uuid>, EnqueueError>> {
        let data = match serde_json::to_value(self) {
            Ok(data) => data,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };
        let concurrency_key = self.concurrency_key();

        async move {
            submit(
                pool,
                Submission {
                    job_type: Self::JOB_NAME,
                    data,
                    queue_name: Self::QUEUE,
                    priority: Self::PRIORITY,
                    scheduled_at,
                    concurrency_key: concurrency_key.as_deref(),
                },
            )
            .await
        }
        .boxed()
    }
}

/// An untyped job submission, for producers that build payloads dynamically.
#[derive(Debug, Clone)]
pub struct Submission<'a> {
    /// Job type name used for dispatch.
    pub job_type: &'a str,
    /// Serialized payload.
    pub data: Value,
    /// Target queue.
    pub queue_name: &'a str,
    /// Priority (higher runs first).
    pub priority: i32,
    /// Earliest eligible run time; `None` means now.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Optional deduplication/throttle key.
    pub concurrency_key: Option<&'a str>,
}

/// Insert a job row and notify listening schedulers.
///
/// May be called from any process sharing the store. Returns the new job's
/// id, or `None` when the concurrency key deduplicated the submission.
pub async fn submit(
    pool: &PgPool,
    submission: Submission<'_>,
) -> Result<Option<Uuid>, EnqueueError> {
    let queue_name = submission.queue_name;
    let id = storage::insert_job(
        pool,
        NewJob {
            job_type: submission.job_type,
            data: submission.data,
            queue_name,
            priority: submission.priority,
            scheduled_at: submission.scheduled_at,
            concurrency_key: submission.concurrency_key,
        },
    )
    .await?;

    if id.is_some() {
        notifier::publish(pool, queue_name).await?;
    }

    Ok(id)
}
