#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

//! End-to-end scheduling behavior against a live Postgres.
//!
//! These tests are skipped when `DATABASE_URL` is not set. Each test works in
//! its own uniquely-named queue so the suite can run in parallel against one
//! database.

use claims::assert_some;
use lockstep::{Capsule, JobHandler, LockArbiter, ShutdownTimeout, Submission};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use uuid::Uuid;

macro_rules! require_database_url {
    () => {
        match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("DATABASE_URL not set, skipping integration test");
                return Ok(());
            }
        }
    };
}

async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(database_url)
        .await?;
    lockstep::run_migrations(&pool).await?;
    Ok(pool)
}

fn unique_queue(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Poll `condition` until it returns true or the deadline passes.
async fn wait_until(condition: impl AsyncFn() -> bool, deadline: Duration) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[derive(Clone, Default)]
struct RecordingContext {
    runs: Arc<Mutex<Vec<String>>>,
}

impl RecordingContext {
    fn record(&self, value: impl Into<String>) {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(value.into());
    }

    fn snapshot(&self) -> Vec<String> {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[derive(Serialize, Deserialize)]
struct RecordedJob {
    label: String,
}

impl JobHandler for RecordedJob {
    const JOB_NAME: &'static str = "recorded";
    type Context = RecordingContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        ctx.record(self.label.clone());
        Ok(())
    }
}

#[tokio::test]
async fn enqueued_jobs_are_executed_and_recorded() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool = create_pool(&database_url).await?;
    let queue = unique_queue("execute");
    let context = RecordingContext::default();

    let capsule = Capsule::builder(pool.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<RecordedJob>()
        .poll_interval(Duration::from_millis(200))
        .start()
        .await?;

    let job_id = assert_some!(
        lockstep::submit(
            &pool,
            Submission {
                job_type: RecordedJob::JOB_NAME,
                data: serde_json::json!({"label": "hello"}),
                queue_name: &queue,
                priority: 0,
                scheduled_at: None,
                concurrency_key: None,
            },
        )
        .await?
    );

    let watched_context = context.clone();
    assert!(
        wait_until(
            async || watched_context.snapshot() == vec!["hello".to_string()],
            Duration::from_secs(10)
        )
        .await,
        "job was not executed in time"
    );

    // One successful execution, attributed to a named worker.
    let (finished_at, error_message, worker_name) = sqlx::query_as::<
        _,
        (Option<chrono::DateTime<chrono::Utc>>, Option<String>, String),
    >(
        "SELECT finished_at, error_message, worker_name FROM lockstep_executions WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(&pool)
    .await?;
    assert!(finished_at.is_some());
    assert_eq!(error_message, None);
    assert!(worker_name.starts_with("lockstep-worker-"));

    assert!(capsule.shutdown(ShutdownTimeout::Unbounded).await);
    assert!(capsule.is_shutdown());
    Ok(())
}

#[tokio::test]
async fn higher_priority_job_starts_first_on_a_single_worker() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool = create_pool(&database_url).await?;
    let queue = unique_queue("priority");
    let context = RecordingContext::default();

    // Both jobs are due before the capsule starts, so dequeue order is
    // decided purely by priority.
    for (label, priority) in [("b", 5), ("a", 10)] {
        lockstep::submit(
            &pool,
            Submission {
                job_type: RecordedJob::JOB_NAME,
                data: serde_json::json!({ "label": label }),
                queue_name: &queue,
                priority,
                scheduled_at: None,
                concurrency_key: None,
            },
        )
        .await?;
    }

    let capsule = Capsule::builder(pool.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<RecordedJob>()
        .poll_interval(Duration::from_millis(200))
        .start()
        .await?;

    let watched_context = context.clone();
    assert!(
        wait_until(
            async || watched_context.snapshot().len() == 2,
            Duration::from_secs(10)
        )
        .await,
        "jobs were not executed in time"
    );
    assert_eq!(context.snapshot(), vec!["a".to_string(), "b".to_string()]);

    capsule.shutdown(ShutdownTimeout::Unbounded).await;
    Ok(())
}

#[derive(Clone)]
struct BlockingContext {
    started: Arc<Barrier>,
    release: Arc<Barrier>,
}

#[derive(Serialize, Deserialize)]
struct BlockingJob {}

impl JobHandler for BlockingJob {
    const JOB_NAME: &'static str = "blocking";
    type Context = BlockingContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        ctx.started.wait().await;
        ctx.release.wait().await;
        Ok(())
    }
}

#[tokio::test]
async fn two_capsules_run_a_job_exactly_once() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool_a = create_pool(&database_url).await?;
    let pool_b = create_pool(&database_url).await?;
    let queue = unique_queue("exclusive");

    let context = BlockingContext {
        started: Arc::new(Barrier::new(2)),
        release: Arc::new(Barrier::new(2)),
    };

    // Two capsules over separate pools simulate two processes polling the
    // same store with no notifier coordination beyond the shared channel.
    let capsule_a = Capsule::builder(pool_a.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<BlockingJob>()
        .poll_interval(Duration::from_millis(100))
        .start()
        .await?;
    let capsule_b = Capsule::builder(pool_b.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<BlockingJob>()
        .poll_interval(Duration::from_millis(100))
        .start()
        .await?;

    let job_id = assert_some!(
        lockstep::submit(
            &pool_a,
            Submission {
                job_type: BlockingJob::JOB_NAME,
                data: serde_json::json!({}),
                queue_name: &queue,
                priority: 0,
                scheduled_at: None,
                concurrency_key: None,
            },
        )
        .await?
    );

    // The winner parks inside the job; the loser's claims keep failing.
    context.started.wait().await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let executions = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM lockstep_executions WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(&pool_a)
    .await?;
    assert_eq!(executions, 1, "exactly one capsule may claim the job");

    context.release.wait().await;
    capsule_a.shutdown(ShutdownTimeout::Unbounded).await;
    capsule_b.shutdown(ShutdownTimeout::Unbounded).await;
    Ok(())
}

#[derive(Clone)]
struct StallContext {
    started: Arc<Barrier>,
}

#[derive(Serialize, Deserialize)]
struct StallingJob {}

impl JobHandler for StallingJob {
    const JOB_NAME: &'static str = "stalling";
    type Context = StallContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        ctx.started.wait().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn bounded_shutdown_returns_within_the_budget() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool = create_pool(&database_url).await?;
    let queue = unique_queue("shutdown");

    let context = StallContext {
        started: Arc::new(Barrier::new(2)),
    };

    let capsule = Capsule::builder(pool.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<StallingJob>()
        .poll_interval(Duration::from_millis(100))
        .start()
        .await?;

    lockstep::submit(
        &pool,
        Submission {
            job_type: StallingJob::JOB_NAME,
            data: serde_json::json!({}),
            queue_name: &queue,
            priority: 0,
            scheduled_at: None,
            concurrency_key: None,
        },
    )
    .await?;
    context.started.wait().await;

    let budget = Duration::from_millis(500);
    let requested_at = Instant::now();
    let clean = capsule.shutdown(ShutdownTimeout::Within(budget)).await;
    let elapsed = requested_at.elapsed();

    assert!(!clean, "the stalling job cannot finish within the budget");
    assert!(
        elapsed < budget + Duration::from_secs(2),
        "shutdown took {elapsed:?}, budget was {budget:?}"
    );
    assert!(capsule.is_shutdown());
    Ok(())
}

#[tokio::test]
async fn immediate_shutdown_releases_abandoned_claims() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool = create_pool(&database_url).await?;
    let queue = unique_queue("abandon");

    let context = StallContext {
        started: Arc::new(Barrier::new(2)),
    };

    let capsule = Capsule::builder(pool.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<StallingJob>()
        .poll_interval(Duration::from_millis(100))
        .start()
        .await?;

    let job_id = assert_some!(
        lockstep::submit(
            &pool,
            Submission {
                job_type: StallingJob::JOB_NAME,
                data: serde_json::json!({}),
                queue_name: &queue,
                priority: 0,
                scheduled_at: None,
                concurrency_key: None,
            },
        )
        .await?
    );
    context.started.wait().await;

    let arbiter = LockArbiter::new();
    assert!(arbiter.is_locked(&pool, job_id).await?);

    // Aborting the stalled worker must not strand its advisory lock on a
    // pooled connection; the claim session has to die with the worker.
    let clean = capsule.shutdown(ShutdownTimeout::Immediately).await;
    assert!(!clean, "the stalling job cannot have finished");

    let watched_pool = pool.clone();
    assert!(
        wait_until(
            async || !arbiter
                .is_locked(&watched_pool, job_id)
                .await
                .unwrap_or(true),
            Duration::from_secs(10),
        )
        .await,
        "advisory lock survived the aborted worker"
    );
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct FailingJob {}

impl JobHandler for FailingJob {
    const JOB_NAME: &'static str = "failing";
    type Context = RecordingContext;

    async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
        ctx.record("attempted");
        anyhow::bail!("the payload is unhappy");
    }
}

#[tokio::test]
async fn payload_failures_are_recorded_and_discard_the_job() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool = create_pool(&database_url).await?;
    let queue = unique_queue("failure");
    let context = RecordingContext::default();

    let capsule = Capsule::builder(pool.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<FailingJob>()
        .poll_interval(Duration::from_millis(200))
        .start()
        .await?;

    let job_id = assert_some!(
        lockstep::submit(
            &pool,
            Submission {
                job_type: FailingJob::JOB_NAME,
                data: serde_json::json!({}),
                queue_name: &queue,
                priority: 0,
                scheduled_at: None,
                concurrency_key: None,
            },
        )
        .await?
    );

    let watched_pool = pool.clone();
    assert!(
        wait_until(
            async || {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM lockstep_executions
                     WHERE job_id = $1 AND finished_at IS NOT NULL",
                )
                .bind(job_id)
                .fetch_one(&watched_pool)
                .await
                .unwrap_or(0)
                    == 1
            },
            Duration::from_secs(10)
        )
        .await,
        "failed execution was not recorded in time"
    );

    let (error_kind, error_message, retries) =
        sqlx::query_as::<_, (Option<String>, Option<String>, i32)>(
            r"
            SELECT e.error_kind, e.error_message, j.retries
            FROM lockstep_executions e
            JOIN lockstep_jobs j ON j.id = e.job_id
            WHERE e.job_id = $1
            ",
        )
        .bind(job_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(error_kind.as_deref(), Some("payload"));
    assert_eq!(error_message.as_deref(), Some("the payload is unhappy"));
    assert_eq!(retries, 1);

    // Discarded, so no second attempt happens.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(context.snapshot(), vec!["attempted".to_string()]);

    capsule.shutdown(ShutdownTimeout::Unbounded).await;
    Ok(())
}

#[tokio::test]
async fn unknown_job_types_hit_the_error_hook_not_the_job() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool = create_pool(&database_url).await?;
    let queue = unique_queue("hook");

    let seen = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
    let hook_seen = seen.clone();

    let capsule = Capsule::builder(pool.clone(), ())
        .queues(&format!("{queue}:1"))?
        .poll_interval(Duration::from_millis(200))
        .on_executor_error(Arc::new(move |error| {
            hook_seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push((error.worker_name.clone(), error.error.to_string()));
        }))
        .start()
        .await?;

    let job_id = assert_some!(
        lockstep::submit(
            &pool,
            Submission {
                job_type: "nobody-registered-this",
                data: serde_json::json!({}),
                queue_name: &queue,
                priority: 0,
                scheduled_at: None,
                concurrency_key: None,
            },
        )
        .await?
    );

    let watched_seen = seen.clone();
    assert!(
        wait_until(
            async || !watched_seen
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_empty(),
            Duration::from_secs(10)
        )
        .await,
        "the executor error hook was not invoked"
    );

    let events = seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let (worker_name, message) = &events[0];
    assert!(worker_name.starts_with("lockstep-worker-"));
    assert!(message.contains("unknown job type"));
    drop(events);

    // Nothing was recorded on the job itself.
    let executions =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM lockstep_executions WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(executions, 0);

    capsule.shutdown(ShutdownTimeout::Unbounded).await;
    Ok(())
}

#[tokio::test]
async fn cron_schedules_fire_and_get_executed() -> anyhow::Result<()> {
    let database_url = require_database_url!();
    let pool = create_pool(&database_url).await?;
    let queue = unique_queue("cron");
    let context = RecordingContext::default();
    let cron_key = format!("tick-{}", Uuid::new_v4());

    let entry = lockstep::CronEntry::new(cron_key.clone(), "* * * * * *", RecordedJob::JOB_NAME)?
        .queue(queue.clone())
        .data(serde_json::json!({"label": "tick"}));

    let capsule = Capsule::builder(pool.clone(), context.clone())
        .queues(&format!("{queue}:1"))?
        .register_job_type::<RecordedJob>()
        .poll_interval(Duration::from_millis(200))
        .cron_interval(Duration::from_millis(250))
        .cron(entry)
        .start()
        .await?;

    let watched_context = context.clone();
    assert!(
        wait_until(
            async || !watched_context.snapshot().is_empty(),
            Duration::from_secs(15)
        )
        .await,
        "no cron trigger fired in time"
    );

    // Every fired trigger has a distinct trigger time.
    let (total, distinct) = sqlx::query_as::<_, (i64, i64)>(
        "SELECT COUNT(*), COUNT(DISTINCT cron_at) FROM lockstep_jobs WHERE cron_key = $1",
    )
    .bind(&cron_key)
    .fetch_one(&pool)
    .await?;
    assert!(total >= 1);
    assert_eq!(total, distinct);

    capsule.shutdown(ShutdownTimeout::Unbounded).await;
    Ok(())
}
