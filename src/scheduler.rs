//! The worker pool: dequeue, claim, execute, record.
//!
//! One scheduler owns the workers for one queue rule. Each worker loops over
//! a bounded candidate list per wakeup: fetch the best eligible jobs, try the
//! advisory claim on each, and run the first one won. Losing a claim is not
//! an error, it just means another worker (possibly in another process) got
//! there first; the worker moves to the next candidate without blocking.
//! Idle workers park on the wake channel until the notifier or poller
//! broadcasts.

use crate::hooks::{ErrorHook, ExecutorError, LifecycleStatus};
use crate::job_registry::{JobRegistry, JobRunError};
use crate::lock::LockArbiter;
use crate::notifier::Wake;
use crate::schema::{Job, JobState};
use crate::storage::{self, ExecutionError};
use crate::util::try_to_extract_panic_info;
use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::{JoinAll, join_all};
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::config::QueueRule;

/// Owns the worker tasks for one queue rule.
pub struct Scheduler {
    label: String,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("label", &self.label)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Scheduler {
    /// Spawn the rule's workers, each subscribed to the wake channel.
    pub(crate) fn start<Context: Clone + Send + Sync + 'static>(
        pool: PgPool,
        context: Context,
        job_registry: Arc<JobRegistry<Context>>,
        rule: QueueRule,
        wake_tx: &broadcast::Sender<Wake>,
        candidate_scan_limit: i64,
        error_hook: ErrorHook,
    ) -> Self {
        let token = CancellationToken::new();
        let label = rule.label();
        let mut handles = Vec::with_capacity(rule.workers);

        for i in 1..=rule.workers {
            let name = format!("lockstep-worker-{label}-{i}");
            info!(worker.name = %name, "starting worker");

            let worker = Worker {
                pool: pool.clone(),
                context: context.clone(),
                job_registry: job_registry.clone(),
                arbiter: LockArbiter::new(),
                rule: rule.clone(),
                candidate_scan_limit,
                name: name.clone(),
                error_hook: error_hook.clone(),
            };

            let span = info_span!("worker", worker.name = %name);
            let wake_rx = wake_tx.subscribe();
            let worker_token = token.clone();
            let handle =
                tokio::spawn(async move { worker.run(wake_rx, worker_token).instrument(span).await });
            handles.push(handle);
        }

        Self {
            label,
            token,
            handles: Mutex::new(handles),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop accepting new claims. In-flight executions keep running.
    pub(crate) fn stop_accepting(&self) {
        self.token.cancel();
    }

    /// Wait for the workers to finish, within the given budget.
    ///
    /// Returns `true` if every worker exited; `false` if the budget ran out
    /// and the stragglers were abandoned (their tasks aborted). `None` budget
    /// waits unboundedly.
    pub(crate) async fn wait_for_workers(&self, budget: Option<Duration>) -> bool {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );

        let abort_handles: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let mut joined = join_all(handles);

        let clean = match budget {
            None => {
                log_worker_panics(&mut joined).await;
                true
            }
            Some(budget) if budget.is_zero() => {
                for abort in &abort_handles {
                    abort.abort();
                }
                log_worker_panics(&mut joined).await;
                false
            }
            Some(budget) => match tokio::time::timeout(budget, &mut joined).await {
                Ok(results) => {
                    log_worker_panics_in(results);
                    true
                }
                Err(_) => {
                    for abort in &abort_handles {
                        abort.abort();
                    }
                    log_worker_panics(&mut joined).await;
                    false
                }
            },
        };

        self.shutdown.store(true, Ordering::SeqCst);
        clean
    }
}

async fn log_worker_panics(joined: &mut JoinAll<JoinHandle<()>>) {
    log_worker_panics_in(joined.await);
}

fn log_worker_panics_in(results: Vec<Result<(), tokio::task::JoinError>>) {
    for result in results {
        if let Err(error) = result {
            if !error.is_cancelled() {
                warn!(%error, "worker task panicked");
            }
        }
    }
}

impl LifecycleStatus for Scheduler {
    fn component_name(&self) -> &'static str {
        "scheduler"
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

struct Worker<Context> {
    pool: PgPool,
    context: Context,
    job_registry: Arc<JobRegistry<Context>>,
    arbiter: LockArbiter,
    rule: QueueRule,
    candidate_scan_limit: i64,
    name: String,
    error_hook: ErrorHook,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Drain eligible work, then park until woken or cancelled.
    async fn run(&self, mut wake_rx: broadcast::Receiver<Wake>, token: CancellationToken) {
        loop {
            // Drain: keep claiming until a sweep comes up empty.
            loop {
                if token.is_cancelled() {
                    debug!("worker stopping");
                    return;
                }

                match self.run_next_job().await {
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(error) => {
                        self.report_executor_error(error);
                        break;
                    }
                }
            }

            // Park until a relevant wakeup.
            loop {
                let wake = tokio::select! {
                    _ = token.cancelled() => {
                        debug!("worker stopping");
                        return;
                    }
                    wake = wake_rx.recv() => wake,
                };

                match wake {
                    Ok(Wake {
                        queue_name: Some(queue),
                    }) if !self.rule.selector.matches(&queue) => {
                        trace!(queue.name = %queue, "ignoring wakeup for unrelated queue");
                    }
                    Ok(_) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Missed wakeups collapse into one sweep.
                        trace!(skipped, "wake channel lagged, sweeping");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("wake channel closed, worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Claim and run the next eligible job, if any.
    ///
    /// Returns `Ok(Some(job_id))` if a job was run, `Ok(None)` if no
    /// candidate could be claimed this sweep.
    async fn run_next_job(&self) -> anyhow::Result<Option<uuid::Uuid>> {
        trace!("scanning for eligible jobs");
        let candidates = storage::next_candidates(
            &self.pool,
            self.rule.selector.as_filter(),
            self.candidate_scan_limit,
        )
        .await?;

        for job in candidates {
            // The claim must live on one connection for the whole execution:
            // advisory locks are session-scoped, and the session is this
            // connection.
            let mut conn = self.pool.acquire().await?;

            if !self.arbiter.try_claim(&mut conn, job.id).await? {
                trace!(job.id = %job.id, "claim lost, moving to next candidate");
                continue;
            }

            // From claim to release the connection lives in the guard; if the
            // worker task is aborted mid-execution, the guard's drop closes
            // the session instead of handing a lock-holding connection back
            // to the pool.
            let mut session = ClaimedSession::new(conn);
            let outcome = match session.conn.as_mut() {
                Some(conn) => self.execute_claimed(conn, &job).await,
                None => Ok(false),
            };
            let released = session.finish(&self.arbiter, job.id).await;

            // Surface the execution error after the release attempt so a
            // failed recording can't leak the claim.
            let attempted = outcome?;
            released?;
            if attempted {
                return Ok(Some(job.id));
            }
            // Claimed but nothing was attempted (row vanished, no longer
            // claimable, or unrunnable here); move to the next candidate.
        }

        Ok(None)
    }

    /// Run a job this worker has successfully claimed.
    ///
    /// Returns whether an execution was actually recorded.
    async fn execute_claimed(
        &self,
        conn: &mut PoolConnection<Postgres>,
        job: &Job,
    ) -> anyhow::Result<bool> {
        // Re-verify after winning the race: the row may have been finished,
        // rescheduled, or destroyed between the scan and the claim.
        let Some(current) = storage::find_job(&mut **conn, job.id).await? else {
            return Ok(false);
        };
        let latest = storage::latest_execution(conn, job.id).await?;

        // A still-open execution under our claim is a leftover from a
        // crashed holder; close it so the history reads correctly.
        if let Some(stale) = latest.as_ref().filter(|execution| execution.is_open()) {
            warn!(job.id = %job.id, execution.id = %stale.id, "closing stale execution from dead session");
            storage::finish_execution(
                conn,
                stale.id,
                Some(&ExecutionError {
                    kind: "interrupted".into(),
                    message: "execution abandoned by a crashed process".into(),
                    trace: None,
                }),
            )
            .await?;
        } else if !JobState::derive(&current, latest.as_ref(), Utc::now()).is_claimable() {
            trace!(job.id = %job.id, "job no longer claimable, skipping");
            return Ok(false);
        }

        let span = info_span!("job", job.id = %job.id, job.job_type = %current.job_type);

        let Some(run_task_fn) = self.job_registry.get(&current.job_type) else {
            // Unknown type is an executor-level fault: nothing is recorded on
            // the job, so it stays queued for a process that does know it.
            self.report_executor_error(anyhow!("unknown job type {}", current.job_type));
            return Ok(false);
        };

        let execution = storage::start_execution(conn, current.id, &self.name).await?;
        debug!(parent: &span, "running job");

        let result = AssertUnwindSafe(run_task_fn(self.context.clone(), current.data.clone()))
            .catch_unwind()
            .instrument(span.clone())
            .await;

        let _enter = span.enter();

        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(JobRunError::Payload(error))) => {
                warn!(%error, "job failed");
                Some(ExecutionError::payload(&error))
            }
            Ok(Err(JobRunError::Deserialize(error))) => {
                // Infrastructure fault, but the attempt happened; close it
                // while reporting the fault out-of-band.
                self.report_executor_error(anyhow::Error::new(error).context(format!(
                    "failed to deserialize payload for job type {}",
                    current.job_type
                )));
                Some(ExecutionError {
                    kind: "executor".into(),
                    message: "payload deserialization failed".into(),
                    trace: None,
                })
            }
            Err(panic) => {
                let error = try_to_extract_panic_info(&*panic);
                warn!(%error, "job panicked");
                Some(ExecutionError::payload(&error))
            }
        };

        storage::finish_execution(conn, execution.id, error.as_ref()).await?;
        debug!("job finished");
        Ok(true)
    }

    fn report_executor_error(&self, error: anyhow::Error) {
        let event = ExecutorError {
            worker_name: self.name.clone(),
            error,
        };
        (self.error_hook)(&event);
    }
}

/// Holds the claim's connection between claim and release.
///
/// The normal path goes through [`ClaimedSession::finish`], which releases the
/// advisory lock and returns the connection to the pool. If the owning task is
/// aborted first, `Drop` detaches the connection and closes it, so the
/// database session dies and its locks with it rather than riding a pooled
/// connection back out to the next checkout.
struct ClaimedSession {
    conn: Option<PoolConnection<Postgres>>,
}

impl ClaimedSession {
    fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn: Some(conn) }
    }

    async fn finish(
        mut self,
        arbiter: &LockArbiter,
        job_id: uuid::Uuid,
    ) -> Result<(), sqlx::Error> {
        if let Some(conn) = self.conn.as_mut() {
            arbiter.release(conn, job_id).await?;
        }
        if let Some(conn) = self.conn.take() {
            drop(conn);
        }
        Ok(())
    }
}

impl Drop for ClaimedSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}
