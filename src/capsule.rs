//! The composition root: one instance of every runtime component, started in
//! dependency order and shut down in reverse.

use crate::config::{
    self, DEFAULT_CANDIDATE_SCAN_LIMIT, DEFAULT_CRON_INTERVAL, DEFAULT_JITTER,
    DEFAULT_POLL_INTERVAL, QueueRule, QueueSelector,
};
use crate::cron::{CronEntry, CronManager};
use crate::hooks::{ErrorHook, InstanceRegistry, LifecycleStatus};
use crate::job_handler::JobHandler;
use crate::job_registry::JobRegistry;
use crate::notifier::{Notifier, Wake};
use crate::poller::Poller;
use crate::scheduler::Scheduler;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// How long to wait for in-flight executions during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownTimeout {
    /// Wait up to this long, then abandon stragglers.
    Within(Duration),
    /// Abandon in-flight executions immediately.
    Immediately,
    /// Wait however long it takes.
    Unbounded,
}

impl From<Duration> for ShutdownTimeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            ShutdownTimeout::Immediately
        } else {
            ShutdownTimeout::Within(duration)
        }
    }
}

impl ShutdownTimeout {
    fn worker_budget(self) -> Option<Duration> {
        match self {
            ShutdownTimeout::Within(duration) => Some(duration),
            ShutdownTimeout::Immediately => Some(Duration::ZERO),
            ShutdownTimeout::Unbounded => None,
        }
    }
}

/// Configures and starts a [`Capsule`].
pub struct CapsuleBuilder<Context: Clone + Send + Sync + 'static> {
    pool: PgPool,
    context: Context,
    queue_rules: Vec<QueueRule>,
    job_registry: JobRegistry<Context>,
    cron_entries: Vec<CronEntry>,
    poll_interval: Duration,
    jitter: Duration,
    cron_interval: Duration,
    candidate_scan_limit: i64,
    error_hook: ErrorHook,
    instance_registry: Option<Arc<InstanceRegistry>>,
}

impl<Context: Clone + Send + Sync + 'static> std::fmt::Debug for CapsuleBuilder<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapsuleBuilder")
            .field("queue_rules", &self.queue_rules)
            .field("job_registry", &self.job_registry)
            .field("cron_entries", &self.cron_entries.len())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> CapsuleBuilder<Context> {
    /// Configure the queues from a rule string like `"mice:2;*:1"`.
    pub fn queues(mut self, spec: &str) -> Result<Self, config::ConfigError> {
        self.queue_rules = config::parse_queue_rules(spec)?;
        Ok(self)
    }

    /// Configure the queues from explicit rules.
    pub fn queue_rules(mut self, rules: Vec<QueueRule>) -> Self {
        self.queue_rules = rules;
        self
    }

    /// Register a job type to be executed by this capsule's workers.
    pub fn register_job_type<J: JobHandler<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<J>();
        self
    }

    /// Add a recurring schedule.
    pub fn cron(mut self, entry: CronEntry) -> Self {
        self.cron_entries.push(entry);
        self
    }

    /// Set the fallback poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum random jitter added to each poll interval.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the cron manager's tick interval.
    pub fn cron_interval(mut self, interval: Duration) -> Self {
        self.cron_interval = interval;
        self
    }

    /// Cap the number of candidates a worker scans per wakeup.
    pub fn candidate_scan_limit(mut self, limit: i64) -> Self {
        self.candidate_scan_limit = limit.max(1);
        self
    }

    /// Install the unhandled-error hook for executor-level failures.
    pub fn on_executor_error(mut self, hook: ErrorHook) -> Self {
        self.error_hook = hook;
        self
    }

    /// Track this capsule's components in an explicit instance registry.
    pub fn instance_registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.instance_registry = Some(registry);
        self
    }

    /// Start every component, in dependency order: store readiness, notifier
    /// subscription, scheduler pool, poller, cron manager. Producers of new
    /// work start last, after the consumers are ready to react to them.
    pub async fn start(self) -> Result<Capsule, sqlx::Error> {
        // Store readiness: fail fast if the database is unreachable.
        sqlx::query("SELECT 1").execute(&self.pool).await?;

        let (wake_tx, _) = broadcast::channel::<Wake>(64);
        let job_registry = Arc::new(self.job_registry);

        let notifier = Arc::new(Notifier::start(self.pool.clone(), wake_tx.clone()));

        let schedulers: Vec<Arc<Scheduler>> = self
            .queue_rules
            .into_iter()
            .map(|rule| {
                Arc::new(Scheduler::start(
                    self.pool.clone(),
                    self.context.clone(),
                    job_registry.clone(),
                    rule,
                    &wake_tx,
                    self.candidate_scan_limit,
                    self.error_hook.clone(),
                ))
            })
            .collect();

        let poller = Arc::new(Poller::start(
            self.poll_interval,
            self.jitter,
            wake_tx.clone(),
        ));

        let cron_manager = if self.cron_entries.is_empty() {
            None
        } else {
            Some(Arc::new(CronManager::start(
                self.pool.clone(),
                self.cron_entries,
                self.cron_interval,
            )))
        };

        if let Some(registry) = &self.instance_registry {
            registry.register(downgrade(&notifier));
            for scheduler in &schedulers {
                registry.register(downgrade(scheduler));
            }
            registry.register(downgrade(&poller));
            if let Some(cron_manager) = &cron_manager {
                registry.register(downgrade(cron_manager));
            }
        }

        info!(
            schedulers = schedulers.len(),
            job_types = ?job_registry.job_types(),
            "capsule started"
        );
        Ok(Capsule {
            notifier,
            schedulers,
            poller,
            cron_manager,
            shutdown: AtomicBool::new(false),
        })
    }
}

fn downgrade<T: LifecycleStatus + Send + Sync + 'static>(
    instance: &Arc<T>,
) -> Weak<dyn LifecycleStatus + Send + Sync> {
    Arc::downgrade(instance) as Weak<dyn LifecycleStatus + Send + Sync>
}

/// One running instance of the execution engine.
pub struct Capsule {
    notifier: Arc<Notifier>,
    schedulers: Vec<Arc<Scheduler>>,
    poller: Arc<Poller>,
    cron_manager: Option<Arc<CronManager>>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for Capsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capsule")
            .field("schedulers", &self.schedulers.len())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Capsule {
    /// Begin configuring a capsule over `pool` with the given job context.
    ///
    /// The default configuration runs one worker across all queues with the
    /// default intervals.
    pub fn builder<Context: Clone + Send + Sync + 'static>(
        pool: PgPool,
        context: Context,
    ) -> CapsuleBuilder<Context> {
        CapsuleBuilder {
            pool,
            context,
            queue_rules: vec![QueueRule {
                selector: QueueSelector::All,
                workers: 1,
            }],
            job_registry: JobRegistry::default(),
            cron_entries: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            cron_interval: DEFAULT_CRON_INTERVAL,
            candidate_scan_limit: DEFAULT_CANDIDATE_SCAN_LIMIT,
            error_hook: Arc::new(crate::hooks::log_executor_error),
            instance_registry: None,
        }
    }

    /// Drive coordinated shutdown, in reverse start order.
    ///
    /// Stops producing new triggers first (cron manager, poller, notifier),
    /// then stops accepting new claims and waits for in-flight executions
    /// within the timeout budget. Returns `true` if everything finished;
    /// `false` if the budget ran out and stragglers were abandoned (their
    /// claims release with this process's connections).
    pub async fn shutdown(&self, timeout: ShutdownTimeout) -> bool {
        debug!(?timeout, "capsule shutting down");

        if let Some(cron_manager) = &self.cron_manager {
            cron_manager.stop().await;
        }
        self.poller.stop().await;
        self.notifier.stop().await;

        for scheduler in &self.schedulers {
            scheduler.stop_accepting();
        }

        let mut clean = true;
        for scheduler in &self.schedulers {
            clean &= scheduler.wait_for_workers(timeout.worker_budget()).await;
        }

        if clean {
            info!("capsule shut down");
        } else {
            warn!("capsule shut down with abandoned in-flight executions");
        }
        self.shutdown.store(true, Ordering::SeqCst);
        clean
    }

    /// Whether every component has stopped.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
            && self.notifier.is_shutdown()
            && self.poller.is_shutdown()
            && self
                .cron_manager
                .as_ref()
                .is_none_or(|cron_manager| cron_manager.is_shutdown())
            && self
                .schedulers
                .iter()
                .all(|scheduler| scheduler.is_shutdown())
    }
}

impl LifecycleStatus for Capsule {
    fn component_name(&self) -> &'static str {
        "capsule"
    }

    fn is_shutdown(&self) -> bool {
        Capsule::is_shutdown(self)
    }
}
