//! Recurring job schedules with exactly-once firing across processes.
//!
//! Every process sharing a database may run its own cron manager over the
//! same schedule set. Each tick computes the trigger times that came due
//! since the last check and inserts one job per trigger, keyed by
//! `(cron_key, cron_at)`. The unique index arbitrates: whichever process
//! inserts first wins, and everyone else's conflict is treated as success.
//! No leader election, no clock agreement beyond "roughly now".

use crate::hooks::LifecycleStatus;
use crate::lifecycle::TaskLifecycle;
use crate::notifier;
use crate::storage::{self, NewJob};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One recurring schedule: a cron expression plus the job template it fires.
#[derive(Debug, Clone)]
pub struct CronEntry {
    key: String,
    schedule: Schedule,
    job_type: String,
    queue_name: String,
    priority: i32,
    data: Value,
}

impl CronEntry {
    /// Build an entry from a cron expression (seconds-resolution, e.g.
    /// `"0 0 * * * *"` for hourly).
    pub fn new(
        key: impl Into<String>,
        expression: &str,
        job_type: impl Into<String>,
    ) -> Result<Self, cron::error::Error> {
        Ok(Self {
            key: key.into(),
            schedule: Schedule::from_str(expression)?,
            job_type: job_type.into(),
            queue_name: "default".into(),
            priority: 0,
            data: Value::Object(Default::default()),
        })
    }

    /// Set the queue the fired jobs land on.
    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Set the priority of the fired jobs.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the payload of the fired jobs.
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Schedule identity; unique within one manager's entry set.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Trigger times strictly after `after`, up to and including `until`.
    fn due_between(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .take_while(|time| *time <= until)
            .collect()
    }
}

/// Evaluates schedules and enqueues due job instances exactly once.
#[derive(Debug)]
pub struct CronManager {
    lifecycle: TaskLifecycle,
}

impl CronManager {
    /// Start the tick loop over `entries`.
    pub(crate) fn start(pool: PgPool, entries: Vec<CronEntry>, interval: Duration) -> Self {
        let lifecycle = TaskLifecycle::spawn(move |token| async move {
            info!(schedules = entries.len(), "cron manager started");
            // One cursor per entry; a failed tick keeps its window so the
            // missed triggers fire on the next pass.
            let mut cursors = vec![Utc::now(); entries.len()];

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let now = Utc::now();
                for (entry, cursor) in entries.iter().zip(cursors.iter_mut()) {
                    match fire_due_triggers(&pool, entry, *cursor, now).await {
                        Ok(()) => *cursor = now,
                        Err(error) => {
                            warn!(cron.key = entry.key(), %error, "cron tick failed, retrying next tick");
                        }
                    }
                }
            }
            debug!("cron manager stopped");
        });

        Self { lifecycle }
    }

    /// Request shutdown and wait for the tick loop to exit.
    pub(crate) async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

impl LifecycleStatus for CronManager {
    fn component_name(&self) -> &'static str {
        "cron-manager"
    }

    fn is_shutdown(&self) -> bool {
        self.lifecycle.is_shutdown()
    }
}

/// Insert one job per trigger of `entry` due in `(after, until]`.
///
/// A `None` from the insert means another process got there first, which
/// counts as fired.
async fn fire_due_triggers(
    pool: &PgPool,
    entry: &CronEntry,
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    for cron_at in entry.due_between(after, until) {
        let job = NewJob {
            job_type: &entry.job_type,
            data: entry.data.clone(),
            queue_name: &entry.queue_name,
            priority: entry.priority,
            scheduled_at: Some(cron_at),
            concurrency_key: None,
        };

        match storage::insert_cron_job(pool, job, &entry.key, cron_at).await? {
            Some(job_id) => {
                debug!(cron.key = entry.key(), %job_id, %cron_at, "cron trigger fired");
                notifier::publish(pool, &entry.queue_name).await?;
            }
            None => {
                debug!(cron.key = entry.key(), %cron_at, "cron trigger already fired elsewhere");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use claims::assert_ok;

    fn hourly() -> CronEntry {
        assert_ok!(CronEntry::new("hourly-report", "0 0 * * * *", "report"))
    }

    #[test]
    fn rejects_malformed_expressions() {
        claims::assert_err!(CronEntry::new("bad", "not a cron line", "report"));
    }

    #[test]
    fn due_between_is_exclusive_of_the_start_and_inclusive_of_the_end() {
        let entry = hourly();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap();

        let due = entry.due_between(start, end);
        assert_eq!(
            due,
            vec![
                Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn due_between_is_empty_when_no_trigger_falls_in_the_window() {
        let entry = hourly();
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 1).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 6, 1, 12, 59, 59).unwrap();
        assert!(entry.due_between(start, end).is_empty());
    }

    #[test]
    fn a_kept_cursor_keeps_earlier_triggers_due() {
        let entry = hourly();
        let cursor = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();

        // A tick that failed at 13:30 leaves the cursor at 12:30; the next
        // pass must still see the 13:00 trigger.
        let due = entry.due_between(cursor, later);
        assert_eq!(
            due,
            vec![
                Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap(),
            ]
        );
    }

    #[test]
    fn consecutive_windows_never_overlap() {
        let entry = hourly();
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 13, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 6, 1, 13, 30, 0).unwrap();

        let first = entry.due_between(t0, t1);
        let second = entry.due_between(t1, t2);
        assert_eq!(first, vec![t1]);
        assert!(second.is_empty());
    }
}
