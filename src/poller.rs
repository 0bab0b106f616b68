//! Interval polling: the correctness backstop behind notifications.
//!
//! Every tick broadcasts a full sweep to all local schedulers, regardless of
//! notification activity. A claim interrupted by a crash, a missed publish,
//! or a scheduled job whose due time arrives without any insert event are all
//! discovered here.

use crate::hooks::LifecycleStatus;
use crate::lifecycle::TaskLifecycle;
use crate::notifier::Wake;
use rand::Rng;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Fires a scheduler sweep on a fixed interval.
#[derive(Debug)]
pub struct Poller {
    lifecycle: TaskLifecycle,
}

impl Poller {
    /// Start ticking every `interval` plus up to `jitter` of random slack.
    ///
    /// Jitter spreads out the ticks of many processes sharing one database so
    /// their sweeps don't land in lockstep.
    pub(crate) fn start(
        interval: Duration,
        jitter: Duration,
        wake_tx: broadcast::Sender<Wake>,
    ) -> Self {
        let lifecycle = TaskLifecycle::spawn(move |token| async move {
            loop {
                let sleep_duration = duration_with_jitter(interval, jitter);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(sleep_duration) => {}
                }

                trace!("poll tick, sweeping schedulers");
                let _ = wake_tx.send(Wake { queue_name: None });
            }
            debug!("poller stopped");
        });

        Self { lifecycle }
    }

    /// Request shutdown and wait for the tick loop to exit.
    pub(crate) async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

impl LifecycleStatus for Poller {
    fn component_name(&self) -> &'static str {
        "poller"
    }

    fn is_shutdown(&self) -> bool {
        self.lifecycle.is_shutdown()
    }
}

fn duration_with_jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }

    let jitter_millis = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
    interval + Duration::from_millis(random_jitter)
}
