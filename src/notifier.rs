//! LISTEN/NOTIFY plumbing between producers and schedulers.
//!
//! All lockstep processes share one channel. A message carries a queue-name
//! hint so only schedulers watching that queue re-poll. Notifications are a
//! latency optimization, never the source of truth: a message missed during a
//! disconnect is recovered by the next poller tick, because the job row is
//! still there and still eligible.

use crate::config::NOTIFY_CHANNEL;
use crate::hooks::LifecycleStatus;
use crate::lifecycle::TaskLifecycle;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A wakeup signal for parked workers.
#[derive(Debug, Clone)]
pub(crate) struct Wake {
    /// The queue that has new work, or `None` for a full sweep.
    pub(crate) queue_name: Option<String>,
}

/// The JSON payload published on the shared channel.
#[derive(Debug, Serialize, Deserialize)]
struct Message {
    queue_name: String,
}

/// Publish a "new work in `queue_name`" message on the shared channel.
pub async fn publish(pool: &PgPool, queue_name: &str) -> Result<(), sqlx::Error> {
    let payload = serde_json::to_string(&Message {
        queue_name: queue_name.to_string(),
    })
    .unwrap_or_default();

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NOTIFY_CHANNEL)
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

/// Subscribes to the shared channel and fans wakeups out to local schedulers.
#[derive(Debug)]
pub struct Notifier {
    lifecycle: TaskLifecycle,
}

impl Notifier {
    /// Start the listen loop, forwarding messages into `wake_tx`.
    pub(crate) fn start(pool: PgPool, wake_tx: broadcast::Sender<Wake>) -> Self {
        let lifecycle = TaskLifecycle::spawn(move |token| async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = listen(&pool, &wake_tx, &token) => {
                        if let Err(error) = result {
                            warn!(%error, "notification listener disconnected, retrying");
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                            }
                        } else {
                            break;
                        }
                    }
                }
            }
            debug!("notifier stopped");
        });

        Self { lifecycle }
    }

    /// Request shutdown and wait for the listen loop to exit.
    pub(crate) async fn stop(&self) {
        self.lifecycle.stop().await;
    }
}

impl LifecycleStatus for Notifier {
    fn component_name(&self) -> &'static str {
        "notifier"
    }

    fn is_shutdown(&self) -> bool {
        self.lifecycle.is_shutdown()
    }
}

/// Hold a LISTEN subscription and forward messages until an error or shutdown.
///
/// Re-entered by the caller on error, which reissues the subscription on a
/// fresh connection.
async fn listen(
    pool: &PgPool,
    wake_tx: &broadcast::Sender<Wake>,
    token: &tokio_util::sync::CancellationToken,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(NOTIFY_CHANNEL).await?;
    debug!(channel = NOTIFY_CHANNEL, "listening for job notifications");

    loop {
        let notification = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            result = listener.recv() => result?,
        };

        let queue_name = match serde_json::from_str::<Message>(notification.payload()) {
            Ok(message) => Some(message.queue_name),
            Err(_) => {
                // Unknown payloads still mean "something changed"; sweep.
                trace!(payload = notification.payload(), "unparseable notification");
                None
            }
        };

        let _ = wake_tx.send(Wake { queue_name });
    }
}
