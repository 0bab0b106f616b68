//! Runtime configuration: queue rules and timing knobs.

use std::time::Duration;

/// Default interval between fallback polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default maximum random jitter added to each poll interval.
pub const DEFAULT_JITTER: Duration = Duration::from_millis(100);
/// Default interval between cron manager ticks.
pub const DEFAULT_CRON_INTERVAL: Duration = Duration::from_secs(15);
/// Default cap on the number of candidates a worker scans per wakeup.
pub const DEFAULT_CANDIDATE_SCAN_LIMIT: i64 = 20;
/// The Postgres NOTIFY channel all lockstep processes share.
pub const NOTIFY_CHANNEL: &str = "lockstep_jobs";

/// Error raised for a malformed queue rule string.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A rule segment was not of the form `queue[,queue...]:count`.
    #[error("malformed queue rule segment {0:?}, expected \"queue:count\"")]
    MalformedRule(String),

    /// The worker count was missing, zero, or not a number.
    #[error("invalid worker count in queue rule segment {0:?}")]
    InvalidWorkerCount(String),
}

/// Which queues a scheduler is responsible for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSelector {
    /// The `*` rule: every queue.
    All,
    /// An explicit set of queue names.
    Named(Vec<String>),
}

impl QueueSelector {
    /// Whether a notification for `queue_name` should wake this selector.
    pub fn matches(&self, queue_name: &str) -> bool {
        match self {
            QueueSelector::All => true,
            QueueSelector::Named(names) => names.iter().any(|name| name == queue_name),
        }
    }

    /// The SQL-side queue filter; `None` means unfiltered.
    pub fn as_filter(&self) -> Option<&[String]> {
        match self {
            QueueSelector::All => None,
            QueueSelector::Named(names) => Some(names),
        }
    }
}

/// One queue-matching rule with its worker count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRule {
    /// Queues this rule covers.
    pub selector: QueueSelector,
    /// Number of concurrent workers dedicated to the rule.
    pub workers: usize,
}

impl QueueRule {
    /// A short label for worker names and tracing spans.
    pub fn label(&self) -> String {
        match &self.selector {
            QueueSelector::All => "*".to_string(),
            QueueSelector::Named(names) => names.join(","),
        }
    }
}

/// Parse a queue rule string like `"mice,rats:2;elephants:1;*:3"`.
///
/// Each semicolon-separated segment names one or more queues (comma-separated,
/// or `*` for all queues) and a worker count. A segment without a count gets
/// one worker.
pub fn parse_queue_rules(spec: &str) -> Result<Vec<QueueRule>, ConfigError> {
    let mut rules = Vec::new();

    for segment in spec.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }

        let (queues, workers) = match segment.rsplit_once(':') {
            Some((queues, count)) => {
                let workers = count
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidWorkerCount(segment.to_string()))?;
                if workers == 0 {
                    return Err(ConfigError::InvalidWorkerCount(segment.to_string()));
                }
                (queues.trim(), workers)
            }
            None => (segment, 1),
        };

        let selector = if queues == "*" {
            QueueSelector::All
        } else {
            let names: Vec<String> = queues
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect();
            if names.is_empty() || names.iter().any(|name| name == "*") {
                return Err(ConfigError::MalformedRule(segment.to_string()));
            }
            QueueSelector::Named(names)
        };

        rules.push(QueueRule { selector, workers });
    }

    if rules.is_empty() {
        return Err(ConfigError::MalformedRule(spec.to_string()));
    }

    Ok(rules)
}
