#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod admin;
mod capsule;
pub mod config;
pub mod cron;
mod errors;
pub mod hooks;
mod job_handler;
mod job_registry;
mod lifecycle;
pub mod lock;
mod notifier;
mod poller;
mod scheduler;
pub mod schema;
pub mod storage;
mod util;

/// Administrative mutations over jobs.
pub use self::admin::{Admin, AdminAction, BatchOutcome, JobFilter, JobSelection};
/// The composition root and its shutdown policy.
pub use self::capsule::{Capsule, CapsuleBuilder, ShutdownTimeout};
/// Recurring schedules.
pub use self::cron::CronEntry;
/// Error types for producers and administrators.
pub use self::errors::{AdminError, EnqueueError};
/// The main trait for defining executable jobs, and the untyped producer API.
pub use self::job_handler::{DEFAULT_QUEUE, JobHandler, Submission, submit};
/// Advisory-lock claim arbitration.
pub use self::lock::LockArbiter;
/// Publish a wakeup for a queue on the shared channel.
pub use self::notifier::publish;
/// Derived job lifecycle states.
pub use self::schema::JobState;
/// Create the storage schema.
pub use self::storage::run_migrations;
