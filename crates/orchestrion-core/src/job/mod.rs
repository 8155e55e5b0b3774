//! Asynchronous, retryable work.
//!
//! Jobs carry opaque input and report opaque output; the handler registered
//! for a job type gives them meaning. The scheduler claims due jobs through
//! a store lease, so at most one attempt of a job is in flight at a time.

pub mod cron;
pub mod retry;
pub mod scheduler;

pub use cron::{CronScheduler, SchedulerError, normalize_schedule};
pub use retry::RetryPolicy;
pub use scheduler::JobScheduler;

use futures_util::future::BoxFuture;
use orchestrion_types::job::Job;
use orchestrion_types::variables::Variables;
use tokio_util::sync::CancellationToken;

/// One claimed attempt of a job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job as claimed; `attempts` already counts this attempt.
    pub job: Job,
    /// Tripped when the attempt runs out of time. Handlers should stop and
    /// report a failure.
    pub cancel: CancellationToken,
}

/// Error a handler returns when its job cannot run yet. The job goes back
/// to the queue without spending the attempt.
#[derive(Debug, thiserror::Error)]
#[error("job deferred: {0}")]
pub struct Deferred(pub String);

pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &str;

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, anyhow::Result<Variables>>;

    /// Called before a job is stored as failed for good, including when its
    /// last attempt died with the node that ran it. An error keeps the job
    /// running until its lease expires, and the scheduler calls again.
    fn exhausted<'a>(&'a self, job: &'a Job, reason: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        let _ = (job, reason);
        Box::pin(async { Ok(()) })
    }
}
