//! Job repository trait.

use chrono::{DateTime, Utc};
use orchestrion_types::error::RepositoryError;
use orchestrion_types::job::Job;
use uuid::Uuid;

use super::JobQuery;

pub trait JobRepository: Send + Sync {
    fn insert_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Compare-and-swap on `job.revision`. Returns the stored job with its
    /// bumped revision.
    fn update_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<Job, RepositoryError>> + Send;

    /// Atomically claim a job that is `Created` and due, or `Running` with
    /// an expired lease. The claimed job is `Running`, leased to `owner`
    /// until `lease_until`, and has `attempts` incremented.
    ///
    /// Returns `None` when the job is not claimable.
    fn claim_job(
        &self,
        id: &Uuid,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Push the lease of a job still held by `owner`. The revision is left
    /// alone so the holder's final update still succeeds.
    fn extend_job_lease(
        &self,
        id: &Uuid,
        owner: &str,
        until: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Claimable jobs, oldest `run_at` first, skipping jobs of suspended
    /// processes.
    fn find_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    /// Delete up to `limit` completed or failed jobs that belong to no
    /// process and finished before `before`. Returns how many went.
    fn delete_finished_jobs(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Newest first.
    fn list_jobs(
        &self,
        query: &JobQuery,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;
}
