//! Runtime repository trait: processes and activity executions.

use chrono::{DateTime, Utc};
use orchestrion_types::activity::ActivityExecution;
use orchestrion_types::error::RepositoryError;
use orchestrion_types::process::Process;
use uuid::Uuid;

use super::{DeletedCounts, LockRequest, ProcessQuery, RuntimeChanges};

/// Storage for running process state.
///
/// Every write goes through [`RuntimeRepository::commit`], which applies a
/// whole change set under optimistic concurrency control:
/// - an entity with `revision == 0` is inserted and must not exist yet;
/// - any other entity must still be stored at exactly that revision;
/// - stored revisions are bumped by one.
///
/// Any violation fails the whole set with `RepositoryError::Conflict` and
/// nothing is written.
pub trait RuntimeRepository: Send + Sync {
    fn commit(
        &self,
        changes: &RuntimeChanges,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_process(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Process>, RepositoryError>> + Send;

    /// Ordered by creation time, oldest first.
    fn list_processes(
        &self,
        query: &ProcessQuery,
    ) -> impl std::future::Future<Output = Result<Vec<Process>, RepositoryError>> + Send;

    fn get_activity(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ActivityExecution>, RepositoryError>> + Send;

    /// Every execution of a process, ordered by creation time.
    fn list_activities(
        &self,
        process_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ActivityExecution>, RepositoryError>> + Send;

    /// Atomically lock up to `max_tasks` fetchable external tasks.
    ///
    /// Skips suspended processes, held locks and tasks not yet available.
    /// Returned executions carry the new lock and revision.
    fn fetch_and_lock(
        &self,
        request: &LockRequest,
    ) -> impl std::future::Future<Output = Result<Vec<ActivityExecution>, RepositoryError>> + Send;

    /// Active executions whose `timeout_at` is at or before `now`.
    fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<ActivityExecution>, RepositoryError>> + Send;

    /// One page of terminal processes completed at or before `cutoff`,
    /// ordered by `(created_at, id)` and strictly after `after`.
    fn find_compactable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Process>, RepositoryError>> + Send;

    /// Remove a process with its executions and jobs.
    fn delete_process(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<DeletedCounts, RepositoryError>> + Send;
}
