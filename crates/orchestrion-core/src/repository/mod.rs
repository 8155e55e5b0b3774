//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (orchestrion-infra) implements. The core crate never depends on any
//! specific storage technology; `MemoryStore` is the in-process
//! implementation used by tests and ephemeral engines.

pub mod definition;
pub mod history;
pub mod job;
pub mod lease;
pub mod memory;
pub mod migration;
pub mod runtime;

pub use definition::DefinitionRepository;
pub use history::HistoryRepository;
pub use job::JobRepository;
pub use lease::LeaseRepository;
pub use memory::MemoryStore;
pub use migration::MigrationPlanRepository;
pub use runtime::RuntimeRepository;

use chrono::{DateTime, Utc};
use orchestrion_types::activity::ActivityExecution;
use orchestrion_types::job::{Job, JobState};
use orchestrion_types::process::{Process, ProcessState};
use uuid::Uuid;

/// Everything the engine needs from a store.
pub trait EngineStore:
    DefinitionRepository
    + RuntimeRepository
    + JobRepository
    + HistoryRepository
    + MigrationPlanRepository
    + LeaseRepository
    + 'static
{
}

impl<T> EngineStore for T where
    T: DefinitionRepository
        + RuntimeRepository
        + JobRepository
        + HistoryRepository
        + MigrationPlanRepository
        + LeaseRepository
        + 'static
{
}

// ---------------------------------------------------------------------------
// Change sets and queries
// ---------------------------------------------------------------------------

/// One atomic, revision-checked write.
///
/// Jobs ride along with the process state that created them, so a job is
/// never lost between a commit and its enqueue.
#[derive(Debug, Clone, Default)]
pub struct RuntimeChanges {
    pub process: Option<Process>,
    pub activities: Vec<ActivityExecution>,
    pub jobs: Vec<Job>,
}

impl RuntimeChanges {
    pub fn is_empty(&self) -> bool {
        self.process.is_none() && self.activities.is_empty() && self.jobs.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessQuery {
    pub state: Option<ProcessState>,
    pub definition_id: Option<Uuid>,
    pub definition_key: Option<String>,
    pub parent_process_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl ProcessQuery {
    pub fn matches(&self, process: &Process) -> bool {
        self.state.is_none_or(|s| process.state == s)
            && self.definition_id.is_none_or(|id| process.definition_id == id)
            && self
                .definition_key
                .as_deref()
                .is_none_or(|k| process.definition_key == k)
            && self
                .parent_process_id
                .is_none_or(|p| process.parent.is_some_and(|r| r.process_id == p))
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub state: Option<JobState>,
    pub job_type: Option<String>,
    pub process_id: Option<Uuid>,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl JobQuery {
    pub fn matches(&self, job: &Job) -> bool {
        self.state.is_none_or(|s| job.state == s)
            && self.job_type.as_deref().is_none_or(|t| job.job_type == t)
            && self.process_id.is_none_or(|p| job.process_id == Some(p))
    }
}

/// Parameters of an external-task fetch.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub topic: String,
    pub definition_key: Option<String>,
    pub worker_id: String,
    pub lock_until: DateTime<Utc>,
    pub now: DateTime<Utc>,
    pub max_tasks: usize,
}

/// Rows removed by [`RuntimeRepository::delete_process`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletedCounts {
    pub processes: u64,
    pub activities: u64,
    pub jobs: u64,
}
