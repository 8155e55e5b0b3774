//! In-memory implementation of every repository trait.
//!
//! One `tokio::sync::RwLock` guards the whole store, so each call is
//! atomic. Cloning shares the underlying state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use orchestrion_types::activity::{ActivityExecution, ActivityState, TaskLock};
use orchestrion_types::definition::{ActivityType, ProcessDefinition};
use orchestrion_types::error::RepositoryError;
use orchestrion_types::history::HistoryRecord;
use orchestrion_types::job::{Job, JobLease, JobState};
use orchestrion_types::migration::ProcessMigrationPlan;
use orchestrion_types::process::Process;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    DefinitionRepository, DeletedCounts, HistoryRepository, JobQuery, JobRepository,
    LeaseRepository, LockRequest, MigrationPlanRepository, ProcessQuery, RuntimeChanges,
    RuntimeRepository,
};

#[derive(Default)]
struct Inner {
    definitions: HashMap<Uuid, ProcessDefinition>,
    processes: HashMap<Uuid, Process>,
    activities: HashMap<Uuid, ActivityExecution>,
    jobs: HashMap<Uuid, Job>,
    history: HashMap<Uuid, HistoryRecord>,
    plans: HashMap<Uuid, ProcessMigrationPlan>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
}

impl Inner {
    fn is_suspended(&self, process_id: Option<Uuid>) -> bool {
        process_id
            .and_then(|id| self.processes.get(&id))
            .is_some_and(|p| p.suspended)
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

/// Revision check shared by every CAS write.
fn check_revision(
    kind: &str,
    id: &Uuid,
    stored: Option<u64>,
    expected: u64,
) -> Result<(), RepositoryError> {
    match (stored, expected) {
        (None, 0) => Ok(()),
        (Some(_), 0) => Err(RepositoryError::Conflict(format!("{kind} {id} already exists"))),
        (None, _) => Err(RepositoryError::NotFound),
        (Some(current), expected) if current == expected => Ok(()),
        (Some(current), expected) => Err(RepositoryError::Conflict(format!(
            "{kind} {id} is at revision {current}, expected {expected}"
        ))),
    }
}

fn page<T>(items: Vec<T>, offset: u32, limit: Option<u32>) -> Vec<T> {
    let iter = items.into_iter().skip(offset as usize);
    match limit {
        Some(limit) => iter.take(limit as usize).collect(),
        None => iter.collect(),
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

impl DefinitionRepository for MemoryStore {
    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        let taken = inner.definitions.contains_key(&definition.id)
            || inner
                .definitions
                .values()
                .any(|d| d.key == definition.key && d.version == definition.version);
        if taken {
            return Err(RepositoryError::Conflict(format!(
                "definition {} already deployed",
                definition.label()
            )));
        }
        inner.definitions.insert(definition.id, definition.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ProcessDefinition>, RepositoryError> {
        Ok(self.inner.read().await.definitions.get(id).cloned())
    }

    async fn find_definition(&self, key: &str, version: u32) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .values()
            .find(|d| d.key == key && d.version == version)
            .cloned())
    }

    async fn latest_definition(&self, key: &str) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .definitions
            .values()
            .filter(|d| d.key == key)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut defs: Vec<ProcessDefinition> = inner.definitions.values().cloned().collect();
        defs.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        Ok(defs)
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

impl RuntimeRepository for MemoryStore {
    async fn commit(&self, changes: &RuntimeChanges) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;

        if let Some(process) = &changes.process {
            let stored = inner.processes.get(&process.id).map(|p| p.revision);
            check_revision("process", &process.id, stored, process.revision)?;
        }
        for activity in &changes.activities {
            let stored = inner.activities.get(&activity.id).map(|a| a.revision);
            check_revision("activity", &activity.id, stored, activity.revision)?;
        }
        for job in &changes.jobs {
            let stored = inner.jobs.get(&job.id).map(|j| j.revision);
            check_revision("job", &job.id, stored, job.revision)?;
        }

        if let Some(process) = &changes.process {
            let mut process = process.clone();
            process.revision += 1;
            inner.processes.insert(process.id, process);
        }
        for activity in &changes.activities {
            let mut activity = activity.clone();
            activity.revision += 1;
            inner.activities.insert(activity.id, activity);
        }
        for job in &changes.jobs {
            let mut job = job.clone();
            job.revision += 1;
            inner.jobs.insert(job.id, job);
        }
        Ok(())
    }

    async fn get_process(&self, id: &Uuid) -> Result<Option<Process>, RepositoryError> {
        Ok(self.inner.read().await.processes.get(id).cloned())
    }

    async fn list_processes(&self, query: &ProcessQuery) -> Result<Vec<Process>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Process> = inner
            .processes
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.created_at, p.id));
        Ok(page(found, query.offset, query.limit))
    }

    async fn get_activity(&self, id: &Uuid) -> Result<Option<ActivityExecution>, RepositoryError> {
        Ok(self.inner.read().await.activities.get(id).cloned())
    }

    async fn list_activities(&self, process_id: &Uuid) -> Result<Vec<ActivityExecution>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut found: Vec<ActivityExecution> = inner
            .activities
            .values()
            .filter(|a| a.process_id == *process_id)
            .cloned()
            .collect();
        found.sort_by_key(|a| (a.created_at, a.id));
        Ok(found)
    }

    async fn fetch_and_lock(&self, request: &LockRequest) -> Result<Vec<ActivityExecution>, RepositoryError> {
        let mut inner = self.inner.write().await;

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = inner
            .activities
            .values()
            .filter(|a| a.topic.as_deref() == Some(request.topic.as_str()))
            .filter(|a| a.is_fetchable(request.now))
            .filter(|a| match inner.processes.get(&a.process_id) {
                Some(p) => {
                    !p.suspended
                        && !p.is_terminal()
                        && request
                            .definition_key
                            .as_deref()
                            .is_none_or(|k| p.definition_key == k)
                }
                None => false,
            })
            .map(|a| (a.created_at, a.id))
            .collect();
        candidates.sort();
        candidates.truncate(request.max_tasks);

        let mut locked = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(activity) = inner.activities.get_mut(&id) {
                activity.lock = Some(TaskLock {
                    worker_id: request.worker_id.clone(),
                    expires_at: request.lock_until,
                });
                activity.updated_at = request.now;
                activity.revision += 1;
                locked.push(activity.clone());
            }
        }
        Ok(locked)
    }

    async fn find_timed_out(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ActivityExecution>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut found: Vec<ActivityExecution> = inner
            .activities
            .values()
            .filter(|a| a.state == ActivityState::Active && a.timeout_at.is_some_and(|t| t <= now))
            .filter(|a| {
                matches!(
                    a.activity_type,
                    ActivityType::ServiceTask | ActivityType::ExternalTask | ActivityType::ReceiveTask
                )
            })
            .cloned()
            .collect();
        found.sort_by_key(|a| (a.timeout_at, a.id));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn find_compactable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: u32,
    ) -> Result<Vec<Process>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Process> = inner
            .processes
            .values()
            .filter(|p| p.is_terminal() && p.completed_at.is_some_and(|t| t <= cutoff))
            .filter(|p| after.is_none_or(|cursor| (p.created_at, p.id) > cursor))
            .cloned()
            .collect();
        found.sort_by_key(|p| (p.created_at, p.id));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn delete_process(&self, id: &Uuid) -> Result<DeletedCounts, RepositoryError> {
        let mut inner = self.inner.write().await;
        let processes = u64::from(inner.processes.remove(id).is_some());
        let before = inner.activities.len();
        inner.activities.retain(|_, a| a.process_id != *id);
        let activities = (before - inner.activities.len()) as u64;
        let before = inner.jobs.len();
        inner.jobs.retain(|_, j| j.process_id != Some(*id));
        let jobs = (before - inner.jobs.len()) as u64;
        Ok(DeletedCounts {
            processes,
            activities,
            jobs,
        })
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

impl JobRepository for MemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        check_revision("job", &job.id, inner.jobs.get(&job.id).map(|j| j.revision), 0)?;
        let mut job = job.clone();
        job.revision = 1;
        inner.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<Job, RepositoryError> {
        let mut inner = self.inner.write().await;
        let stored = inner.jobs.get(&job.id).map(|j| j.revision);
        if stored.is_none() {
            return Err(RepositoryError::NotFound);
        }
        check_revision("job", &job.id, stored, job.revision)?;
        let mut job = job.clone();
        job.revision += 1;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_job(
        &self,
        id: &Uuid,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let mut inner = self.inner.write().await;
        let claimable = inner.jobs.get(id).is_some_and(|j| j.is_claimable(now));
        if !claimable {
            return Ok(None);
        }
        let Some(job) = inner.jobs.get_mut(id) else {
            return Ok(None);
        };
        job.state = JobState::Running;
        job.started_at.get_or_insert(now);
        job.lease = Some(JobLease {
            owner: owner.to_string(),
            expires_at: lease_until,
        });
        job.attempts += 1;
        job.updated_at = now;
        job.revision += 1;
        Ok(Some(job.clone()))
    }

    async fn extend_job_lease(&self, id: &Uuid, owner: &str, until: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        match inner.jobs.get_mut(id) {
            Some(job) if job.state == JobState::Running => match job.lease.as_mut() {
                Some(lease) if lease.owner == owner => {
                    lease.expires_at = until;
                    Ok(true)
                }
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    async fn find_due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(now) && !inner.is_suspended(j.process_id))
            .cloned()
            .collect();
        found.sort_by_key(|j| (j.run_at, j.id));
        found.truncate(limit as usize);
        Ok(found)
    }

    async fn delete_finished_jobs(&self, before: DateTime<Utc>, limit: u32) -> Result<u64, RepositoryError> {
        let mut inner = self.inner.write().await;
        let mut finished: Vec<(DateTime<Utc>, Uuid)> = inner
            .jobs
            .values()
            .filter(|j| j.process_id.is_none() && j.is_terminal())
            .filter_map(|j| j.completed_at.filter(|at| *at < before).map(|at| (at, j.id)))
            .collect();
        finished.sort();
        finished.truncate(limit as usize);
        for (_, id) in &finished {
            inner.jobs.remove(id);
        }
        Ok(finished.len() as u64)
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut found: Vec<Job> = inner.jobs.values().filter(|j| query.matches(j)).cloned().collect();
        found.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Ok(page(found, query.offset, query.limit))
    }
}

// ---------------------------------------------------------------------------
// History, plans, leases
// ---------------------------------------------------------------------------

impl HistoryRepository for MemoryStore {
    async fn archive(&self, record: &HistoryRecord) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        if inner.history.contains_key(&record.process.id) {
            return Ok(false);
        }
        inner.history.insert(record.process.id, record.clone());
        Ok(true)
    }

    async fn get_history(&self, process_id: &Uuid) -> Result<Option<HistoryRecord>, RepositoryError> {
        Ok(self.inner.read().await.history.get(process_id).cloned())
    }

    async fn list_history(&self, limit: u32, offset: u32) -> Result<Vec<HistoryRecord>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut records: Vec<HistoryRecord> = inner.history.values().cloned().collect();
        records.sort_by(|a, b| {
            (b.archived_at, b.process.id).cmp(&(a.archived_at, a.process.id))
        });
        Ok(page(records, offset, Some(limit)))
    }

    async fn count_history(&self) -> Result<u64, RepositoryError> {
        Ok(self.inner.read().await.history.len() as u64)
    }
}

impl MigrationPlanRepository for MemoryStore {
    async fn save_plan(&self, plan: &ProcessMigrationPlan) -> Result<(), RepositoryError> {
        self.inner.write().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: &Uuid) -> Result<Option<ProcessMigrationPlan>, RepositoryError> {
        Ok(self.inner.read().await.plans.get(id).cloned())
    }

    async fn list_plans(&self, definition_key: Option<&str>) -> Result<Vec<ProcessMigrationPlan>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut plans: Vec<ProcessMigrationPlan> = inner
            .plans
            .values()
            .filter(|p| definition_key.is_none_or(|k| p.definition_key == k))
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(plans)
    }
}

impl LeaseRepository for MemoryStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        let free = match inner.leases.get(name) {
            Some((holder, expires_at)) => holder == owner || *expires_at <= now,
            None => true,
        };
        if free {
            inner.leases.insert(name.to_string(), (owner.to_string(), until));
        }
        Ok(free)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        if inner.leases.get(name).is_some_and(|(holder, _)| holder == owner) {
            inner.leases.remove(name);
            return Ok(true);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
