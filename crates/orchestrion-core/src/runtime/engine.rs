//! Process engine: the async shell around [`Transition`].
//!
//! Every state change of a process goes through [`ProcessEngine::transact`]:
//!
//! 1. take the per-process lock;
//! 2. load the process, its executions and its pinned definition;
//! 3. mutate a [`Transition`] snapshot and drain its step queue;
//! 4. commit the change set, retrying from step 2 on a revision conflict;
//! 5. release the lock, publish events, wake the job scheduler.
//!
//! Effects on other processes (starting a child, notifying a parent) come
//! back to the caller and are drained after the lock is gone, so no two
//! process locks are ever held together.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use orchestrion_types::activity::{ActivityExecution, ActivityState};
use orchestrion_types::command::{DefinitionRef, StartProcessCommand};
use orchestrion_types::config::EngineSettings;
use orchestrion_types::definition::{ActivityKind, ProcessDefinition};
use orchestrion_types::error::RepositoryError;
use orchestrion_types::event::EngineEvent;
use orchestrion_types::process::{Incident, ParentRef, Process, ProcessState};
use orchestrion_types::variables::Variables;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::lock::ProcessLocks;
use super::service::{ServiceContext, ServiceHandler};
use super::transition::{Effect, Outcome, Transition, visible_variables};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::repository::{EngineStore, ProcessQuery};

/// Commit attempts of one transition before a conflict is surfaced.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Result of one committed transition.
pub(crate) struct Applied<T> {
    pub process: Process,
    pub value: T,
    pub effects: Vec<Effect>,
}

/// What a service job finds when it looks up its activity.
pub(crate) enum PreparedCall {
    Ready(ServiceCall),
    /// The process is suspended; the job should wait for resume.
    Suspended,
    /// The activity moved on or the process finished.
    Stale,
}

/// A service task ready to run outside the process lock.
pub(crate) struct ServiceCall {
    pub handler_name: String,
    pub handler: Option<Arc<dyn ServiceHandler>>,
    pub context: ServiceContext,
}

pub struct ProcessEngine<S: EngineStore> {
    store: Arc<S>,
    events: EventBus,
    settings: EngineSettings,
    locks: ProcessLocks,
    definitions: DashMap<Uuid, Arc<ProcessDefinition>>,
    cancellations: DashMap<Uuid, CancellationToken>,
    services: DashMap<String, Arc<dyn ServiceHandler>>,
    job_wake: Arc<Notify>,
}

impl<S: EngineStore> ProcessEngine<S> {
    pub fn new(store: Arc<S>, events: EventBus, settings: EngineSettings) -> Self {
        Self {
            store,
            events,
            settings,
            locks: ProcessLocks::new(),
            definitions: DashMap::new(),
            cancellations: DashMap::new(),
            services: DashMap::new(),
            job_wake: Arc::new(Notify::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Notified whenever a committed transition created jobs.
    pub fn job_wake(&self) -> Arc<Notify> {
        Arc::clone(&self.job_wake)
    }

    /// Register the handler service tasks name in their `handler` field.
    pub fn register_service(&self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) {
        let name = name.into();
        tracing::debug!(service = %name, "service handler registered");
        self.services.insert(name, handler);
    }

    /// Token tripped when the process is cancelled or terminated.
    pub fn cancellation_token(&self, process_id: Uuid) -> CancellationToken {
        self.cancellations.entry(process_id).or_default().clone()
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a new definition version. Version 0 takes the next free version
    /// of the key; an explicit version must not exist yet.
    pub async fn deploy(&self, mut definition: ProcessDefinition) -> Result<ProcessDefinition, EngineError> {
        if definition.key.trim().is_empty() {
            return Err(EngineError::Definition("definition key must not be empty".to_string()));
        }
        if definition.version == 0 {
            let latest = self.store.latest_definition(&definition.key).await?;
            definition.version = latest.map_or(1, |d| d.version + 1);
        } else if self
            .store
            .find_definition(&definition.key, definition.version)
            .await?
            .is_some()
        {
            return Err(EngineError::Conflict(format!(
                "definition {} already deployed",
                definition.label()
            )));
        }
        definition.deployed_at = Utc::now();
        self.store.save_definition(&definition).await?;
        self.definitions.insert(definition.id, Arc::new(definition.clone()));

        tracing::info!(definition = %definition.label(), id = %definition.id, "definition deployed");
        Ok(definition)
    }

    pub async fn definition(&self, id: Uuid) -> Result<Arc<ProcessDefinition>, EngineError> {
        if let Some(cached) = self.definitions.get(&id) {
            return Ok(Arc::clone(&cached));
        }
        let definition = self
            .store
            .get_definition(&id)
            .await?
            .ok_or_else(|| EngineError::not_found("definition", id))?;
        let definition = Arc::new(definition);
        self.definitions.insert(id, Arc::clone(&definition));
        Ok(definition)
    }

    pub async fn resolve_definition(&self, reference: &DefinitionRef) -> Result<Arc<ProcessDefinition>, EngineError> {
        match reference {
            DefinitionRef::Id { id } => self.definition(*id).await,
            DefinitionRef::Key { key, version } => {
                let found = match version {
                    Some(v) => self.store.find_definition(key, *v).await?,
                    None => self.store.latest_definition(key).await?,
                };
                let definition = found.ok_or_else(|| {
                    EngineError::not_found("definition", format!("{key}:{}", version.map_or("latest".to_string(), |v| v.to_string())))
                })?;
                let definition = Arc::new(definition);
                self.definitions.insert(definition.id, Arc::clone(&definition));
                Ok(definition)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Process lifecycle
    // -----------------------------------------------------------------------

    pub async fn start(&self, command: StartProcessCommand) -> Result<Process, EngineError> {
        let definition = self.resolve_definition(&command.definition).await?;
        let applied = self
            .create(definition, Uuid::now_v7(), command.variables, command.business_key, None)
            .await?;
        self.finish(applied).await
    }

    pub async fn cancel(&self, process_id: Uuid) -> Result<Process, EngineError> {
        let applied = self
            .transact(process_id, |t| t.cancel_process(ProcessState::Cancelled))
            .await?;
        self.finish(applied).await
    }

    pub async fn terminate(&self, process_id: Uuid) -> Result<Process, EngineError> {
        let applied = self
            .transact(process_id, |t| t.cancel_process(ProcessState::Terminated))
            .await?;
        self.finish(applied).await
    }

    pub async fn recover(&self, process_id: Uuid) -> Result<Process, EngineError> {
        let applied = self.transact(process_id, |t| t.recover()).await?;
        tracing::info!(%process_id, "process recovered");
        self.finish(applied).await
    }

    pub async fn set_suspended(&self, process_id: Uuid, suspended: bool) -> Result<Process, EngineError> {
        let applied = self
            .transact(process_id, |t| t.set_suspended(suspended))
            .await?;
        if !suspended {
            self.job_wake.notify_one();
        }
        self.finish(applied).await
    }

    /// Suspend or resume every non-terminal process of a definition key.
    pub async fn set_suspended_by_key(&self, key: &str, suspended: bool) -> Result<Vec<Process>, EngineError> {
        let query = ProcessQuery {
            definition_key: Some(key.to_string()),
            ..Default::default()
        };
        let mut changed = Vec::new();
        for process in self.store.list_processes(&query).await? {
            if process.is_terminal() || process.suspended == suspended {
                continue;
            }
            match self.set_suspended(process.id, suspended).await {
                Ok(p) => changed.push(p),
                Err(EngineError::InvalidState(reason)) => {
                    tracing::debug!(process_id = %process.id, %reason, "skipped suspension change");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(definition_key = key, suspended, count = changed.len(), "suspension changed by key");
        Ok(changed)
    }

    pub async fn set_variables(&self, process_id: Uuid, variables: Variables) -> Result<Process, EngineError> {
        let applied = self
            .transact(process_id, |t| t.set_variables(&variables))
            .await?;
        self.finish(applied).await
    }

    pub async fn correlate_message(
        &self,
        process_id: Uuid,
        message: &str,
        variables: Variables,
    ) -> Result<Process, EngineError> {
        let applied = self
            .transact(process_id, |t| t.correlate_message(message, &variables))
            .await?;
        tracing::debug!(%process_id, message, activity_id = %applied.value, "message correlated");
        self.finish(applied).await
    }

    /// Fail every active activity whose deadline has passed. Returns how many
    /// timed out.
    pub async fn sweep_timeouts(&self, limit: u32) -> Result<usize, EngineError> {
        let expired = self.store.find_timed_out(Utc::now(), limit).await?;
        let mut timed_out = 0;
        for exec in expired {
            match self.transact(exec.process_id, |t| t.time_out(exec.id)).await {
                Ok(applied) => {
                    if applied.value {
                        timed_out += 1;
                    }
                    self.drain(applied.effects).await;
                }
                Err(e) => {
                    tracing::warn!(process_id = %exec.process_id, activity_id = %exec.id, error = %e, "timeout sweep failed");
                }
            }
        }
        Ok(timed_out)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn process(&self, process_id: Uuid) -> Result<Process, EngineError> {
        self.store
            .get_process(&process_id)
            .await?
            .ok_or_else(|| EngineError::not_found("process", process_id))
    }

    pub async fn activities(&self, process_id: Uuid) -> Result<Vec<ActivityExecution>, EngineError> {
        Ok(self.store.list_activities(&process_id).await?)
    }

    /// Incident views over the failed executions of a process.
    pub async fn incidents(&self, process_id: Uuid) -> Result<Vec<Incident>, EngineError> {
        let activities = self.activities(process_id).await?;
        Ok(activities
            .into_iter()
            .filter(|a| a.state == ActivityState::Failed)
            .map(|a| {
                let (reason, trace, occurred_at) = match a.failure {
                    Some(f) => (f.reason, f.trace, f.failed_at),
                    None => (String::new(), None, a.updated_at),
                };
                Incident {
                    process_id,
                    activity_id: a.id,
                    activity_definition_id: a.definition_id,
                    reason,
                    trace,
                    occurred_at,
                }
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Service tasks
    // -----------------------------------------------------------------------

    /// Build the call for the service job `job_id`.
    pub(crate) async fn prepare_service_call(
        &self,
        process_id: Uuid,
        activity_id: Uuid,
        job_id: Uuid,
    ) -> Result<PreparedCall, EngineError> {
        let Some(process) = self.store.get_process(&process_id).await? else {
            return Ok(PreparedCall::Stale);
        };
        if process.is_terminal() {
            return Ok(PreparedCall::Stale);
        }
        let activities = self.store.list_activities(&process_id).await?;
        let Some(exec) = activities.iter().find(|a| a.id == activity_id) else {
            return Ok(PreparedCall::Stale);
        };
        if exec.state != ActivityState::Active || exec.pending_job_id != Some(job_id) {
            return Ok(PreparedCall::Stale);
        }
        if process.suspended {
            return Ok(PreparedCall::Suspended);
        }
        let definition = self.definition(process.definition_id).await?;
        let handler_name = match definition.activity(&exec.definition_id).map(|a| &a.kind) {
            Some(ActivityKind::ServiceTask { handler }) => handler.clone(),
            _ => {
                return Err(EngineError::Definition(format!(
                    "activity '{}' is not a service task",
                    exec.definition_id
                )));
            }
        };
        let by_id = activities.iter().map(|a| (a.id, a.clone())).collect();
        let context = ServiceContext {
            process_id,
            activity_id,
            definition_id: exec.definition_id.clone(),
            business_key: process.business_key.clone(),
            variables: visible_variables(&process, &by_id, Some(activity_id)),
            loop_index: exec.loop_index,
            cancel: self.cancellation_token(process_id),
        };
        Ok(PreparedCall::Ready(ServiceCall {
            handler: self.services.get(&handler_name).map(|h| Arc::clone(&h)),
            handler_name,
            context,
        }))
    }

    /// Complete a service task on behalf of job `job_id`. Returns `false`
    /// when the job no longer owns the activity.
    pub(crate) async fn complete_service(
        &self,
        process_id: Uuid,
        activity_id: Uuid,
        job_id: Uuid,
        output: Variables,
    ) -> Result<bool, EngineError> {
        let applied = self
            .transact(process_id, |t| {
                if !owns_service(t, activity_id, job_id) {
                    return Ok(false);
                }
                t.complete_activity(activity_id, &output)?;
                Ok(true)
            })
            .await?;
        let owned = applied.value;
        self.drain(applied.effects).await;
        Ok(owned)
    }

    /// Record a failed service attempt. `terminal` skips the retry budget.
    pub(crate) async fn fail_service(
        &self,
        process_id: Uuid,
        activity_id: Uuid,
        job_id: Uuid,
        reason: &str,
        trace: Option<String>,
        terminal: bool,
    ) -> Result<bool, EngineError> {
        let applied = self
            .transact(process_id, |t| {
                if !owns_service(t, activity_id, job_id) {
                    return Ok(false);
                }
                if terminal {
                    t.fail_terminal(activity_id, reason, trace.clone())?;
                } else {
                    t.fail_activity(activity_id, reason, trace.clone(), None, None)?;
                }
                Ok(true)
            })
            .await?;
        let owned = applied.value;
        self.drain(applied.effects).await;
        Ok(owned)
    }

    // -----------------------------------------------------------------------
    // Transaction machinery
    // -----------------------------------------------------------------------

    /// Run `f` against a fresh snapshot of `process_id` and commit the
    /// outcome. `f` may run more than once when the commit conflicts.
    pub(crate) async fn transact<T, F>(&self, process_id: Uuid, mut f: F) -> Result<Applied<T>, EngineError>
    where
        T: Send,
        F: FnMut(&mut Transition<'_>) -> Result<T, EngineError> + Send,
    {
        let guard = self.locks.acquire(process_id).await;
        let result = self.transact_locked(process_id, &mut f).await;
        drop(guard);
        self.locks.release_if_idle(process_id);
        result.map(|(applied, events, jobs)| self.after_commit(applied, events, jobs))
    }

    async fn transact_locked<T, F>(
        &self,
        process_id: Uuid,
        f: &mut F,
    ) -> Result<(Applied<T>, Vec<EngineEvent>, bool), EngineError>
    where
        T: Send,
        F: FnMut(&mut Transition<'_>) -> Result<T, EngineError> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let process = self
                .store
                .get_process(&process_id)
                .await?
                .ok_or_else(|| EngineError::not_found("process", process_id))?;
            let definition = self.definition(process.definition_id).await?;
            let executions = self.store.list_activities(&process_id).await?;

            let (value, process, outcome) = self.plan(&definition, process, executions, &mut *f)?;
            match self.commit(&outcome).await {
                Ok(()) => return Ok(split(value, process, outcome)),
                Err(RepositoryError::Conflict(reason)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    tracing::debug!(%process_id, attempt, %reason, "transition conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Create `id` from `definition` and start it in one commit.
    async fn create(
        &self,
        definition: Arc<ProcessDefinition>,
        id: Uuid,
        variables: Variables,
        business_key: Option<String>,
        parent: Option<(ParentRef, Uuid)>,
    ) -> Result<Applied<()>, EngineError> {
        let process = Process::new(id, &definition, variables, business_key, parent, Utc::now());
        let guard = self.locks.acquire(id).await;
        let result = async {
            let (value, process, outcome) = self.plan(&definition, process, Vec::new(), |t| t.start())?;
            self.commit(&outcome).await?;
            Ok::<_, EngineError>(split(value, process, outcome))
        }
        .await;
        drop(guard);
        self.locks.release_if_idle(id);
        let (applied, events, jobs) = result?;
        tracing::info!(process_id = %id, definition = %definition.label(), "process started");
        Ok(self.after_commit(applied, events, jobs))
    }

    /// The synchronous part of a transition. Kept out of the async frames so
    /// the snapshot never lives across an await.
    fn plan<T>(
        &self,
        definition: &ProcessDefinition,
        process: Process,
        executions: Vec<ActivityExecution>,
        f: impl FnOnce(&mut Transition<'_>) -> Result<T, EngineError>,
    ) -> Result<(T, Process, Outcome), EngineError> {
        let mut transition = Transition::new(definition, &self.settings, process, executions, Utc::now());
        let value = f(&mut transition)?;
        transition.run()?;
        let process = transition.process().clone();
        let mut outcome = transition.into_outcome();
        if outcome.changes.process.is_none() && !outcome.changes.activities.is_empty() {
            // Writers of the same process conflict on the process revision.
            outcome.changes.process = Some(process.clone());
        }
        Ok((value, process, outcome))
    }

    async fn commit(&self, outcome: &Outcome) -> Result<(), RepositoryError> {
        if outcome.changes.is_empty() {
            return Ok(());
        }
        self.store.commit(&outcome.changes).await
    }

    fn after_commit<T>(&self, applied: Applied<T>, events: Vec<EngineEvent>, jobs_added: bool) -> Applied<T> {
        let process = &applied.process;
        if process.is_terminal() {
            if let Some((_, token)) = self.cancellations.remove(&process.id) {
                if matches!(process.state, ProcessState::Cancelled | ProcessState::Terminated) {
                    token.cancel();
                }
            }
        }
        self.events.publish_all(events);
        if jobs_added {
            self.job_wake.notify_one();
        }
        applied
    }

    async fn finish<T>(&self, applied: Applied<T>) -> Result<Process, EngineError> {
        let process_id = applied.process.id;
        self.drain(applied.effects).await;
        self.process(process_id).await
    }

    // -----------------------------------------------------------------------
    // Cross-process effects
    // -----------------------------------------------------------------------

    /// Perform effects until none are left. Failures are logged; the
    /// transition that produced them is already committed.
    pub(crate) async fn drain(&self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match self.perform(effect.clone()).await {
                Ok(more) => queue.extend(more),
                Err(e) => {
                    tracing::warn!(?effect, error = %e, "process effect failed");
                }
            }
        }
    }

    async fn perform(&self, effect: Effect) -> Result<Vec<Effect>, EngineError> {
        match effect {
            Effect::StartChild {
                child_id,
                called_element,
                version,
                variables,
                business_key,
                parent,
                root_process_id,
            } => {
                let reference = DefinitionRef::Key {
                    key: called_element.clone(),
                    version,
                };
                match self.resolve_definition(&reference).await {
                    Ok(definition) => {
                        let applied = self
                            .create(definition, child_id, variables, business_key, Some((parent, root_process_id)))
                            .await;
                        match applied {
                            Ok(applied) => Ok(applied.effects),
                            Err(e) => self.child_failed(parent, child_id, &e.to_string()).await,
                        }
                    }
                    Err(e) => {
                        let reason = format!("cannot start called process '{called_element}': {e}");
                        self.child_failed(parent, child_id, &reason).await
                    }
                }
            }
            Effect::CancelChild { child_id } => {
                match self
                    .transact(child_id, |t| t.cancel_process(ProcessState::Cancelled))
                    .await
                {
                    Ok(applied) => Ok(applied.effects),
                    Err(EngineError::NotFound { .. }) => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
            Effect::ChildCompleted {
                parent,
                child_id,
                variables,
            } => {
                let applied = self
                    .transact(parent.process_id, |t| t.child_completed(parent.activity_id, child_id, &variables))
                    .await?;
                Ok(applied.effects)
            }
            Effect::ChildIncident {
                parent,
                child_id,
                reason,
            } => self.child_failed(parent, child_id, &reason).await,
            Effect::ChildError {
                parent,
                child_id,
                error_code,
            } => {
                let applied = self
                    .transact(parent.process_id, |t| t.child_error(parent.activity_id, child_id, &error_code))
                    .await?;
                Ok(applied.effects)
            }
            Effect::RecoverChild { parent, child_id } => {
                let child = self.store.get_process(&child_id).await?;
                let applied = match child {
                    None => {
                        self.transact(parent.process_id, |t| t.restart_call(parent.activity_id))
                            .await?
                    }
                    Some(child) if child.state == ProcessState::Incident => {
                        self.transact(child_id, |t| t.recover()).await?
                    }
                    Some(child) if child.state == ProcessState::Completed => {
                        let variables = child.variables;
                        self.transact(parent.process_id, |t| {
                            t.child_completed(parent.activity_id, child_id, &variables)
                        })
                        .await?
                    }
                    Some(child) if child.is_terminal() => {
                        let reason = format!("called process {child_id} is {}", child.state);
                        self.transact(parent.process_id, |t| t.child_incident(parent.activity_id, child_id, &reason))
                            .await?
                    }
                    Some(_) => return Ok(Vec::new()),
                };
                Ok(applied.effects)
            }
        }
    }

    async fn child_failed(&self, parent: ParentRef, child_id: Uuid, reason: &str) -> Result<Vec<Effect>, EngineError> {
        let applied = self
            .transact(parent.process_id, |t| t.child_incident(parent.activity_id, child_id, reason))
            .await?;
        Ok(applied.effects)
    }
}

fn owns_service(t: &Transition<'_>, activity_id: Uuid, job_id: Uuid) -> bool {
    !t.process().is_terminal()
        && t.execution(activity_id)
            .is_ok_and(|e| e.state == ActivityState::Active && e.pending_job_id == Some(job_id))
}

fn split<T>(value: T, process: Process, outcome: Outcome) -> (Applied<T>, Vec<EngineEvent>, bool) {
    let jobs_added = !outcome.changes.jobs.is_empty();
    (
        Applied {
            process,
            value,
            effects: outcome.effects,
        },
        outcome.events,
        jobs_added,
    )
}
