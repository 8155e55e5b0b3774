//! External task handoff.
//!
//! Active external-task executions are offered to workers by topic. A fetch
//! locks tasks to one worker until the lock expires; only the lock holder
//! may complete, fail or extend the task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orchestrion_types::activity::ActivityExecution;
use orchestrion_types::config::ExternalTaskSettings;
use orchestrion_types::definition::ActivityType;
use orchestrion_types::task::{ExternalTask, TaskFailure};
use orchestrion_types::variables::Variables;
use uuid::Uuid;

use crate::error::EngineError;
use crate::repository::{EngineStore, LockRequest};
use crate::runtime::ProcessEngine;
use crate::runtime::transition::visible_variables;

/// Parameters of [`ExternalTaskGateway::fetch_and_lock`].
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub topic: String,
    pub worker_id: String,
    pub definition_key: Option<String>,
    /// Configured default when `None`.
    pub lock_duration: Option<Duration>,
    /// Configured default when `None`.
    pub max_tasks: Option<usize>,
}

impl FetchRequest {
    pub fn new(topic: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            worker_id: worker_id.into(),
            definition_key: None,
            lock_duration: None,
            max_tasks: None,
        }
    }

    pub fn for_definition(mut self, key: impl Into<String>) -> Self {
        self.definition_key = Some(key.into());
        self
    }

    pub fn lock_for(mut self, duration: Duration) -> Self {
        self.lock_duration = Some(duration);
        self
    }

    pub fn max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = Some(max);
        self
    }
}

pub struct ExternalTaskGateway<S: EngineStore> {
    engine: Arc<ProcessEngine<S>>,
    settings: ExternalTaskSettings,
}

impl<S: EngineStore> ExternalTaskGateway<S> {
    pub fn new(engine: Arc<ProcessEngine<S>>, settings: ExternalTaskSettings) -> Self {
        Self { engine, settings }
    }

    pub fn settings(&self) -> &ExternalTaskSettings {
        &self.settings
    }

    /// Lock up to `max_tasks` fetchable tasks of the topic for the worker.
    pub async fn fetch_and_lock(&self, request: &FetchRequest) -> Result<Vec<ExternalTask>, EngineError> {
        let now = Utc::now();
        let duration = request
            .lock_duration
            .unwrap_or(Duration::from_millis(self.settings.default_lock_duration_ms));
        let lock_until = now + to_chrono(duration)?;
        let lock = LockRequest {
            topic: request.topic.clone(),
            definition_key: request.definition_key.clone(),
            worker_id: request.worker_id.clone(),
            lock_until,
            now,
            max_tasks: request.max_tasks.unwrap_or(self.settings.max_tasks_per_fetch),
        };
        let locked = self.engine.store().fetch_and_lock(&lock).await?;
        if locked.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_process: HashMap<Uuid, Vec<ActivityExecution>> = HashMap::new();
        for exec in locked {
            by_process.entry(exec.process_id).or_default().push(exec);
        }

        let mut tasks = Vec::new();
        for (process_id, execs) in by_process {
            let Some(process) = self.engine.store().get_process(&process_id).await? else {
                continue;
            };
            let scope: HashMap<Uuid, ActivityExecution> = self
                .engine
                .store()
                .list_activities(&process_id)
                .await?
                .into_iter()
                .map(|a| (a.id, a))
                .collect();
            for exec in execs {
                tasks.push(ExternalTask {
                    id: exec.id,
                    process_id,
                    topic: request.topic.clone(),
                    definition_key: process.definition_key.clone(),
                    activity_id: exec.definition_id.clone(),
                    business_key: process.business_key.clone(),
                    variables: visible_variables(&process, &scope, Some(exec.id)),
                    retries: exec.retries,
                    worker_id: request.worker_id.clone(),
                    lock_expires_at: lock_until,
                });
            }
        }
        tasks.sort_by_key(|t| t.id);

        tracing::debug!(topic = %request.topic, worker = %request.worker_id, count = tasks.len(), "external tasks locked");
        Ok(tasks)
    }

    /// Complete a locked task; `variables` merge into the process scope.
    /// Completing a task of a finished process does nothing.
    pub async fn complete(&self, task_id: Uuid, worker_id: &str, variables: Variables) -> Result<(), EngineError> {
        let process_id = self.task_process(task_id).await?;
        let applied = self
            .engine
            .transact(process_id, |t| {
                if t.process().is_terminal() {
                    return Ok(false);
                }
                t.ensure_locked(task_id, worker_id)?;
                if t.process().suspended {
                    return Err(EngineError::InvalidState(format!("process {process_id} is suspended")));
                }
                t.complete_activity(task_id, &variables)?;
                Ok(true)
            })
            .await?;
        if applied.value {
            tracing::debug!(%task_id, worker = worker_id, "external task completed");
        }
        self.engine.drain(applied.effects).await;
        Ok(())
    }

    /// Report a failed attempt. Returns whether the task will be offered
    /// again; `false` means the process went into incident.
    pub async fn fail(&self, task_id: Uuid, worker_id: &str, failure: TaskFailure) -> Result<bool, EngineError> {
        let process_id = self.task_process(task_id).await?;
        let delay = failure
            .retry_delay_ms
            .map(|ms| to_chrono(Duration::from_millis(ms)))
            .transpose()?;
        let applied = self
            .engine
            .transact(process_id, |t| {
                if t.process().is_terminal() {
                    return Ok(false);
                }
                t.ensure_locked(task_id, worker_id)?;
                t.fail_activity(
                    task_id,
                    &failure.reason,
                    failure.trace.clone(),
                    failure.retries_left,
                    delay,
                )
            })
            .await?;
        tracing::info!(%task_id, worker = worker_id, reason = %failure.reason, will_retry = applied.value, "external task failed");
        self.engine.drain(applied.effects).await;
        Ok(applied.value)
    }

    /// Throw a business error from a locked task. `variables` merge into the
    /// process scope first, so the boundary path can read them.
    pub async fn throw_error(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error_code: &str,
        variables: Variables,
    ) -> Result<(), EngineError> {
        let process_id = self.task_process(task_id).await?;
        let applied = self
            .engine
            .transact(process_id, |t| {
                if t.process().is_terminal() {
                    return Ok(());
                }
                t.ensure_locked(task_id, worker_id)?;
                if t.process().suspended {
                    return Err(EngineError::InvalidState(format!("process {process_id} is suspended")));
                }
                if !variables.is_empty() {
                    t.set_variables(&variables)?;
                }
                t.throw_error(task_id, error_code)
            })
            .await?;
        tracing::info!(%task_id, worker = worker_id, error_code, "external task threw an error");
        self.engine.drain(applied.effects).await;
        Ok(())
    }

    pub async fn extend_lock(&self, task_id: Uuid, worker_id: &str, duration: Duration) -> Result<(), EngineError> {
        let process_id = self.task_process(task_id).await?;
        let extra = to_chrono(duration)?;
        self.engine
            .transact(process_id, |t| {
                let until = t.now() + extra;
                t.extend_lock(task_id, worker_id, until)
            })
            .await?;
        Ok(())
    }

    async fn task_process(&self, task_id: Uuid) -> Result<Uuid, EngineError> {
        let exec = self
            .engine
            .store()
            .get_activity(&task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("external task", task_id))?;
        if exec.activity_type != ActivityType::ExternalTask {
            return Err(EngineError::InvalidState(format!(
                "activity {task_id} is a {}, not an external task",
                exec.activity_type
            )));
        }
        Ok(exec.process_id)
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration, EngineError> {
    chrono::Duration::from_std(duration)
        .map_err(|_| EngineError::InvalidState(format!("duration {duration:?} out of range")))
}
