//! Synchronous token-flow core.
//!
//! A `Transition` is a working snapshot of one process: its row, every
//! activity execution and the pinned definition. Operations mutate the
//! snapshot and queue [`Step`]s; `run` drains the queue until the process
//! reaches a wait state. Nothing here touches the store. The caller commits
//! the resulting [`Outcome`] as one revision-checked change set and then
//! performs its side effects.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use orchestrion_types::activity::{ActivityExecution, ActivityState, Failure, LoopState};
use orchestrion_types::config::EngineSettings;
use orchestrion_types::definition::{
    ActivityDefinition, ActivityKind, ActivityType, ProcessDefinition, SequenceFlow, VariableMapping,
};
use orchestrion_types::event::EngineEvent;
use orchestrion_types::job::{Job, job_types};
use orchestrion_types::process::{ParentRef, Process, ProcessState};
use orchestrion_types::variables::{self, Variables};
use serde_json::json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::expression::{ExpressionError, ExpressionEvaluator};
use crate::job::retry::RetryPolicy;
use crate::repository::RuntimeChanges;

/// Upper bound on steps per transition; a definition that loops through
/// non-waiting activities forever is cut off here.
const MAX_STEPS: usize = 10_000;

/// Loop counter bound into every multi-instance child scope.
pub const LOOP_COUNTER: &str = "loopCounter";

#[derive(Debug)]
pub(crate) enum Step {
    Enter {
        activity: String,
        scope: Option<Uuid>,
        via_flow: Option<String>,
    },
    Leave(Uuid),
}

/// Cross-process work performed after the lock is released.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    StartChild {
        child_id: Uuid,
        called_element: String,
        version: Option<u32>,
        variables: Variables,
        business_key: Option<String>,
        parent: ParentRef,
        root_process_id: Uuid,
    },
    CancelChild {
        child_id: Uuid,
    },
    ChildCompleted {
        parent: ParentRef,
        child_id: Uuid,
        variables: Variables,
    },
    ChildIncident {
        parent: ParentRef,
        child_id: Uuid,
        reason: String,
    },
    ChildError {
        parent: ParentRef,
        child_id: Uuid,
        error_code: String,
    },
    RecoverChild {
        parent: ParentRef,
        child_id: Uuid,
    },
}

pub(crate) struct Outcome {
    pub changes: RuntimeChanges,
    pub events: Vec<EngineEvent>,
    pub effects: Vec<Effect>,
}

pub(crate) struct Transition<'a> {
    definition: &'a ProcessDefinition,
    settings: &'a EngineSettings,
    backoff: RetryPolicy,
    evaluator: ExpressionEvaluator,
    now: DateTime<Utc>,
    process: Process,
    process_dirty: bool,
    executions: HashMap<Uuid, ActivityExecution>,
    order: Vec<Uuid>,
    dirty: HashSet<Uuid>,
    queue: VecDeque<Step>,
    jobs: Vec<Job>,
    events: Vec<EngineEvent>,
    effects: Vec<Effect>,
}

impl<'a> Transition<'a> {
    pub fn new(
        definition: &'a ProcessDefinition,
        settings: &'a EngineSettings,
        process: Process,
        executions: Vec<ActivityExecution>,
        now: DateTime<Utc>,
    ) -> Self {
        let order = executions.iter().map(|e| e.id).collect();
        let process_dirty = process.revision == 0;
        Self {
            definition,
            settings,
            backoff: RetryPolicy::from(&settings.activity_backoff),
            evaluator: ExpressionEvaluator::new(),
            now,
            process,
            process_dirty,
            executions: executions.into_iter().map(|e| (e.id, e)).collect(),
            order,
            dirty: HashSet::new(),
            queue: VecDeque::new(),
            jobs: Vec::new(),
            events: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn execution(&self, id: Uuid) -> Result<&ActivityExecution, EngineError> {
        self.executions
            .get(&id)
            .ok_or_else(|| EngineError::not_found("activity", id))
    }

    /// Executions in creation order.
    pub fn executions(&self) -> impl Iterator<Item = &ActivityExecution> {
        self.order.iter().filter_map(|id| self.executions.get(id))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Drain the step queue, releasing inclusive joins each time it runs dry.
    pub fn run(&mut self) -> Result<(), EngineError> {
        let mut steps = 0;
        loop {
            while let Some(step) = self.queue.pop_front() {
                steps += 1;
                if steps > MAX_STEPS {
                    return Err(EngineError::execution(format!(
                        "process {} exceeded {MAX_STEPS} steps in one transition",
                        self.process.id
                    )));
                }
                match step {
                    Step::Enter {
                        activity,
                        scope,
                        via_flow,
                    } => self.enter(&activity, scope, via_flow)?,
                    Step::Leave(id) => self.leave(id)?,
                }
            }
            if !self.release_inclusive_joins()? {
                return Ok(());
            }
        }
    }

    pub fn into_outcome(self) -> Outcome {
        let activities = self
            .order
            .iter()
            .filter(|id| self.dirty.contains(id))
            .filter_map(|id| self.executions.get(id).cloned())
            .collect();
        Outcome {
            changes: RuntimeChanges {
                process: self.process_dirty.then_some(self.process),
                activities,
                jobs: self.jobs,
            },
            events: self.events,
            effects: self.effects,
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Move a freshly created process to `Running` and enter its start events.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let starts: Vec<String> = self
            .definition
            .start_activities(None)
            .iter()
            .map(|a| a.id.clone())
            .collect();
        if starts.is_empty() {
            return Err(EngineError::execution(format!(
                "definition {} has no start activity",
                self.definition.label()
            )));
        }
        self.set_process_state(ProcessState::Running)?;
        for activity in starts {
            self.queue.push_back(Step::Enter {
                activity,
                scope: None,
                via_flow: None,
            });
        }
        Ok(())
    }

    /// Complete an active wait state, merging `output` into the process scope.
    pub fn complete_activity(&mut self, id: Uuid, output: &Variables) -> Result<(), EngineError> {
        let exec = self.execution(id)?;
        if exec.state != ActivityState::Active {
            return Err(EngineError::InvalidState(format!(
                "activity {id} is {}, not active",
                exec.state
            )));
        }
        if !output.is_empty() {
            variables::merge(&mut self.process.variables, output);
            self.touch_process();
        }
        self.queue.push_back(Step::Leave(id));
        Ok(())
    }

    /// Record a failed attempt. Returns whether another attempt follows.
    ///
    /// `retries_left` can only shrink the remaining budget; `None` consumes
    /// one attempt.
    pub fn fail_activity(
        &mut self,
        id: Uuid,
        reason: &str,
        trace: Option<String>,
        retries_left: Option<u32>,
        retry_delay: Option<chrono::Duration>,
    ) -> Result<bool, EngineError> {
        let exec = self.execution(id)?;
        if exec.state != ActivityState::Active {
            return Err(EngineError::InvalidState(format!(
                "activity {id} is {}, not active",
                exec.state
            )));
        }
        let current = exec.retries.max(1);
        let remaining = match retries_left {
            None => current - 1,
            Some(n) => n.min(current - 1),
        };
        if remaining == 0 {
            self.fail_terminal(id, reason, trace)?;
            return Ok(false);
        }

        let now = self.now;
        let failure = Failure::new(reason, trace, now);
        let (attempts, activity_type, definition_id) = {
            let exec = self.execution_mut(id)?;
            exec.retries = remaining;
            exec.attempts += 1;
            exec.failure = Some(failure);
            exec.lock = None;
            exec.updated_at = now;
            (exec.attempts, exec.activity_type, exec.definition_id.clone())
        };
        self.events.push(EngineEvent::ActivityFailed {
            process_id: self.process.id,
            activity_id: id,
            definition_id: definition_id.clone(),
            reason: reason.to_string(),
            will_retry: true,
        });
        tracing::debug!(process_id = %self.process.id, activity = %definition_id, attempts, remaining, "activity will retry");

        match activity_type {
            ActivityType::ServiceTask => {
                let run_at = now + self.backoff.chrono_delay(attempts);
                self.schedule_service_job(id, run_at)?;
            }
            ActivityType::ExternalTask => {
                self.execution_mut(id)?.available_at = retry_delay.map(|d| now + d);
            }
            _ => {}
        }
        self.arm_timeout(id)?;
        Ok(true)
    }

    /// Cancel or terminate the whole process. A terminal process is left
    /// alone.
    pub fn cancel_process(&mut self, target: ProcessState) -> Result<(), EngineError> {
        if self.process.is_terminal() {
            return Ok(());
        }
        let open: Vec<Uuid> = self.open_executions(|_| true);
        for id in open {
            self.cancel_one(id)?;
        }
        self.queue.clear();
        self.set_process_state(target)
    }

    /// Re-activate every failed execution of a process in `Incident`.
    pub fn recover(&mut self) -> Result<(), EngineError> {
        if self.process.state != ProcessState::Incident {
            return Err(EngineError::InvalidState(format!(
                "process {} is {}, not in incident",
                self.process.id, self.process.state
            )));
        }
        let failed: Vec<Uuid> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.executions.get(id).is_some_and(|e| e.state == ActivityState::Failed))
            .collect();
        self.set_process_state(ProcessState::Running)?;
        for id in failed {
            self.reactivate(id)?;
        }
        Ok(())
    }

    pub fn set_variables(&mut self, vars: &Variables) -> Result<(), EngineError> {
        if self.process.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "process {} is {}",
                self.process.id, self.process.state
            )));
        }
        variables::merge(&mut self.process.variables, vars);
        self.touch_process();
        Ok(())
    }

    pub fn set_suspended(&mut self, suspended: bool) -> Result<(), EngineError> {
        if self.process.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "process {} is {}",
                self.process.id, self.process.state
            )));
        }
        if self.process.suspended == suspended {
            return Ok(());
        }
        self.process.suspended = suspended;
        self.touch_process();
        let process_id = self.process.id;
        self.events.push(if suspended {
            EngineEvent::ProcessSuspended { process_id }
        } else {
            EngineEvent::ProcessResumed { process_id }
        });
        Ok(())
    }

    /// Complete the oldest active receive task waiting for `message`.
    pub fn correlate_message(&mut self, message: &str, output: &Variables) -> Result<Uuid, EngineError> {
        let definition = self.definition;
        let target = self.order.iter().copied().find(|id| {
            self.executions.get(id).is_some_and(|e| {
                e.state == ActivityState::Active
                    && e.activity_type == ActivityType::ReceiveTask
                    && definition.activity(&e.definition_id).is_some_and(|a| {
                        matches!(&a.kind, ActivityKind::ReceiveTask { message: m } if m == message)
                    })
            })
        });
        let id = target.ok_or_else(|| {
            EngineError::not_found("message subscription", format!("{}:{message}", self.process.id))
        })?;
        self.complete_activity(id, output)?;
        Ok(id)
    }

    /// A called process finished; map its variables back and move on.
    pub fn child_completed(&mut self, activity_id: Uuid, child_id: Uuid, child_vars: &Variables) -> Result<(), EngineError> {
        if !self.waits_on_child(activity_id, child_id) {
            tracing::debug!(process_id = %self.process.id, %activity_id, %child_id, "stale child completion ignored");
            return Ok(());
        }
        let act = self.activity_def(&self.execution(activity_id)?.definition_id)?;
        let outputs = match &act.kind {
            ActivityKind::CallActivity { outputs, .. } => outputs.as_deref(),
            _ => None,
        };
        let mapped = match outputs {
            None => child_vars.clone(),
            Some(maps) => match self.map_variables(maps, child_vars) {
                Ok(mapped) => mapped,
                Err(e) => return self.fail_terminal(activity_id, &e.to_string(), None),
            },
        };
        self.complete_activity(activity_id, &mapped)
    }

    /// A called process ended with an error nothing inside it caught; throw
    /// it again from the call activity.
    pub fn child_error(&mut self, activity_id: Uuid, child_id: Uuid, error_code: &str) -> Result<(), EngineError> {
        if !self.waits_on_child(activity_id, child_id) {
            return Ok(());
        }
        self.throw_error(activity_id, error_code)
    }

    /// A called process raised an incident; fail the call activity for good.
    pub fn child_incident(&mut self, activity_id: Uuid, child_id: Uuid, reason: &str) -> Result<(), EngineError> {
        if !self.waits_on_child(activity_id, child_id) {
            return Ok(());
        }
        self.fail_terminal(activity_id, reason, None)
    }

    /// Start a fresh child for an active call activity whose child is gone.
    pub fn restart_call(&mut self, activity_id: Uuid) -> Result<(), EngineError> {
        if self.execution(activity_id)?.state != ActivityState::Active {
            return Ok(());
        }
        self.start_call(activity_id)
    }

    /// Fail an active execution without retry and raise an incident.
    pub fn fail_terminal(&mut self, id: Uuid, reason: &str, trace: Option<String>) -> Result<(), EngineError> {
        let now = self.now;
        let definition_id = {
            let exec = self.execution_mut(id)?;
            exec.attempts += 1;
            exec.failure = Some(Failure::new(reason, trace, now));
            exec.transition(ActivityState::Failed, now)?;
            exec.definition_id.clone()
        };
        self.events.push(EngineEvent::ActivityFailed {
            process_id: self.process.id,
            activity_id: id,
            definition_id: definition_id.clone(),
            reason: reason.to_string(),
            will_retry: false,
        });
        self.raise_incident(id, &definition_id, reason)
    }

    /// Throw `error_code` from the active execution `id`.
    ///
    /// The innermost activity around `id` (itself included) with a matching
    /// error boundary event is cancelled along with everything inside it,
    /// and the boundary event is entered in its place. An error nothing
    /// catches ends a called process and is thrown again from the caller's
    /// call activity; at the root it raises an incident on `id`.
    pub fn throw_error(&mut self, id: Uuid, error_code: &str) -> Result<(), EngineError> {
        let exec = self.execution(id)?;
        if exec.state != ActivityState::Active {
            return Err(EngineError::InvalidState(format!(
                "activity {id} is {}, not active",
                exec.state
            )));
        }
        let definition = self.definition;
        let mut catch = None;
        let mut current = Some(id);
        while let Some(candidate) = current {
            let exec = self.execution(candidate)?;
            // Boundaries of a multi-instance activity belong to its root.
            if exec.loop_index.is_none() {
                if let Some(boundary) = definition.error_catcher(&exec.definition_id, error_code) {
                    catch = Some((candidate, boundary));
                    break;
                }
            }
            current = exec.parent_id;
        }

        self.events.push(EngineEvent::ErrorThrown {
            process_id: self.process.id,
            activity_id: id,
            error_code: error_code.to_string(),
            caught_by: catch.map(|(_, boundary)| boundary.id.clone()),
        });
        let Some((catcher, boundary)) = catch else {
            return self.error_escaped(id, error_code);
        };
        tracing::info!(process_id = %self.process.id, error_code, boundary = %boundary.id, "error caught");

        if self.execution(id)?.activity_type == ActivityType::ErrorEndEvent {
            self.transition_execution(id, ActivityState::Completed)?;
        }
        let scope = self.execution(catcher)?.parent_id;
        self.cancel_tree(catcher)?;
        self.queue.push_back(Step::Enter {
            activity: boundary.id.clone(),
            scope,
            via_flow: None,
        });
        Ok(())
    }

    /// Fail an active execution whose deadline has passed. Returns whether
    /// it timed out.
    pub fn time_out(&mut self, id: Uuid) -> Result<bool, EngineError> {
        if self.process.is_terminal() || self.process.suspended {
            return Ok(false);
        }
        let exec = self.execution(id)?;
        let expired = exec.state == ActivityState::Active && exec.timeout_at.is_some_and(|at| at <= self.now);
        if !expired {
            return Ok(false);
        }
        tracing::info!(process_id = %self.process.id, activity = %exec.definition_id, "activity timed out");
        self.fail_activity(id, "activity timed out", None, None, None)?;
        Ok(true)
    }

    /// Fails with [`EngineError::Lock`] unless `worker_id` holds a valid lock
    /// on the active task `id`.
    pub fn ensure_locked(&self, id: Uuid, worker_id: &str) -> Result<(), EngineError> {
        let exec = self.execution(id)?;
        let held = exec.state == ActivityState::Active
            && exec.lock.as_ref().is_some_and(|l| l.is_held_by(worker_id, self.now));
        if held {
            Ok(())
        } else {
            Err(EngineError::Lock(format!("task {id} is not locked by {worker_id}")))
        }
    }

    /// Move the lock expiry of a task `worker_id` still holds.
    pub fn extend_lock(&mut self, id: Uuid, worker_id: &str, until: DateTime<Utc>) -> Result<(), EngineError> {
        let now = self.now;
        let exec = self.execution_mut(id)?;
        match exec.lock.as_mut() {
            Some(lock) if exec.state == ActivityState::Active && lock.is_held_by(worker_id, now) => {
                lock.expires_at = until;
                exec.updated_at = now;
                Ok(())
            }
            _ => Err(EngineError::Lock(format!("task {id} is not locked by {worker_id}"))),
        }
    }

    /// Rewrite execution definition references and pin the process to
    /// `target`. Callers have already validated every mapping.
    pub fn migrate(&mut self, target: &ProcessDefinition, mapping: &HashMap<Uuid, String>) {
        for (id, to) in mapping {
            if let Some(exec) = self.executions.get_mut(id) {
                if &exec.definition_id != to {
                    exec.definition_id = to.clone();
                    exec.updated_at = self.now;
                    self.dirty.insert(*id);
                }
            }
        }
        let from_version = self.process.definition_version;
        self.process.definition_id = target.id;
        self.process.definition_version = target.version;
        self.touch_process();
        self.events.push(EngineEvent::ProcessMigrated {
            process_id: self.process.id,
            from_version,
            to_version: target.version,
        });
    }

    // -----------------------------------------------------------------------
    // Entering activities
    // -----------------------------------------------------------------------

    fn enter(&mut self, activity_id: &str, scope: Option<Uuid>, via_flow: Option<String>) -> Result<(), EngineError> {
        if self.process.is_terminal() {
            return Ok(());
        }
        if let Some(scope_id) = scope {
            if self.execution(scope_id)?.state != ActivityState::Active {
                return Ok(());
            }
        }
        let act = self.activity_def(activity_id)?;
        tracing::debug!(process_id = %self.process.id, activity = %act.id, "entering activity");

        let is_gateway = matches!(act.kind, ActivityKind::ParallelGateway | ActivityKind::InclusiveGateway { .. });
        if is_gateway && self.definition.incoming(&act.id).count() > 1 {
            return self.arrive_at_join(act, scope, via_flow);
        }

        let id = self.create_execution(act, scope);
        if act.multi_instance.is_some() {
            self.transition_execution(id, ActivityState::Active)?;
            self.expand(id)
        } else {
            self.activate(id)
        }
    }

    fn arrive_at_join(
        &mut self,
        act: &'a ActivityDefinition,
        scope: Option<Uuid>,
        via_flow: Option<String>,
    ) -> Result<(), EngineError> {
        let waiting = self.order.iter().copied().find(|id| {
            self.executions.get(id).is_some_and(|e| {
                e.definition_id == act.id && e.parent_id == scope && e.state == ActivityState::Active
            })
        });
        let id = match waiting {
            Some(id) => id,
            None => {
                let id = self.create_execution(act, scope);
                self.transition_execution(id, ActivityState::Active)?;
                id
            }
        };

        let definition = self.definition;
        let exec = self.execution_mut(id)?;
        if let Some(flow) = via_flow {
            if !exec.joined_flows.insert(flow.clone()) {
                tracing::debug!(activity = %act.id, %flow, "redundant arrival at join ignored");
                return Ok(());
            }
        }
        let joined = definition
            .incoming(&act.id)
            .all(|f| exec.joined_flows.contains(&f.id));
        // An inclusive join that is still short of flows waits for
        // `release_inclusive_joins`.
        if joined {
            self.queue.push_back(Step::Leave(id));
        }
        Ok(())
    }

    /// Release every waiting inclusive join that no open execution of its
    /// scope can still reach. Returns whether any was released.
    fn release_inclusive_joins(&mut self) -> Result<bool, EngineError> {
        if self.process.is_terminal() {
            return Ok(false);
        }
        let waiting = self.open_executions(|e| {
            e.activity_type == ActivityType::InclusiveGateway
                && e.state == ActivityState::Active
                && !e.joined_flows.is_empty()
        });
        let mut released = false;
        for id in waiting {
            let (join, scope) = {
                let exec = self.execution(id)?;
                (exec.definition_id.clone(), exec.parent_id)
            };
            let blocked = self
                .open_executions(|e| e.id != id && e.parent_id == scope)
                .into_iter()
                .filter_map(|other| self.executions.get(&other))
                .any(|e| self.reaches(&e.definition_id, &join));
            if !blocked {
                tracing::debug!(process_id = %self.process.id, activity = %join, "inclusive join released");
                self.queue.push_back(Step::Leave(id));
                released = true;
            }
        }
        Ok(released)
    }

    /// Whether a token at `from` can still arrive at `to`, following
    /// sequence flows and error boundary events.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let definition = self.definition;
        let mut seen = HashSet::new();
        let mut frontier = vec![from];
        while let Some(current) = frontier.pop() {
            if !seen.insert(current) {
                continue;
            }
            let next = definition
                .outgoing(current)
                .map(|f| f.target.as_str())
                .chain(definition.error_boundaries(current).map(|b| b.id.as_str()));
            for target in next {
                if target == to {
                    return true;
                }
                frontier.push(target);
            }
        }
        false
    }

    /// Move a `Created` execution to `Active` and run its behaviour.
    fn activate(&mut self, id: Uuid) -> Result<(), EngineError> {
        self.transition_execution(id, ActivityState::Active)?;
        self.arm_timeout(id)?;
        self.run_behaviour(id)
    }

    fn run_behaviour(&mut self, id: Uuid) -> Result<(), EngineError> {
        let act = self.activity_def(&self.execution(id)?.definition_id)?;
        match &act.kind {
            ActivityKind::StartEvent
            | ActivityKind::EndEvent
            | ActivityKind::ErrorBoundaryEvent { .. }
            | ActivityKind::Task
            | ActivityKind::ExclusiveGateway { .. }
            | ActivityKind::ParallelGateway
            | ActivityKind::InclusiveGateway { .. } => {
                self.queue.push_back(Step::Leave(id));
                Ok(())
            }
            ActivityKind::TerminateEndEvent => self.terminate_from(id),
            ActivityKind::ErrorEndEvent { error_code } => self.throw_error(id, error_code),
            ActivityKind::ServiceTask { .. } => self.schedule_service_job(id, self.now),
            ActivityKind::ExternalTask { topic } => {
                self.execution_mut(id)?.topic = Some(topic.clone());
                Ok(())
            }
            ActivityKind::ReceiveTask { .. } => Ok(()),
            ActivityKind::CallActivity { .. } => self.start_call(id),
            ActivityKind::SubProcess => {
                let starts: Vec<String> = self
                    .definition
                    .start_activities(Some(&act.id))
                    .iter()
                    .map(|a| a.id.clone())
                    .collect();
                if starts.is_empty() {
                    let reason = format!("sub-process '{}' has no start event", act.id);
                    return self.fail_terminal(id, &reason, None);
                }
                for activity in starts {
                    self.queue.push_back(Step::Enter {
                        activity,
                        scope: Some(id),
                        via_flow: None,
                    });
                }
                Ok(())
            }
        }
    }

    fn start_call(&mut self, id: Uuid) -> Result<(), EngineError> {
        let act = self.activity_def(&self.execution(id)?.definition_id)?;
        let ActivityKind::CallActivity {
            called_element,
            version,
            inputs,
            ..
        } = &act.kind
        else {
            return Err(EngineError::Definition(format!("activity '{}' is not a call activity", act.id)));
        };

        let scope = self.visible_variables(Some(id));
        let variables = match inputs {
            None => scope,
            Some(maps) => match self.map_variables(maps, &scope) {
                Ok(mapped) => mapped,
                Err(e) => return self.fail_terminal(id, &e.to_string(), None),
            },
        };

        let child_id = Uuid::now_v7();
        self.execution_mut(id)?.child_process_id = Some(child_id);
        self.effects.push(Effect::StartChild {
            child_id,
            called_element: called_element.clone(),
            version: *version,
            variables,
            business_key: self.process.business_key.clone(),
            parent: ParentRef {
                process_id: self.process.id,
                activity_id: id,
            },
            root_process_id: self.process.root_process_id,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Multi-instance
    // -----------------------------------------------------------------------

    /// Snapshot the collection of an active multi-instance root and spawn
    /// its first instance(s).
    fn expand(&mut self, root_id: Uuid) -> Result<(), EngineError> {
        let act = self.activity_def(&self.execution(root_id)?.definition_id)?;
        let Some(mi) = act.multi_instance.as_ref() else {
            return Err(EngineError::Definition(format!("activity '{}' is not multi-instance", act.id)));
        };
        let scope = self.visible_variables(Some(root_id));
        let elements = match self.evaluator.evaluate_array(&mi.collection, &scope) {
            Ok(elements) => elements,
            Err(e) => return self.fail_terminal(root_id, &e.to_string(), None),
        };
        let total = elements.len();
        self.execution_mut(root_id)?.loop_state = Some(LoopState {
            elements,
            next_index: 0,
            completed: 0,
            sequential: mi.sequential,
        });
        tracing::debug!(process_id = %self.process.id, activity = %act.id, total, sequential = mi.sequential, "multi-instance expanded");

        if total == 0 {
            self.queue.push_back(Step::Leave(root_id));
            return Ok(());
        }
        let initial = if mi.sequential { 1 } else { total };
        for _ in 0..initial {
            self.spawn_instance(root_id)?;
        }
        Ok(())
    }

    fn spawn_instance(&mut self, root_id: Uuid) -> Result<(), EngineError> {
        let root = self.execution(root_id)?;
        let act = self.activity_def(&root.definition_id)?;
        let (index, element) = root
            .loop_state
            .as_ref()
            .and_then(|ls| ls.elements.get(ls.next_index as usize).map(|e| (ls.next_index, e.clone())))
            .ok_or_else(|| EngineError::InvalidState(format!("multi-instance {root_id} has no element left")))?;
        let element_variable = act
            .multi_instance
            .as_ref()
            .map(|mi| mi.element_variable.clone())
            .unwrap_or_default();

        if let Some(ls) = self.execution_mut(root_id)?.loop_state.as_mut() {
            ls.next_index += 1;
        }

        let child = self.create_execution(act, Some(root_id));
        {
            let exec = self.execution_mut(child)?;
            exec.loop_index = Some(index);
            exec.variables.insert(element_variable, element);
            exec.variables.insert(LOOP_COUNTER.to_string(), json!(index));
        }
        self.activate(child)
    }

    fn instance_finished(&mut self, root_id: Uuid) -> Result<(), EngineError> {
        let root = self.execution(root_id)?;
        if root.state != ActivityState::Active {
            return Ok(());
        }
        let act = self.activity_def(&root.definition_id)?;
        let Some(mi) = act.multi_instance.as_ref() else {
            return Err(EngineError::Definition(format!("activity '{}' is not multi-instance", act.id)));
        };
        let (total, next_index) = root
            .loop_state
            .as_ref()
            .map(|ls| (ls.total(), ls.next_index))
            .unwrap_or((0, 0));

        let children = self.children_of(root_id);
        let completed = children
            .iter()
            .filter(|id| self.executions.get(id).is_some_and(|e| e.state == ActivityState::Completed))
            .count() as u32;
        let open: Vec<Uuid> = children
            .iter()
            .copied()
            .filter(|id| self.executions.get(id).is_some_and(|e| e.is_open()))
            .collect();
        if let Some(ls) = self.execution_mut(root_id)?.loop_state.as_mut() {
            ls.completed = completed;
        }

        if let Some(condition) = &mi.completion_condition {
            let mut scope = self.visible_variables(Some(root_id));
            scope.insert("nrOfInstances".to_string(), json!(total));
            scope.insert("nrOfCompletedInstances".to_string(), json!(completed));
            scope.insert("nrOfActiveInstances".to_string(), json!(open.len()));
            match self.evaluator.evaluate_bool(condition, &scope) {
                Ok(true) => {
                    for child in open {
                        self.cancel_tree(child)?;
                    }
                    self.queue.push_back(Step::Leave(root_id));
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => return self.fail_terminal(root_id, &e.to_string(), None),
            }
        }

        if !open.is_empty() {
            return Ok(());
        }
        if next_index < total {
            self.spawn_instance(root_id)
        } else {
            self.queue.push_back(Step::Leave(root_id));
            Ok(())
        }
    }

    // -----------------------------------------------------------------------
    // Leaving activities
    // -----------------------------------------------------------------------

    fn leave(&mut self, id: Uuid) -> Result<(), EngineError> {
        let exec = self.execution(id)?;
        if exec.state != ActivityState::Active || self.process.is_terminal() {
            return Ok(());
        }
        let parent = exec.parent_id;

        if exec.loop_index.is_some() {
            self.transition_execution(id, ActivityState::Completed)?;
            let Some(root_id) = parent else {
                return Err(EngineError::InvalidState(format!("instance {id} has no multi-instance root")));
            };
            return self.instance_finished(root_id);
        }

        let act = self.activity_def(&exec.definition_id)?;
        let flows = match self.select_flows(act, id) {
            Ok(flows) => flows,
            Err(e) => {
                tracing::warn!(process_id = %self.process.id, activity = %act.id, error = %e, "flow selection failed");
                return self.fail_terminal(id, &e.to_string(), None);
            }
        };
        self.transition_execution(id, ActivityState::Completed)?;

        if flows.is_empty() {
            return self.check_scope(parent);
        }
        for flow in flows {
            self.queue.push_back(Step::Enter {
                activity: flow.target.clone(),
                scope: parent,
                via_flow: Some(flow.id.clone()),
            });
        }
        Ok(())
    }

    fn select_flows(&self, act: &'a ActivityDefinition, id: Uuid) -> Result<Vec<&'a SequenceFlow>, EngineError> {
        let definition = self.definition;
        let outgoing: Vec<&'a SequenceFlow> = definition.outgoing(&act.id).collect();
        if outgoing.is_empty() {
            return Ok(outgoing);
        }
        let scope = self.visible_variables(Some(id));

        match &act.kind {
            ActivityKind::ExclusiveGateway { default_flow } => {
                for flow in &outgoing {
                    if default_flow.as_deref() == Some(flow.id.as_str()) {
                        continue;
                    }
                    let condition = flow.condition.as_deref().ok_or_else(|| {
                        EngineError::Definition(format!(
                            "flow '{}' leaving gateway '{}' has no condition",
                            flow.id, act.id
                        ))
                    })?;
                    if self.evaluator.evaluate_bool(condition, &scope)? {
                        return Ok(vec![*flow]);
                    }
                }
                default_flow_of(act, &outgoing, default_flow.as_deref())
            }
            ActivityKind::InclusiveGateway { default_flow } => {
                let mut taken = Vec::new();
                for flow in &outgoing {
                    if default_flow.as_deref() == Some(flow.id.as_str()) {
                        continue;
                    }
                    let take = match flow.condition.as_deref() {
                        None => true,
                        Some(condition) => self.evaluator.evaluate_bool(condition, &scope)?,
                    };
                    if take {
                        taken.push(*flow);
                    }
                }
                if taken.is_empty() {
                    return default_flow_of(act, &outgoing, default_flow.as_deref());
                }
                Ok(taken)
            }
            ActivityKind::ParallelGateway => Ok(outgoing),
            _ => {
                let mut taken = Vec::with_capacity(outgoing.len());
                for flow in outgoing {
                    let take = match flow.condition.as_deref() {
                        None => true,
                        Some(condition) => self.evaluator.evaluate_bool(condition, &scope)?,
                    };
                    if take {
                        taken.push(flow);
                    }
                }
                Ok(taken)
            }
        }
    }

    /// Complete `scope` once nothing inside it is open or about to enter.
    fn check_scope(&mut self, scope: Option<Uuid>) -> Result<(), EngineError> {
        let open = self
            .executions
            .values()
            .any(|e| e.parent_id == scope && e.is_open());
        let pending = self
            .queue
            .iter()
            .any(|step| matches!(step, Step::Enter { scope: s, .. } if *s == scope));
        if open || pending {
            return Ok(());
        }
        match scope {
            None => self.complete_process(),
            Some(id) => {
                let exec = self.execution(id)?;
                if exec.state == ActivityState::Active && exec.activity_type == ActivityType::SubProcess {
                    self.queue.push_back(Step::Leave(id));
                }
                Ok(())
            }
        }
    }

    fn complete_process(&mut self) -> Result<(), EngineError> {
        if self.process.state != ProcessState::Running {
            return Ok(());
        }
        self.set_process_state(ProcessState::Completed)?;
        self.notify_parent();
        Ok(())
    }

    fn terminate_from(&mut self, id: Uuid) -> Result<(), EngineError> {
        let scope = self.execution(id)?.parent_id;
        self.transition_execution(id, ActivityState::Completed)?;
        match scope {
            None => {
                let open = self.open_executions(|_| true);
                for exec in open {
                    self.cancel_one(exec)?;
                }
                self.queue.clear();
                self.set_process_state(ProcessState::Terminated)?;
                self.notify_parent();
                Ok(())
            }
            Some(scope_id) => {
                let inside: HashSet<Uuid> = self.descendants(scope_id).into_iter().collect();
                for exec in self.order.clone() {
                    if inside.contains(&exec) && self.executions.get(&exec).is_some_and(|e| e.is_open()) {
                        self.cancel_one(exec)?;
                    }
                }
                self.queue.retain(|step| match step {
                    Step::Enter { scope: Some(s), .. } => *s != scope_id && !inside.contains(s),
                    _ => true,
                });
                self.queue.push_back(Step::Leave(scope_id));
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Failure, recovery, cancellation
    // -----------------------------------------------------------------------

    fn error_escaped(&mut self, id: Uuid, error_code: &str) -> Result<(), EngineError> {
        let Some(parent) = self.process.parent else {
            // Recovering a call activity starts a fresh child.
            let exec = self.execution_mut(id)?;
            if exec.activity_type == ActivityType::CallActivity {
                exec.child_process_id = None;
            }
            return self.fail_terminal(id, &format!("unhandled error '{error_code}'"), None);
        };
        tracing::info!(process_id = %self.process.id, error_code, caller = %parent.process_id, "error passed to calling process");
        for exec in self.open_executions(|_| true) {
            self.cancel_one(exec)?;
        }
        self.queue.clear();
        self.set_process_state(ProcessState::Terminated)?;
        self.effects.push(Effect::ChildError {
            parent,
            child_id: self.process.id,
            error_code: error_code.to_string(),
        });
        Ok(())
    }

    fn raise_incident(&mut self, id: Uuid, definition_id: &str, reason: &str) -> Result<(), EngineError> {
        if self.process.state != ProcessState::Running {
            return Ok(());
        }
        self.set_process_state(ProcessState::Incident)?;
        tracing::warn!(process_id = %self.process.id, activity = %definition_id, reason, "process incident raised");
        self.events.push(EngineEvent::ProcessIncident {
            process_id: self.process.id,
            activity_id: id,
            activity_definition_id: definition_id.to_string(),
            reason: reason.to_string(),
        });
        if let Some(parent) = self.process.parent {
            self.effects.push(Effect::ChildIncident {
                parent,
                child_id: self.process.id,
                reason: format!("called process {} raised an incident: {reason}", self.process.id),
            });
        }
        Ok(())
    }

    fn reactivate(&mut self, id: Uuid) -> Result<(), EngineError> {
        let act = self.activity_def(&self.execution(id)?.definition_id)?;
        let retries = act.retries.unwrap_or(self.settings.activity_max_attempts).max(1);
        {
            let exec = self.execution_mut(id)?;
            exec.retries = retries;
            exec.failure = None;
            exec.available_at = None;
        }
        self.transition_execution(id, ActivityState::Active)?;
        self.arm_timeout(id)?;

        let exec = self.execution(id)?;
        let is_root = act.multi_instance.is_some() && exec.loop_index.is_none();
        if is_root {
            return if exec.loop_state.is_none() {
                self.expand(id)
            } else {
                self.instance_finished(id)
            };
        }
        if let (ActivityKind::CallActivity { .. }, Some(child_id)) = (&act.kind, exec.child_process_id) {
            self.effects.push(Effect::RecoverChild {
                parent: ParentRef {
                    process_id: self.process.id,
                    activity_id: id,
                },
                child_id,
            });
            return Ok(());
        }
        self.run_behaviour(id)
    }

    /// Cancel an open execution and everything nested in it.
    fn cancel_tree(&mut self, id: Uuid) -> Result<(), EngineError> {
        for exec in self.descendants(id) {
            if self.executions.get(&exec).is_some_and(|e| e.is_open()) {
                self.cancel_one(exec)?;
            }
        }
        self.cancel_one(id)
    }

    fn cancel_one(&mut self, id: Uuid) -> Result<(), EngineError> {
        let exec = self.execution(id)?;
        if !exec.is_open() {
            return Ok(());
        }
        let child = (exec.activity_type == ActivityType::CallActivity)
            .then_some(exec.child_process_id)
            .flatten();
        self.transition_execution(id, ActivityState::Cancelled)?;
        if let Some(child_id) = child {
            self.effects.push(Effect::CancelChild { child_id });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn notify_parent(&mut self) {
        if let Some(parent) = self.process.parent {
            self.effects.push(Effect::ChildCompleted {
                parent,
                child_id: self.process.id,
                variables: self.process.variables.clone(),
            });
        }
    }

    fn waits_on_child(&self, activity_id: Uuid, child_id: Uuid) -> bool {
        self.executions.get(&activity_id).is_some_and(|e| {
            e.state == ActivityState::Active && e.child_process_id == Some(child_id)
        })
    }

    fn schedule_service_job(&mut self, id: Uuid, run_at: DateTime<Utc>) -> Result<(), EngineError> {
        let input = variables::from_value(json!({
            "activity_id": id,
            "process_id": self.process.id,
        }));
        let job = Job::new(job_types::ACTIVITY, input, 1, Some(self.process.id), run_at, self.now);
        self.execution_mut(id)?.pending_job_id = Some(job.id);
        self.jobs.push(job);
        Ok(())
    }

    fn arm_timeout(&mut self, id: Uuid) -> Result<(), EngineError> {
        let act = self.activity_def(&self.execution(id)?.definition_id)?;
        let waits = matches!(
            act.activity_type(),
            ActivityType::ServiceTask | ActivityType::ExternalTask | ActivityType::ReceiveTask
        );
        if let (true, Some(secs)) = (waits, act.timeout_secs) {
            let deadline = self.now + chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64);
            self.execution_mut(id)?.timeout_at = Some(deadline);
        }
        Ok(())
    }

    fn map_variables(&self, maps: &[VariableMapping], scope: &Variables) -> Result<Variables, ExpressionError> {
        let mut mapped = Variables::new();
        for mapping in maps {
            let value = self.evaluator.evaluate_value(&mapping.source, scope)?;
            mapped.insert(mapping.target.clone(), value);
        }
        Ok(mapped)
    }

    fn visible_variables(&self, id: Option<Uuid>) -> Variables {
        visible_variables(&self.process, &self.executions, id)
    }

    fn activity_def(&self, id: &str) -> Result<&'a ActivityDefinition, EngineError> {
        let definition = self.definition;
        definition.activity(id).ok_or_else(|| {
            EngineError::Definition(format!("activity '{id}' not in definition {}", definition.label()))
        })
    }

    fn create_execution(&mut self, act: &ActivityDefinition, scope: Option<Uuid>) -> Uuid {
        let retries = act.retries.unwrap_or(self.settings.activity_max_attempts).max(1);
        let exec = ActivityExecution::new(
            self.process.id,
            act.id.clone(),
            act.activity_type(),
            scope,
            retries,
            self.now,
        );
        let id = exec.id;
        self.order.push(id);
        self.dirty.insert(id);
        self.executions.insert(id, exec);
        id
    }

    fn execution_mut(&mut self, id: Uuid) -> Result<&mut ActivityExecution, EngineError> {
        let exec = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| EngineError::not_found("activity", id))?;
        self.dirty.insert(id);
        Ok(exec)
    }

    fn transition_execution(&mut self, id: Uuid, next: ActivityState) -> Result<(), EngineError> {
        let now = self.now;
        let process_id = self.process.id;
        let exec = self.execution_mut(id)?;
        exec.transition(next, now)?;
        let definition_id = exec.definition_id.clone();
        let event = match next {
            ActivityState::Active => Some(EngineEvent::ActivityActivated {
                process_id,
                activity_id: id,
                definition_id,
                activity_type: exec.activity_type,
            }),
            ActivityState::Completed => Some(EngineEvent::ActivityCompleted {
                process_id,
                activity_id: id,
                definition_id,
            }),
            ActivityState::Cancelled => Some(EngineEvent::ActivityCancelled {
                process_id,
                activity_id: id,
                definition_id,
            }),
            ActivityState::Created | ActivityState::Failed => None,
        };
        self.events.extend(event);
        Ok(())
    }

    fn set_process_state(&mut self, next: ProcessState) -> Result<(), EngineError> {
        let previous = self.process.state;
        self.process.transition(next, self.now)?;
        self.touch_process();
        let process_id = self.process.id;
        let event = match next {
            ProcessState::Running if previous == ProcessState::Created => Some(EngineEvent::ProcessStarted {
                process_id,
                definition_key: self.process.definition_key.clone(),
                definition_version: self.process.definition_version,
                business_key: self.process.business_key.clone(),
                parent_process_id: self.process.parent.map(|p| p.process_id),
            }),
            ProcessState::Running => Some(EngineEvent::ProcessRecovered { process_id }),
            ProcessState::Completed => Some(EngineEvent::ProcessCompleted { process_id }),
            ProcessState::Cancelled => Some(EngineEvent::ProcessCancelled { process_id }),
            ProcessState::Terminated => Some(EngineEvent::ProcessTerminated { process_id }),
            ProcessState::Created | ProcessState::Incident => None,
        };
        if next.is_terminal() {
            tracing::info!(%process_id, state = %next, "process finished");
        }
        self.events.extend(event);
        Ok(())
    }

    fn touch_process(&mut self) {
        self.process.updated_at = self.now;
        self.process_dirty = true;
    }

    fn open_executions(&self, filter: impl Fn(&ActivityExecution) -> bool) -> Vec<Uuid> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.executions.get(id).is_some_and(|e| e.is_open() && filter(e)))
            .collect()
    }

    fn children_of(&self, parent: Uuid) -> Vec<Uuid> {
        self.order
            .iter()
            .copied()
            .filter(|id| self.executions.get(id).is_some_and(|e| e.parent_id == Some(parent)))
            .collect()
    }

    /// Every execution nested below `id`, breadth first.
    fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut found = Vec::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for child in self.children_of(current) {
                found.push(child);
                frontier.push(child);
            }
        }
        found
    }
}

fn default_flow_of<'a>(
    act: &ActivityDefinition,
    outgoing: &[&'a SequenceFlow],
    default_flow: Option<&str>,
) -> Result<Vec<&'a SequenceFlow>, EngineError> {
    match default_flow {
        Some(default_id) => outgoing
            .iter()
            .find(|f| f.id == default_id)
            .map(|f| vec![*f])
            .ok_or_else(|| {
                EngineError::Definition(format!(
                    "default flow '{default_id}' does not leave gateway '{}'",
                    act.id
                ))
            }),
        None => Err(EngineError::NoMatchingFlow {
            gateway: act.id.clone(),
        }),
    }
}

/// Process scope overlaid by the local scopes of `id` and its ancestors,
/// innermost last.
pub(crate) fn visible_variables(
    process: &Process,
    executions: &HashMap<Uuid, ActivityExecution>,
    id: Option<Uuid>,
) -> Variables {
    let mut chain = Vec::new();
    let mut current = id;
    while let Some(exec) = current.and_then(|c| executions.get(&c)) {
        chain.push(exec);
        current = exec.parent_id;
        if chain.len() > executions.len() {
            break;
        }
    }
    let mut scope = process.variables.clone();
    for exec in chain.iter().rev() {
        variables::merge(&mut scope, &exec.variables);
    }
    scope
}
