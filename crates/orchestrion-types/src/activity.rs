//! Activity execution types and the activity lifecycle table.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::definition::ActivityType;
use crate::error::{ParseEnumError, TransitionError};
use crate::variables::Variables;

// ---------------------------------------------------------------------------
// ActivityState
// ---------------------------------------------------------------------------

/// Lifecycle state of an activity execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Created,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ActivityState {
    /// Executions that still hold their scope open.
    ///
    /// `Failed` counts as open: it blocks completion until recovered or
    /// cancelled.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Created | Self::Active | Self::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: ActivityState) -> bool {
        use ActivityState::*;
        matches!(
            (self, next),
            (Created, Active)
                | (Created, Cancelled)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Cancelled)
                | (Failed, Active)
                | (Failed, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ParseEnumError {
                kind: "activity state",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Supporting records
// ---------------------------------------------------------------------------

/// Last recorded failure of an activity or job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl Failure {
    pub fn new(reason: impl Into<String>, trace: Option<String>, failed_at: DateTime<Utc>) -> Self {
        Self {
            reason: reason.into(),
            trace,
            failed_at,
        }
    }
}

/// External-task lock held by a worker until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskLock {
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

impl TaskLock {
    pub fn is_held_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.worker_id == worker_id && self.expires_at > now
    }
}

/// Progress of a multi-instance parent (the loop token).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopState {
    /// Collection snapshot taken when the activity was entered.
    pub elements: Vec<Value>,
    /// Index of the next child to spawn.
    pub next_index: u32,
    /// Children that reached `Completed`.
    pub completed: u32,
    pub sequential: bool,
}

impl LoopState {
    pub fn total(&self) -> u32 {
        self.elements.len() as u32
    }
}

// ---------------------------------------------------------------------------
// ActivityExecution
// ---------------------------------------------------------------------------

/// Runtime instance of an activity, exclusively owned by one process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityExecution {
    pub id: Uuid,
    pub process_id: Uuid,
    /// Id of the `ActivityDefinition` this executes.
    pub definition_id: String,
    pub activity_type: ActivityType,
    /// Enclosing sub-process execution or multi-instance parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub state: ActivityState,
    /// Local scope overlaying the process scope.
    #[serde(default)]
    pub variables: Variables,
    /// Attempts left, counting the one in progress.
    pub retries: u32,
    /// Failed attempts so far; drives backoff.
    #[serde(default)]
    pub attempts: u32,
    /// Position within a multi-instance collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_index: Option<u32>,
    /// Set on multi-instance parents only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
    /// Incoming flows that reached a parallel join.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub joined_flows: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<TaskLock>,
    /// External tasks are not fetchable before this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    /// Child process started by a call activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_process_id: Option<Uuid>,
    /// Job currently entitled to complete a service task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_job_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ActivityExecution {
    pub fn new(
        process_id: Uuid,
        definition_id: impl Into<String>,
        activity_type: ActivityType,
        parent_id: Option<Uuid>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_id,
            definition_id: definition_id.into(),
            activity_type,
            parent_id,
            state: ActivityState::Created,
            variables: Variables::new(),
            retries,
            attempts: 0,
            loop_index: None,
            loop_state: None,
            joined_flows: BTreeSet::new(),
            topic: None,
            lock: None,
            available_at: None,
            timeout_at: None,
            child_process_id: None,
            pending_job_id: None,
            failure: None,
            revision: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping timestamps and dropping any task lock once
    /// the execution stops being active.
    pub fn transition(&mut self, next: ActivityState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                entity: "activity",
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            ActivityState::Active => {
                self.started_at.get_or_insert(now);
            }
            ActivityState::Completed | ActivityState::Cancelled => {
                self.completed_at = Some(now);
                self.lock = None;
                self.pending_job_id = None;
            }
            ActivityState::Failed => {
                self.lock = None;
                self.pending_job_id = None;
            }
            ActivityState::Created => {}
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Whether an external worker may lock this execution at `now`.
    pub fn is_fetchable(&self, now: DateTime<Utc>) -> bool {
        self.activity_type == ActivityType::ExternalTask
            && self.state == ActivityState::Active
            && self.lock.as_ref().is_none_or(|l| l.expires_at <= now)
            && self.available_at.is_none_or(|at| at <= now)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn external() -> ActivityExecution {
        let mut exec = ActivityExecution::new(
            Uuid::now_v7(),
            "ship",
            ActivityType::ExternalTask,
            None,
            3,
            Utc::now(),
        );
        exec.transition(ActivityState::Active, Utc::now()).unwrap();
        exec
    }

    #[test]
    fn failed_is_open_but_not_terminal() {
        assert!(ActivityState::Failed.is_open());
        assert!(!ActivityState::Failed.is_terminal());
        assert!(ActivityState::Cancelled.is_terminal());
    }

    #[test]
    fn completed_cannot_reactivate() {
        let mut exec = external();
        exec.transition(ActivityState::Completed, Utc::now()).unwrap();
        assert!(exec.transition(ActivityState::Active, Utc::now()).is_err());
    }

    #[test]
    fn completion_drops_lock() {
        let mut exec = external();
        exec.lock = Some(TaskLock {
            worker_id: "w1".to_string(),
            expires_at: Utc::now() + Duration::seconds(30),
        });
        exec.transition(ActivityState::Completed, Utc::now()).unwrap();
        assert!(exec.lock.is_none());
        assert!(exec.completed_at.is_some());
    }

    #[test]
    fn fetchable_only_when_unlocked_or_expired() {
        let now = Utc::now();
        let mut exec = external();
        assert!(exec.is_fetchable(now));

        exec.lock = Some(TaskLock {
            worker_id: "w1".to_string(),
            expires_at: now + Duration::seconds(30),
        });
        assert!(!exec.is_fetchable(now));
        assert!(exec.is_fetchable(now + Duration::seconds(31)));

        exec.lock = None;
        exec.available_at = Some(now + Duration::seconds(5));
        assert!(!exec.is_fetchable(now));
    }

    #[test]
    fn lock_ownership_checks_worker_and_expiry() {
        let now = Utc::now();
        let lock = TaskLock {
            worker_id: "w1".to_string(),
            expires_at: now + Duration::seconds(10),
        };
        assert!(lock.is_held_by("w1", now));
        assert!(!lock.is_held_by("w2", now));
        assert!(!lock.is_held_by("w1", now + Duration::seconds(11)));
    }
}
