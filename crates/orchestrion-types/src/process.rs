//! Process instance types and the process lifecycle table.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::error::{ParseEnumError, TransitionError};
use crate::variables::Variables;

// ---------------------------------------------------------------------------
// ProcessState
// ---------------------------------------------------------------------------

/// Lifecycle state of a process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Created,
    Running,
    Completed,
    Cancelled,
    Terminated,
    Incident,
}

impl ProcessState {
    /// No transition leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Terminated)
    }

    pub fn can_transition_to(&self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Running, Terminated)
                | (Running, Incident)
                | (Incident, Running)
                | (Incident, Cancelled)
                | (Incident, Terminated)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
            Self::Incident => "incident",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "terminated" => Ok(Self::Terminated),
            "incident" => Ok(Self::Incident),
            other => Err(ParseEnumError {
                kind: "process state",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// Link from a called process back to the call activity that started it.
///
/// A relation only: the parent does not own the child and the child is
/// archived independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub process_id: Uuid,
    pub activity_id: Uuid,
}

/// One running instance of a process definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Process {
    /// UUIDv7 process id.
    pub id: Uuid,
    /// Pinned definition version.
    pub definition_id: Uuid,
    pub definition_key: String,
    pub definition_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    pub state: ProcessState,
    /// Process-level variable scope.
    #[serde(default)]
    pub variables: Variables,
    /// Set when started by a call activity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    /// Top of the call-activity chain (self for root processes).
    pub root_process_id: Uuid,
    /// Suspended processes expose no external tasks and run no jobs.
    #[serde(default)]
    pub suspended: bool,
    /// Optimistic concurrency token, bumped by the store on every write.
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    /// A new process in `Created` state, seeded with the definition defaults
    /// overlaid by `variables`.
    pub fn new(
        id: Uuid,
        definition: &ProcessDefinition,
        variables: Variables,
        business_key: Option<String>,
        parent: Option<(ParentRef, Uuid)>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut scope = definition.variables.clone();
        crate::variables::merge(&mut scope, &variables);
        let (parent, root_process_id) = match parent {
            Some((parent, root)) => (Some(parent), root),
            None => (None, id),
        };
        Self {
            id,
            definition_id: definition.id,
            definition_key: definition.key.clone(),
            definition_version: definition.version,
            business_key,
            state: ProcessState::Created,
            variables: scope,
            parent,
            root_process_id,
            suspended: false,
            revision: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping the lifecycle timestamps.
    pub fn transition(&mut self, next: ProcessState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                entity: "process",
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == ProcessState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Incident
// ---------------------------------------------------------------------------

/// Operator-facing view of a failed activity that holds a process in
/// `Incident`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    pub process_id: Uuid,
    pub activity_id: Uuid,
    pub activity_definition_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ActivityDefinition, ActivityKind};
    use serde_json::json;

    fn definition() -> ProcessDefinition {
        ProcessDefinition {
            id: Uuid::now_v7(),
            key: "order".to_string(),
            version: 2,
            name: None,
            activities: vec![ActivityDefinition::new("start", ActivityKind::StartEvent)],
            flows: vec![],
            variables: crate::variables::from_value(json!({ "region": "eu", "amount": 0 })),
            deployed_at: Utc::now(),
        }
    }

    #[test]
    fn new_process_overlays_definition_defaults() {
        let def = definition();
        let id = Uuid::now_v7();
        let p = Process::new(
            id,
            &def,
            crate::variables::from_value(json!({ "amount": 50 })),
            Some("B-1".to_string()),
            None,
            Utc::now(),
        );
        assert_eq!(p.state, ProcessState::Created);
        assert_eq!(p.root_process_id, id);
        assert_eq!(p.definition_version, 2);
        assert_eq!(p.variables["amount"], json!(50));
        assert_eq!(p.variables["region"], json!("eu"));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [ProcessState::Completed, ProcessState::Cancelled, ProcessState::Terminated] {
            for next in [
                ProcessState::Created,
                ProcessState::Running,
                ProcessState::Completed,
                ProcessState::Cancelled,
                ProcessState::Terminated,
                ProcessState::Incident,
            ] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut p = Process::new(Uuid::now_v7(), &definition(), Variables::new(), None, None, Utc::now());
        p.transition(ProcessState::Running, Utc::now()).unwrap();
        assert!(p.started_at.is_some());
        assert!(p.completed_at.is_none());
        p.transition(ProcessState::Incident, Utc::now()).unwrap();
        p.transition(ProcessState::Running, Utc::now()).unwrap();
        p.transition(ProcessState::Completed, Utc::now()).unwrap();
        assert!(p.completed_at.is_some());
        assert!(p.transition(ProcessState::Running, Utc::now()).is_err());
    }

    #[test]
    fn state_parses_from_display() {
        assert_eq!("incident".parse::<ProcessState>().unwrap(), ProcessState::Incident);
        assert_eq!(ProcessState::Terminated.to_string(), "terminated");
    }
}
