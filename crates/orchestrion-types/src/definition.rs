//! Process definition types.
//!
//! A `ProcessDefinition` is an immutable, versioned graph: activities are the
//! nodes, sequence flows the edges. Definition files (YAML or JSON) map 1:1 to
//! the serde form of these types:
//!
//! ```yaml
//! key: order
//! activities:
//!   - id: start
//!     type: start_event
//!   - id: route
//!     type: exclusive_gateway
//!     default_flow: to-small
//!   - id: ship
//!     type: external_task
//!     topic: shipping
//! flows:
//!   - { id: f1, source: start, target: route }
//!   - { id: to-big, source: route, target: ship, condition: "amount > 100" }
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseEnumError;
use crate::variables::Variables;

// ---------------------------------------------------------------------------
// ProcessDefinition
// ---------------------------------------------------------------------------

/// A deployed, immutable process definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessDefinition {
    /// Immutable identity, assigned on deploy when absent from the file.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Business key shared by every version of this definition.
    pub key: String,
    /// Version within `key`. Zero means "assign the next version on deploy".
    #[serde(default)]
    pub version: u32,
    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Activity nodes.
    pub activities: Vec<ActivityDefinition>,
    /// Sequence flows, in declaration order.
    #[serde(default)]
    pub flows: Vec<SequenceFlow>,
    /// Default variables copied into every new process scope.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub variables: Variables,
    /// When this version was deployed.
    #[serde(default = "Utc::now")]
    pub deployed_at: DateTime<Utc>,
}

impl ProcessDefinition {
    /// Look up an activity by id.
    pub fn activity(&self, id: &str) -> Option<&ActivityDefinition> {
        self.activities.iter().find(|a| a.id == id)
    }

    /// Look up a sequence flow by id.
    pub fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.iter().find(|f| f.id == id)
    }

    /// Flows leaving `activity_id`, in declaration order.
    pub fn outgoing<'a>(&'a self, activity_id: &'a str) -> impl Iterator<Item = &'a SequenceFlow> {
        self.flows.iter().filter(move |f| f.source == activity_id)
    }

    /// Flows entering `activity_id`, in declaration order.
    pub fn incoming<'a>(&'a self, activity_id: &'a str) -> impl Iterator<Item = &'a SequenceFlow> {
        self.flows.iter().filter(move |f| f.target == activity_id)
    }

    /// Start events of a scope: the top level when `scope` is `None`,
    /// otherwise the embedded sub-process with that id.
    pub fn start_activities(&self, scope: Option<&str>) -> Vec<&ActivityDefinition> {
        self.activities
            .iter()
            .filter(|a| a.parent.as_deref() == scope && a.kind == ActivityKind::StartEvent)
            .collect()
    }

    /// Error boundary events attached to `activity_id`, in declaration order.
    pub fn error_boundaries<'a, 'b>(&'a self, activity_id: &'b str) -> impl Iterator<Item = &'a ActivityDefinition> {
        self.activities.iter().filter(move |a| {
            matches!(&a.kind, ActivityKind::ErrorBoundaryEvent { attached_to, .. } if attached_to == activity_id)
        })
    }

    /// The boundary on `activity_id` that catches `error_code`. A boundary
    /// naming the code wins over a catch-all one.
    pub fn error_catcher(&self, activity_id: &str, error_code: &str) -> Option<&ActivityDefinition> {
        let mut catch_all = None;
        for boundary in self.error_boundaries(activity_id) {
            match &boundary.kind {
                ActivityKind::ErrorBoundaryEvent { error_code: Some(code), .. } if code == error_code => {
                    return Some(boundary);
                }
                ActivityKind::ErrorBoundaryEvent { error_code: None, .. } if catch_all.is_none() => {
                    catch_all = Some(boundary);
                }
                _ => {}
            }
        }
        catch_all
    }

    /// Human-readable `key:version` label.
    pub fn label(&self) -> String {
        format!("{}:{}", self.key, self.version)
    }
}

// ---------------------------------------------------------------------------
// ActivityDefinition
// ---------------------------------------------------------------------------

/// A node in the process graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityDefinition {
    /// Unique within the definition.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Behaviour of the node, tagged by `type`.
    #[serde(flatten)]
    pub kind: ActivityKind,
    /// Enclosing embedded sub-process, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Expands the activity into one execution per collection element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceLoopCharacteristics>,
    /// Maximum attempts before the activity fails with an incident.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Deadline for a waiting activity, measured from activation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ActivityDefinition {
    /// Convenience constructor used by tests and builders.
    pub fn new(id: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
            parent: None,
            multi_instance: None,
            retries: None,
            timeout_secs: None,
        }
    }

    pub fn activity_type(&self) -> ActivityType {
        self.kind.activity_type()
    }
}

/// Node behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    StartEvent,
    EndEvent,
    /// Ends the enclosing scope, cancelling every other open execution in it.
    TerminateEndEvent,
    /// Throws `error_code` to the nearest matching error boundary event of an
    /// enclosing scope.
    ErrorEndEvent { error_code: String },
    /// Catches an error thrown inside `attached_to` (any error when
    /// `error_code` is absent), cancels that activity and continues from here.
    ErrorBoundaryEvent {
        attached_to: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<String>,
    },
    /// Completes as soon as it is entered.
    Task,
    /// Runs a handler registered in-process under `handler`, through a job.
    ServiceTask { handler: String },
    /// Waits for an external worker subscribed to `topic`.
    ExternalTask { topic: String },
    /// Waits until `message` is correlated to the process.
    ReceiveTask { message: String },
    ExclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    ParallelGateway,
    /// Takes every flow whose condition holds; the join waits only for the
    /// branches that can still arrive.
    InclusiveGateway {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_flow: Option<String>,
    },
    /// Starts a child process of `called_element` and waits for it.
    CallActivity {
        called_element: String,
        /// Pinned version; latest when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
        /// Input mappings; `None` passes every visible variable.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inputs: Option<Vec<VariableMapping>>,
        /// Output mappings; `None` merges every child variable back.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        outputs: Option<Vec<VariableMapping>>,
    },
    /// Embedded scope whose children name it as `parent`.
    SubProcess,
}

impl ActivityKind {
    pub fn activity_type(&self) -> ActivityType {
        match self {
            Self::StartEvent => ActivityType::StartEvent,
            Self::EndEvent => ActivityType::EndEvent,
            Self::TerminateEndEvent => ActivityType::TerminateEndEvent,
            Self::ErrorEndEvent { .. } => ActivityType::ErrorEndEvent,
            Self::ErrorBoundaryEvent { .. } => ActivityType::ErrorBoundaryEvent,
            Self::Task => ActivityType::Task,
            Self::ServiceTask { .. } => ActivityType::ServiceTask,
            Self::ExternalTask { .. } => ActivityType::ExternalTask,
            Self::ReceiveTask { .. } => ActivityType::ReceiveTask,
            Self::ExclusiveGateway { .. } => ActivityType::ExclusiveGateway,
            Self::ParallelGateway => ActivityType::ParallelGateway,
            Self::InclusiveGateway { .. } => ActivityType::InclusiveGateway,
            Self::CallActivity { .. } => ActivityType::CallActivity,
            Self::SubProcess => ActivityType::SubProcess,
        }
    }
}

/// Payload-free discriminator of [`ActivityKind`], stored with executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    StartEvent,
    EndEvent,
    TerminateEndEvent,
    ErrorEndEvent,
    ErrorBoundaryEvent,
    Task,
    ServiceTask,
    ExternalTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    CallActivity,
    SubProcess,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartEvent => "start_event",
            Self::EndEvent => "end_event",
            Self::TerminateEndEvent => "terminate_end_event",
            Self::ErrorEndEvent => "error_end_event",
            Self::ErrorBoundaryEvent => "error_boundary_event",
            Self::Task => "task",
            Self::ServiceTask => "service_task",
            Self::ExternalTask => "external_task",
            Self::ReceiveTask => "receive_task",
            Self::ExclusiveGateway => "exclusive_gateway",
            Self::ParallelGateway => "parallel_gateway",
            Self::InclusiveGateway => "inclusive_gateway",
            Self::CallActivity => "call_activity",
            Self::SubProcess => "sub_process",
        }
    }

    /// Activities that park the process until something outside the
    /// transition completes them.
    pub fn is_wait_state(&self) -> bool {
        matches!(
            self,
            Self::ServiceTask | Self::ExternalTask | Self::ReceiveTask | Self::CallActivity
        )
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "start_event" => Self::StartEvent,
            "end_event" => Self::EndEvent,
            "terminate_end_event" => Self::TerminateEndEvent,
            "error_end_event" => Self::ErrorEndEvent,
            "error_boundary_event" => Self::ErrorBoundaryEvent,
            "task" => Self::Task,
            "service_task" => Self::ServiceTask,
            "external_task" => Self::ExternalTask,
            "receive_task" => Self::ReceiveTask,
            "exclusive_gateway" => Self::ExclusiveGateway,
            "parallel_gateway" => Self::ParallelGateway,
            "inclusive_gateway" => Self::InclusiveGateway,
            "call_activity" => Self::CallActivity,
            "sub_process" => Self::SubProcess,
            other => {
                return Err(ParseEnumError {
                    kind: "activity type",
                    value: other.to_string(),
                });
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Flows, mappings, loops
// ---------------------------------------------------------------------------

/// A directed edge between two activities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceFlow {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Guard expression; the flow is unconditional when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl SequenceFlow {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// Copies the value of `source` (an expression) into variable `target`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableMapping {
    pub source: String,
    pub target: String,
}

/// Multi-instance configuration of an activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MultiInstanceLoopCharacteristics {
    /// Expression yielding the array to iterate (usually a variable name).
    pub collection: String,
    /// Variable bound to the current element in each child scope.
    pub element_variable: String,
    /// Run children one after another instead of all at once.
    #[serde(default)]
    pub sequential: bool,
    /// Early-exit condition evaluated after each child completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_condition: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ORDER_YAML: &str = r#"
key: order
activities:
  - id: start
    type: start_event
  - id: route
    type: exclusive_gateway
    default_flow: small
  - id: ship
    type: external_task
    topic: shipping
    retries: 5
  - id: review
    type: call_activity
    called_element: review
    outputs:
      - { source: "approved", target: "reviewApproved" }
  - id: end
    type: end_event
flows:
  - { id: f1, source: start, target: route }
  - { id: big, source: route, target: ship, condition: "amount > 100" }
  - { id: small, source: route, target: review }
  - { id: f2, source: ship, target: end }
  - { id: f3, source: review, target: end }
"#;

    #[test]
    fn yaml_definition_deserializes() {
        let def: ProcessDefinition = serde_yaml_ng::from_str(ORDER_YAML).unwrap();
        assert_eq!(def.key, "order");
        assert_eq!(def.version, 0);
        assert_eq!(def.activities.len(), 5);
        assert_eq!(
            def.activity("ship").unwrap().kind,
            ActivityKind::ExternalTask {
                topic: "shipping".to_string()
            }
        );
        assert_eq!(def.activity("ship").unwrap().retries, Some(5));
        match &def.activity("review").unwrap().kind {
            ActivityKind::CallActivity { inputs, outputs, .. } => {
                assert!(inputs.is_none());
                assert_eq!(outputs.as_ref().unwrap()[0].target, "reviewApproved");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn outgoing_preserves_declaration_order() {
        let def: ProcessDefinition = serde_yaml_ng::from_str(ORDER_YAML).unwrap();
        let ids: Vec<&str> = def.outgoing("route").map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["big", "small"]);
        let ids: Vec<&str> = def.incoming("end").map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["f2", "f3"]);
    }

    #[test]
    fn start_activities_respect_scope() {
        let mut def: ProcessDefinition = serde_yaml_ng::from_str(ORDER_YAML).unwrap();
        let mut inner = ActivityDefinition::new("inner-start", ActivityKind::StartEvent);
        inner.parent = Some("sub".to_string());
        def.activities.push(inner);

        let top: Vec<&str> = def.start_activities(None).iter().map(|a| a.id.as_str()).collect();
        assert_eq!(top, vec!["start"]);
        let nested: Vec<&str> = def
            .start_activities(Some("sub"))
            .iter()
            .map(|a| a.id.as_str())
            .collect();
        assert_eq!(nested, vec!["inner-start"]);
    }

    #[test]
    fn specific_error_boundary_wins_over_catch_all() {
        let yaml = r#"
key: errors
activities:
  - id: start
    type: start_event
  - id: work
    type: sub_process
  - id: any
    type: error_boundary_event
    attached_to: work
  - id: stock
    type: error_boundary_event
    attached_to: work
    error_code: OUT_OF_STOCK
"#;
        let def: ProcessDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.error_boundaries("work").count(), 2);
        assert_eq!(def.error_catcher("work", "OUT_OF_STOCK").unwrap().id, "stock");
        assert_eq!(def.error_catcher("work", "OTHER").unwrap().id, "any");
        assert!(def.error_catcher("start", "OTHER").is_none());
    }

    #[test]
    fn activity_type_round_trips_through_str() {
        for t in [
            ActivityType::ExclusiveGateway,
            ActivityType::InclusiveGateway,
            ActivityType::ErrorBoundaryEvent,
            ActivityType::CallActivity,
        ] {
            assert_eq!(t.as_str().parse::<ActivityType>().unwrap(), t);
        }
        assert!("nope".parse::<ActivityType>().is_err());
    }
}
