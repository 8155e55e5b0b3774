//! Engine events.
//!
//! `EngineEvent` is the single event vocabulary of the engine. Every variant
//! is Clone + Send + Sync for use with tokio channels; `kind()` gives the
//! payload-free discriminator handlers subscribe to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::ActivityType;

/// Events published after a state change has been committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ProcessStarted {
        process_id: Uuid,
        definition_key: String,
        definition_version: u32,
        business_key: Option<String>,
        parent_process_id: Option<Uuid>,
    },
    ProcessCompleted { process_id: Uuid },
    ProcessCancelled { process_id: Uuid },
    ProcessTerminated { process_id: Uuid },
    /// A process entered `Incident` because an activity failed for good.
    ProcessIncident {
        process_id: Uuid,
        activity_id: Uuid,
        activity_definition_id: String,
        reason: String,
    },
    ProcessRecovered { process_id: Uuid },
    ProcessSuspended { process_id: Uuid },
    ProcessResumed { process_id: Uuid },
    ProcessMigrated {
        process_id: Uuid,
        from_version: u32,
        to_version: u32,
    },
    ActivityActivated {
        process_id: Uuid,
        activity_id: Uuid,
        definition_id: String,
        activity_type: ActivityType,
    },
    ActivityCompleted {
        process_id: Uuid,
        activity_id: Uuid,
        definition_id: String,
    },
    ActivityFailed {
        process_id: Uuid,
        activity_id: Uuid,
        definition_id: String,
        reason: String,
        will_retry: bool,
    },
    ActivityCancelled {
        process_id: Uuid,
        activity_id: Uuid,
        definition_id: String,
    },
    /// A BPMN error was thrown; `caught_by` names the boundary event that
    /// handled it, if one did.
    ErrorThrown {
        process_id: Uuid,
        activity_id: Uuid,
        error_code: String,
        caught_by: Option<String>,
    },
    JobCompleted { job_id: Uuid, job_type: String },
    JobFailed {
        job_id: Uuid,
        job_type: String,
        attempt: u32,
        reason: String,
        will_retry: bool,
    },
    CompactionFinished {
        trigger: String,
        archived: u64,
        already_archived: u64,
    },
}

/// Discriminator of [`EngineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProcessStarted,
    ProcessCompleted,
    ProcessCancelled,
    ProcessTerminated,
    ProcessIncident,
    ProcessRecovered,
    ProcessSuspended,
    ProcessResumed,
    ProcessMigrated,
    ActivityActivated,
    ActivityCompleted,
    ActivityFailed,
    ActivityCancelled,
    ErrorThrown,
    JobCompleted,
    JobFailed,
    CompactionFinished,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ProcessStarted { .. } => EventKind::ProcessStarted,
            Self::ProcessCompleted { .. } => EventKind::ProcessCompleted,
            Self::ProcessCancelled { .. } => EventKind::ProcessCancelled,
            Self::ProcessTerminated { .. } => EventKind::ProcessTerminated,
            Self::ProcessIncident { .. } => EventKind::ProcessIncident,
            Self::ProcessRecovered { .. } => EventKind::ProcessRecovered,
            Self::ProcessSuspended { .. } => EventKind::ProcessSuspended,
            Self::ProcessResumed { .. } => EventKind::ProcessResumed,
            Self::ProcessMigrated { .. } => EventKind::ProcessMigrated,
            Self::ActivityActivated { .. } => EventKind::ActivityActivated,
            Self::ActivityCompleted { .. } => EventKind::ActivityCompleted,
            Self::ActivityFailed { .. } => EventKind::ActivityFailed,
            Self::ActivityCancelled { .. } => EventKind::ActivityCancelled,
            Self::ErrorThrown { .. } => EventKind::ErrorThrown,
            Self::JobCompleted { .. } => EventKind::JobCompleted,
            Self::JobFailed { .. } => EventKind::JobFailed,
            Self::CompactionFinished { .. } => EventKind::CompactionFinished,
        }
    }

    /// Process the event is about, if any.
    pub fn process_id(&self) -> Option<Uuid> {
        match self {
            Self::ProcessStarted { process_id, .. }
            | Self::ProcessCompleted { process_id }
            | Self::ProcessCancelled { process_id }
            | Self::ProcessTerminated { process_id }
            | Self::ProcessIncident { process_id, .. }
            | Self::ProcessRecovered { process_id }
            | Self::ProcessSuspended { process_id }
            | Self::ProcessResumed { process_id }
            | Self::ProcessMigrated { process_id, .. }
            | Self::ActivityActivated { process_id, .. }
            | Self::ActivityCompleted { process_id, .. }
            | Self::ActivityFailed { process_id, .. }
            | Self::ActivityCancelled { process_id, .. }
            | Self::ErrorThrown { process_id, .. } => Some(*process_id),
            Self::JobCompleted { .. } | Self::JobFailed { .. } | Self::CompactionFinished { .. } => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::ProcessCompleted {
            process_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "process_completed");
        assert_eq!(event.kind(), EventKind::ProcessCompleted);
        assert_eq!(event.process_id(), Some(Uuid::nil()));
    }

    #[test]
    fn job_events_have_no_process() {
        let event = EngineEvent::JobCompleted {
            job_id: Uuid::nil(),
            job_type: "compaction".to_string(),
        };
        assert_eq!(event.process_id(), None);
        assert_eq!(event.kind(), EventKind::JobCompleted);
    }
}
