//! Administrative commands.
//!
//! Plain data executed through the command bus. Each command has exactly one
//! handler; the output type is declared where the handler is registered.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::ProcessDefinition;
use crate::migration::ActivityMigrationInstruction;
use crate::variables::Variables;

/// Which definition a start refers to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum DefinitionRef {
    Id { id: Uuid },
    /// Latest version when `version` is absent.
    Key { key: String, version: Option<u32> },
}

impl DefinitionRef {
    pub fn latest(key: impl Into<String>) -> Self {
        Self::Key {
            key: key.into(),
            version: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployDefinitionCommand {
    pub definition: ProcessDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartProcessCommand {
    pub definition: DefinitionRef,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub business_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelProcessCommand {
    pub process_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TerminateProcessCommand {
    pub process_id: Uuid,
}

/// Re-enter a process in `Incident` at its failed activities.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RecoverProcessCommand {
    pub process_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SuspendProcessCommand {
    pub process_id: Uuid,
    /// `false` resumes.
    pub suspended: bool,
}

/// Suspend or resume every non-terminal process of a definition key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendDefinitionCommand {
    pub definition_key: String,
    pub suspended: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVariablesCommand {
    pub process_id: Uuid,
    pub variables: Variables,
}

/// Enqueue a job of `job_type` and run it immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunJobCommand {
    pub job_type: String,
    #[serde(default)]
    pub input: Variables,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMigrationCommand {
    pub definition_key: String,
    pub from_version: u32,
    pub to_version: u32,
    pub instructions: Vec<ActivityMigrationInstruction>,
}

/// Propose and store a plan from the difference between two versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateMigrationPlanCommand {
    pub definition_key: String,
    pub from_version: u32,
    pub to_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyMigrationCommand {
    pub plan_id: Uuid,
    /// Every process pinned to the source version when empty.
    #[serde(default)]
    pub process_ids: Vec<Uuid>,
}

/// Apply a plan to its whole source version from a `process-migration`
/// job instead of inline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScheduleMigrationCommand {
    pub plan_id: Uuid,
}
