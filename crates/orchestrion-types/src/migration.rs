//! Process migration plans and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maps executions of `from_activity_id` to `to_activity_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityMigrationInstruction {
    pub from_activity_id: String,
    pub to_activity_id: String,
}

impl ActivityMigrationInstruction {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from_activity_id: from.into(),
            to_activity_id: to.into(),
        }
    }
}

/// A stored, inert plan to move processes between two versions of a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessMigrationPlan {
    pub id: Uuid,
    pub definition_key: String,
    pub from_version: u32,
    pub to_version: u32,
    /// Checked in order; the first instruction for a source activity wins.
    pub instructions: Vec<ActivityMigrationInstruction>,
    pub created_at: DateTime<Utc>,
}

impl ProcessMigrationPlan {
    /// Target activity for `from_activity_id`, if an instruction names it.
    pub fn target_for(&self, from_activity_id: &str) -> Option<&str> {
        self.instructions
            .iter()
            .find(|i| i.from_activity_id == from_activity_id)
            .map(|i| i.to_activity_id.as_str())
    }
}

/// Per-process outcome of applying a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Definition pointer moved; `remapped` open executions were rewritten.
    Migrated { remapped: usize },
    /// Not pinned to the source version, or already terminal.
    Skipped { reason: String },
    /// Left untouched because at least one execution had no valid mapping.
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessMigrationResult {
    pub process_id: Uuid,
    #[serde(flatten)]
    pub outcome: MigrationOutcome,
}
