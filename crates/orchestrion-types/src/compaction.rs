//! Compaction trigger and report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Requests one compaction run.
///
/// `trigger` is descriptive metadata ("manual", "cron", ...). The job never
/// branches on it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompactionCommand {
    pub trigger: String,
}

impl CompactionCommand {
    pub fn manual() -> Self {
        Self {
            trigger: "manual".to_string(),
        }
    }

    pub fn cron() -> Self {
        Self {
            trigger: "cron".to_string(),
        }
    }
}

/// What a compaction run did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompactionReport {
    pub trigger: String,
    /// Pages read from the active store.
    pub pages: u32,
    /// Processes copied into history and removed.
    pub archived: u64,
    /// Processes found already archived; removed without a second copy.
    pub already_archived: u64,
    pub deleted_activities: u64,
    pub deleted_jobs: u64,
    /// Finished jobs of no process (compaction, migration, ad hoc runs)
    /// removed once past retention.
    #[serde(default)]
    pub purged_jobs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
