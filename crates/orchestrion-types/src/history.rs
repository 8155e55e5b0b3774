//! Append-only history records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityExecution;
use crate::job::Job;
use crate::process::Process;

/// Full execution history of one terminal process, as archived by compaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub process: Process,
    pub activities: Vec<ActivityExecution>,
    pub jobs: Vec<Job>,
    pub archived_at: DateTime<Utc>,
}
