//! External task projection.
//!
//! An `ExternalTask` is not persisted on its own: it is a view over an
//! active `ActivityExecution` of external type, enriched with what a worker
//! needs to do the work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::variables::Variables;

/// A locked unit of work handed to an external worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalTask {
    /// Id of the underlying activity execution.
    pub id: Uuid,
    pub process_id: Uuid,
    pub topic: String,
    pub definition_key: String,
    /// Activity id within the definition.
    pub activity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub business_key: Option<String>,
    /// Visible variables (process scope overlaid by local scopes).
    pub variables: Variables,
    pub retries: u32,
    pub worker_id: String,
    pub lock_expires_at: DateTime<Utc>,
}

/// Failure report from a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskFailure {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    /// Retries the worker believes remain; never raises the budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries_left: Option<u32>,
    /// Delay before the task becomes fetchable again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Business error to throw from the task instead of spending an attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl TaskFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }
}
