//! Job types: the engine's unit of asynchronous, retryable work.
//!
//! Jobs carry opaque input and report opaque output. They know nothing about
//! process semantics; the handler registered for `job_type` does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::Failure;
use crate::error::{ParseEnumError, TransitionError};
use crate::variables::Variables;

/// Well-known job types.
pub mod job_types {
    /// Runs a service-task handler for one activity execution.
    pub const ACTIVITY: &str = "activity";
    /// Moves terminal processes into history.
    pub const COMPACTION: &str = "compaction";
    /// Applies a stored migration plan to every process of its source version.
    pub const PROCESS_MIGRATION: &str = "process-migration";
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, Running) | (Running, Completed) | (Running, Failed) | (Running, Created)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "job state",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Time-bounded claim on a running job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobLease {
    /// Unique per claim, so a re-claim by the same node is still distinct.
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    /// Handler tag, see [`job_types`].
    pub job_type: String,
    pub state: JobState,
    #[serde(default)]
    pub input: Variables,
    #[serde(default)]
    pub output: Variables,
    /// Process the job works for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<Uuid>,
    /// Handler invocations started so far.
    pub attempts: u32,
    /// Attempt budget, first attempt included.
    pub max_attempts: u32,
    /// Earliest time the next attempt may start.
    pub run_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<JobLease>,
    /// Last failure only.
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

impl Job {
    pub fn new(
        job_type: impl Into<String>,
        input: Variables,
        max_attempts: u32,
        process_id: Option<Uuid>,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_type: job_type.into(),
            state: JobState::Created,
            input,
            output: Variables::new(),
            process_id,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            run_at,
            lease: None,
            failure: None,
            revision: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Attempts still available, the running one excluded.
    pub fn retries_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                entity: "job",
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            JobState::Running => {
                self.started_at.get_or_insert(now);
            }
            JobState::Completed | JobState::Failed => {
                self.completed_at = Some(now);
                self.lease = None;
            }
            JobState::Created => {
                self.lease = None;
            }
        }
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Created => self.run_at <= now,
            JobState::Running => self.lease.as_ref().is_none_or(|l| l.expires_at <= now),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
