//! Engine configuration types.
//!
//! `EngineConfig` mirrors `config.toml` in the data directory. Every field
//! has a default, so an empty file (or no file) is a valid configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::job_types;

/// Top-level configuration for an engine node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub external_tasks: ExternalTaskSettings,
    #[serde(default)]
    pub compaction: CompactionSettings,
}

// ---------------------------------------------------------------------------
// [engine]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Identity used in job leases and compaction locks.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Attempts for activities whose definition sets no `retries`.
    #[serde(default = "default_activity_max_attempts")]
    pub activity_max_attempts: u32,
    /// Delay between failed service-task attempts.
    #[serde(default = "default_activity_backoff")]
    pub activity_backoff: RetryPolicyConfig,
    #[serde(default = "default_timeout_sweep_interval_ms")]
    pub timeout_sweep_interval_ms: u64,
}

fn default_node_id() -> String {
    format!("node-{}", Uuid::now_v7().simple())
}

fn default_activity_max_attempts() -> u32 {
    3
}

fn default_activity_backoff() -> RetryPolicyConfig {
    RetryPolicyConfig {
        max_attempts: 3,
        backoff: BackoffKind::Exponential,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
    }
}

fn default_timeout_sweep_interval_ms() -> u64 {
    1_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            activity_max_attempts: default_activity_max_attempts(),
            activity_backoff: default_activity_backoff(),
            timeout_sweep_interval_ms: default_timeout_sweep_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// [jobs]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Attempt budget and backoff for one job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Handler invocations allowed, the first one included.
    pub max_attempts: u32,
    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Exponential
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: default_backoff_kind(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Jobs executing concurrently on this node.
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Lease granted per claim; renewed by heartbeats.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Upper bound for a single handler invocation.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Per-type overrides keyed by job type.
    #[serde(default)]
    pub policies: HashMap<String, RetryPolicyConfig>,
}

fn default_worker_pool_size() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_secs() -> u64 {
    30
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_job_timeout_secs() -> u64 {
    300
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            job_timeout_secs: default_job_timeout_secs(),
            policies: HashMap::new(),
        }
    }
}

impl JobSettings {
    /// Policy for `job_type`: the configured override, else the built-in
    /// default for that type.
    ///
    /// Activity jobs always get a single attempt: their retries are counted
    /// on the activity execution, one job per attempt.
    pub fn policy_for(&self, job_type: &str) -> RetryPolicyConfig {
        if job_type == job_types::ACTIVITY {
            return RetryPolicyConfig {
                max_attempts: 1,
                backoff: BackoffKind::Fixed,
                base_delay_ms: 0,
                max_delay_ms: 0,
            };
        }
        self.policies.get(job_type).cloned().unwrap_or_default()
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}

// ---------------------------------------------------------------------------
// [external_tasks]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTaskSettings {
    #[serde(default = "default_lock_duration_ms")]
    pub default_lock_duration_ms: u64,
    #[serde(default = "default_max_tasks_per_fetch")]
    pub max_tasks_per_fetch: usize,
    /// Poll cadence of the in-process worker.
    #[serde(default = "default_worker_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,
}

fn default_lock_duration_ms() -> u64 {
    60_000
}

fn default_max_tasks_per_fetch() -> usize {
    10
}

fn default_worker_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ExternalTaskSettings {
    fn default() -> Self {
        Self {
            default_lock_duration_ms: default_lock_duration_ms(),
            max_tasks_per_fetch: default_max_tasks_per_fetch(),
            worker_poll_interval_ms: default_worker_poll_interval_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// [compaction]
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSettings {
    /// Run on `cron` while serving.
    #[serde(default)]
    pub enabled: bool,
    /// 5- or 6-field cron expression, or a phrase such as "every 10 minutes".
    #[serde(default = "default_cron")]
    pub cron: String,
    /// Minimum age of a terminal process before it is archived.
    #[serde(default)]
    pub retention_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// How long one node may hold the compaction lease.
    #[serde(default = "default_compaction_lease_secs")]
    pub lease_secs: u64,
}

fn default_cron() -> String {
    "0 0 2 * * *".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_compaction_lease_secs() -> u64 {
    3_600
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cron: default_cron(),
            retention_secs: 0,
            page_size: default_page_size(),
            lease_secs: default_compaction_lease_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
