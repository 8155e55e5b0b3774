//! Named cron triggers on top of `tokio-cron-scheduler`.
//!
//! Schedules accept 6-field cron (with seconds), classic 5-field cron, or a
//! few human phrases such as "every 5 minutes" or "every day at 02:30".

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler error: {0}")]
    JobError(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("trigger '{0}' is not scheduled")]
    TriggerNotFound(String),
}

impl From<SchedulerError> for EngineError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidSchedule(s) => EngineError::Definition(format!("invalid schedule: {s}")),
            other => EngineError::execution(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule normalization
// ---------------------------------------------------------------------------

/// Turn a schedule string into a 6-field cron expression.
///
/// | input | cron |
/// |---|---|
/// | `every N seconds` | `*/N * * * * *` |
/// | `every N minutes` | `0 */N * * * *` |
/// | `every N hours` | `0 0 */N * * *` |
/// | `every minute` / `minutely` | `0 * * * * *` |
/// | `every hour` / `hourly` | `0 0 * * * *` |
/// | `every day` / `daily` | `0 0 0 * * *` |
/// | `every day at HH:MM` | `0 MM HH * * *` |
pub fn normalize_schedule(input: &str) -> Result<String, SchedulerError> {
    let trimmed = input.trim();
    let invalid = || SchedulerError::InvalidSchedule(input.to_string());

    match trimmed.split_whitespace().count() {
        5 => return Ok(format!("0 {trimmed}")),
        6 => return Ok(trimmed.to_string()),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let Some(rest) = lower.strip_prefix("every ") else {
        return Err(SchedulerError::InvalidSchedule(format!(
            "unrecognized schedule format: '{trimmed}'"
        )));
    };

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let words: Vec<&str> = rest.split_whitespace().collect();
    let [n, unit] = words.as_slice() else {
        return Err(invalid());
    };
    let n: u32 = n.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(SchedulerError::InvalidSchedule("interval must be > 0".to_string()));
    }
    match unit.trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

// ---------------------------------------------------------------------------
// CronScheduler
// ---------------------------------------------------------------------------

/// Invoked with the trigger name and fire time.
pub type CronCallback = Arc<dyn Fn(String, DateTime<Utc>) -> BoxFuture<'static, ()> + Send + Sync>;

struct ScheduledTrigger {
    job_id: Uuid,
    cron_expr: String,
}

pub struct CronScheduler {
    inner: Arc<RwLock<Option<JobScheduler>>>,
    triggers: Arc<RwLock<HashMap<String, ScheduledTrigger>>>,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
            triggers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        *self.inner.write().await = Some(scheduler);
        tracing::info!("cron scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(mut scheduler) = self.inner.write().await.take() {
            scheduler
                .shutdown()
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
            tracing::info!("cron scheduler stopped");
        }
        self.triggers.write().await.clear();
        Ok(())
    }

    /// Fire `callback` on `schedule` under `name`, replacing an existing
    /// trigger of that name.
    pub async fn schedule(&self, name: &str, schedule: &str, callback: CronCallback) -> Result<(), SchedulerError> {
        let cron_expr = normalize_schedule(schedule)?;
        if self.triggers.read().await.contains_key(name) {
            self.unschedule(name).await?;
        }

        let inner = self.inner.read().await;
        let scheduler = inner
            .as_ref()
            .ok_or_else(|| SchedulerError::JobError("scheduler not started".to_string()))?;

        let trigger = name.to_string();
        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let cb = Arc::clone(&callback);
            let trigger = trigger.clone();
            Box::pin(async move {
                let now = Utc::now();
                tracing::debug!(%trigger, %now, "cron trigger fired");
                cb(trigger, now).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let job_id = job.guid();
        scheduler
            .add(job)
            .await
            .map_err(|e| SchedulerError::JobError(e.to_string()))?;

        tracing::info!(trigger = name, cron = %cron_expr, "cron trigger scheduled");
        self.triggers
            .write()
            .await
            .insert(name.to_string(), ScheduledTrigger { job_id, cron_expr });
        Ok(())
    }

    pub async fn unschedule(&self, name: &str) -> Result<(), SchedulerError> {
        let entry = self
            .triggers
            .write()
            .await
            .remove(name)
            .ok_or_else(|| SchedulerError::TriggerNotFound(name.to_string()))?;
        if let Some(scheduler) = self.inner.read().await.as_ref() {
            scheduler
                .remove(&entry.job_id)
                .await
                .map_err(|e| SchedulerError::JobError(e.to_string()))?;
        }
        tracing::info!(trigger = name, "cron trigger removed");
        Ok(())
    }

    /// Normalized cron expression of a scheduled trigger.
    pub async fn expression(&self, name: &str) -> Option<String> {
        self.triggers.read().await.get(name).map(|t| t.cron_expr.clone())
    }

    pub async fn trigger_count(&self) -> usize {
        self.triggers.read().await.len()
    }
}

impl Default for CronScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_gains_seconds() {
        assert_eq!(normalize_schedule("*/5 * * * *").unwrap(), "0 */5 * * * *");
    }

    #[test]
    fn six_field_cron_passes_through() {
        assert_eq!(normalize_schedule(" 0 0 2 * * * ").unwrap(), "0 0 2 * * *");
    }

    #[test]
    fn human_intervals() {
        assert_eq!(normalize_schedule("every 10 seconds").unwrap(), "*/10 * * * * *");
        assert_eq!(normalize_schedule("Every 5 Minutes").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_schedule("every 1 hour").unwrap(), "0 0 */1 * * *");
        assert_eq!(normalize_schedule("hourly").unwrap(), "0 0 * * * *");
        assert_eq!(normalize_schedule("daily").unwrap(), "0 0 0 * * *");
    }

    #[test]
    fn daily_at_time() {
        assert_eq!(normalize_schedule("every day at 02:30").unwrap(), "0 30 2 * * *");
        assert!(normalize_schedule("every day at 25:00").is_err());
        assert!(normalize_schedule("every day at noon").is_err());
    }

    #[test]
    fn rejects_garbage_and_zero_intervals() {
        assert!(normalize_schedule("whenever").is_err());
        assert!(normalize_schedule("every 0 minutes").is_err());
        assert!(normalize_schedule("every 3 fortnights").is_err());
    }

    #[tokio::test]
    async fn schedule_requires_started_scheduler() {
        let cron = CronScheduler::new();
        let callback: CronCallback = Arc::new(|_: String, _: DateTime<Utc>| -> BoxFuture<'static, ()> { Box::pin(async {}) });
        let err = cron.schedule("compaction", "daily", callback).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobError(_)));
        assert_eq!(cron.trigger_count().await, 0);
    }

    #[tokio::test]
    async fn schedule_and_unschedule_named_trigger() {
        let cron = CronScheduler::new();
        cron.start().await.unwrap();
        let callback: CronCallback = Arc::new(|_: String, _: DateTime<Utc>| -> BoxFuture<'static, ()> { Box::pin(async {}) });
        cron.schedule("compaction", "0 0 2 * * *", callback.clone()).await.unwrap();
        cron.schedule("compaction", "every 5 minutes", callback).await.unwrap();

        assert_eq!(cron.trigger_count().await, 1);
        assert_eq!(cron.expression("compaction").await.unwrap(), "0 */5 * * * *");

        cron.unschedule("compaction").await.unwrap();
        assert!(matches!(
            cron.unschedule("compaction").await,
            Err(SchedulerError::TriggerNotFound(_))
        ));
        cron.stop().await.unwrap();
    }
}
