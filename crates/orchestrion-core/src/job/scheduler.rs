//! Job scheduler and retry manager.
//!
//! Jobs live in the store. The scheduler polls for due jobs, claims each one
//! with a lease, runs its handler on a bounded worker pool and writes the
//! outcome back with a revision check. A heartbeat keeps the lease alive
//! while the handler runs; an attempt whose lease was taken over loses its
//! final write and is discarded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use orchestrion_types::activity::Failure;
use orchestrion_types::config::JobSettings;
use orchestrion_types::error::RepositoryError;
use orchestrion_types::event::EngineEvent;
use orchestrion_types::job::{Job, JobState};
use orchestrion_types::variables::Variables;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::RetryPolicy;
use super::{Deferred, JobContext, JobHandler};
use crate::error::{EngineError, ErrorClass};
use crate::event::EventBus;
use crate::repository::EngineStore;

/// Time a handler gets to wind down after its cancel token trips.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub struct JobScheduler<S: EngineStore> {
    store: Arc<S>,
    events: EventBus,
    settings: JobSettings,
    node_id: String,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    wake: Arc<Notify>,
}

impl<S: EngineStore> JobScheduler<S> {
    pub fn new(
        store: Arc<S>,
        events: EventBus,
        settings: JobSettings,
        node_id: impl Into<String>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            events,
            settings,
            node_id: node_id.into(),
            handlers: DashMap::new(),
            wake,
        }
    }

    pub fn register(&self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        tracing::debug!(%job_type, "job handler registered");
        self.handlers.insert(job_type, handler);
    }

    pub fn has_handler(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn policy(&self, job_type: &str) -> RetryPolicy {
        RetryPolicy::from(&self.settings.policy_for(job_type))
    }

    /// Store a new job due now and wake the run loop.
    pub async fn enqueue(
        &self,
        job_type: &str,
        input: Variables,
        process_id: Option<Uuid>,
    ) -> Result<Job, EngineError> {
        if !self.has_handler(job_type) {
            return Err(EngineError::NoHandler(job_type.to_string()));
        }
        let now = Utc::now();
        let max_attempts = self.policy(job_type).max_attempts;
        let job = Job::new(job_type, input, max_attempts, process_id, now, now);
        self.store.insert_job(&job).await?;
        tracing::debug!(job_id = %job.id, %job_type, max_attempts, "job enqueued");
        self.wake.notify_one();
        Ok(job)
    }

    /// Claim and run one job inline, returning its stored state afterwards.
    ///
    /// A job that cannot be claimed (not due, or leased elsewhere) is
    /// returned as it is.
    pub async fn run_now(&self, job_id: Uuid) -> Result<Job, EngineError> {
        let job = self
            .store
            .get_job(&job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", job_id))?;
        self.claim_and_run(job).await?;
        self.store
            .get_job(&job_id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", job_id))
    }

    /// Run every due job inline, one after another. Returns how many
    /// attempts were made.
    pub async fn run_pending(&self) -> Result<usize, EngineError> {
        let mut attempts = 0;
        loop {
            let due = self
                .store
                .find_due_jobs(Utc::now(), self.batch_size())
                .await?;
            if due.is_empty() {
                return Ok(attempts);
            }
            let mut progressed = false;
            for job in due {
                if self.claim_and_run(job).await? {
                    attempts += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return Ok(attempts);
            }
        }
    }

    /// Poll, claim and execute jobs until `shutdown` trips. In-flight jobs
    /// are awaited before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.settings.worker_pool_size.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut interval = tokio::time::interval(Duration::from_millis(self.settings.poll_interval_ms.max(10)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(node_id = %self.node_id, workers = self.settings.worker_pool_size, "job scheduler started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "job task panicked");
                    }
                    continue;
                }
            }

            let free = semaphore.available_permits();
            if free == 0 {
                continue;
            }
            let due = match self.store.find_due_jobs(Utc::now(), free as u32).await {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to poll due jobs");
                    continue;
                }
            };
            for job in due {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let this = Arc::clone(&self);
                tasks.spawn(async move {
                    let _permit = permit;
                    let job_id = job.id;
                    if let Err(e) = this.claim_and_run(job).await {
                        tracing::warn!(%job_id, error = %e, "job attempt could not be recorded");
                    }
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "job task panicked");
            }
        }
        tracing::info!(node_id = %self.node_id, "job scheduler stopped");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn batch_size(&self) -> u32 {
        (self.settings.worker_pool_size.max(1) * 4) as u32
    }

    fn lease_until(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.settings.lease()).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Returns whether an attempt was made.
    async fn claim_and_run(&self, job: Job) -> Result<bool, EngineError> {
        let now = Utc::now();
        if job.state == JobState::Running && job.attempts >= job.max_attempts && job.is_claimable(now) {
            self.expire(job).await?;
            return Ok(false);
        }

        let owner = format!("{}/{}", self.node_id, Uuid::now_v7());
        let Some(claimed) = self
            .store
            .claim_job(&job.id, &owner, self.lease_until(), now)
            .await?
        else {
            tracing::debug!(job_id = %job.id, "job already claimed elsewhere");
            return Ok(false);
        };
        self.execute(claimed, owner).await?;
        Ok(true)
    }

    /// Fail a stale job that already used up its attempts.
    async fn expire(&self, mut job: Job) -> Result<(), EngineError> {
        self.settle(&job, "lease expired").await?;
        let now = Utc::now();
        job.failure = Some(Failure::new("lease expired", None, now));
        job.transition(JobState::Failed, now)?;
        match self.store.update_job(&job).await {
            Ok(_) => {
                tracing::warn!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "stale job failed, lease expired");
                self.events.publish(EngineEvent::JobFailed {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    attempt: job.attempts,
                    reason: "lease expired".to_string(),
                    will_retry: false,
                });
                Ok(())
            }
            Err(RepositoryError::Conflict(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Hand a job that failed for good back to its handler.
    async fn settle(&self, job: &Job, reason: &str) -> Result<(), EngineError> {
        let Some(handler) = self.handlers.get(&job.job_type).map(|h| Arc::clone(&h)) else {
            return Ok(());
        };
        handler
            .exhausted(job, reason)
            .await
            .map_err(|e| EngineError::Execution {
                message: format!("job {} could not settle its failure", job.id),
                cause: Some(e.into()),
            })
    }

    async fn execute(&self, job: Job, owner: String) -> Result<(), EngineError> {
        let job_id = job.id;
        let attempt = job.attempts;
        tracing::debug!(%job_id, job_type = %job.job_type, attempt, "job attempt started");

        let handler = self.handlers.get(&job.job_type).map(|h| Arc::clone(&h));
        let result = match handler {
            None => Err(anyhow::anyhow!("no handler registered for job type '{}'", job.job_type)),
            Some(handler) => self.invoke(handler, &job, &owner).await,
        };
        self.record(job, result).await
    }

    /// Run the handler with a heartbeat and a deadline.
    async fn invoke(&self, handler: Arc<dyn JobHandler>, job: &Job, owner: &str) -> anyhow::Result<Variables> {
        let cancel = CancellationToken::new();
        let ctx = JobContext {
            job: job.clone(),
            cancel: cancel.clone(),
        };
        let timeout = Duration::from_secs(self.settings.job_timeout_secs.max(1));

        let heartbeat = {
            let store = Arc::clone(&self.store);
            let job_id = job.id;
            let owner = owner.to_string();
            let every = Duration::from_millis(self.settings.heartbeat_interval_ms.max(10));
            let lease = chrono::Duration::from_std(self.settings.lease()).unwrap_or_else(|_| chrono::Duration::seconds(30));
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    match store.extend_job_lease(&job_id, &owner, Utc::now() + lease).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(%job_id, "job lease lost, heartbeat stopped");
                            break;
                        }
                        Err(e) => tracing::warn!(%job_id, error = %e, "job heartbeat failed"),
                    }
                }
            })
        };
        let deadline = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };

        let result = match tokio::time::timeout(timeout + CANCEL_GRACE, handler.run(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("job timed out after {}s", timeout.as_secs())),
        };
        heartbeat.abort();
        deadline.abort();
        result
    }

    /// Write the attempt's outcome. A revision conflict means the lease was
    /// taken over; the result is discarded.
    async fn record(&self, mut job: Job, result: anyhow::Result<Variables>) -> Result<(), EngineError> {
        let now = Utc::now();
        let event = match result {
            Ok(output) => {
                job.output = output;
                job.failure = None;
                job.transition(JobState::Completed, now)?;
                Some(EngineEvent::JobCompleted {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                })
            }
            Err(e) if e.is::<Deferred>() => {
                job.transition(JobState::Created, now)?;
                job.attempts = job.attempts.saturating_sub(1);
                job.run_at = now;
                tracing::debug!(job_id = %job.id, job_type = %job.job_type, reason = %e, "job deferred");
                None
            }
            Err(e) => {
                let reason = e.to_string();
                job.failure = Some(Failure::new(reason.clone(), Some(format!("{e:?}")), now));
                let policy = self.policy(&job.job_type);
                let will_retry = job.attempts < job.max_attempts;
                if will_retry {
                    job.transition(JobState::Created, now)?;
                    job.run_at = now + policy.chrono_delay(job.attempts);
                    tracing::info!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, run_at = %job.run_at, error = %reason, "job attempt failed, retrying");
                } else {
                    if let Err(e) = self.settle(&job, &reason).await {
                        // Left running; the lease runs out and `expire` settles it.
                        tracing::warn!(job_id = %job.id, job_type = %job.job_type, error = %e, "job failure not settled");
                        return Ok(());
                    }
                    job.transition(JobState::Failed, now)?;
                    tracing::warn!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, class = ?ErrorClass::Terminal, error = %reason, "job failed");
                }
                Some(EngineEvent::JobFailed {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    attempt: job.attempts,
                    reason,
                    will_retry,
                })
            }
        };

        match self.store.update_job(&job).await {
            Ok(_) => {
                if matches!(event, Some(EngineEvent::JobCompleted { .. })) {
                    tracing::debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
                }
                if let Some(event) = event {
                    self.events.publish(event);
                }
                Ok(())
            }
            Err(RepositoryError::Conflict(_)) => {
                tracing::debug!(job_id = %job.id, class = ?ErrorClass::Concurrency, "job lease taken over, result discarded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
