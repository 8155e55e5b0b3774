//! Engine assembly.
//!
//! [`Orchestrator`] wires the process engine, job scheduler, external task
//! gateway, migration engine and compaction job over one store, registers
//! the built-in job handlers, and answers every administrative command
//! through its [`CommandBus`]. `serve` runs the background loops until the
//! shutdown token trips.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use orchestrion_types::command::{
    ApplyMigrationCommand, CancelProcessCommand, DeployDefinitionCommand, GenerateMigrationPlanCommand,
    PlanMigrationCommand, RecoverProcessCommand, RunJobCommand, ScheduleMigrationCommand, SetVariablesCommand,
    StartProcessCommand, SuspendDefinitionCommand, SuspendProcessCommand, TerminateProcessCommand,
};
use orchestrion_types::compaction::{CompactionCommand, CompactionReport};
use orchestrion_types::config::EngineConfig;
use orchestrion_types::job::{Job, JobState, job_types};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::command::{Command, CommandBus};
use crate::compaction::CompactionJob;
use crate::error::EngineError;
use crate::event::EventBus;
use crate::external::{ExternalTaskGateway, ExternalTaskWorker, WorkerRegistry};
use crate::job::{CronScheduler, JobScheduler};
use crate::job::cron::CronCallback;
use crate::migration::{MigrationEngine, MigrationJobHandler};
use crate::repository::EngineStore;
use crate::runtime::{ActivityJobHandler, ProcessEngine};

/// Timed-out activities handled per sweep.
const SWEEP_BATCH: u32 = 100;

pub struct Orchestrator<S: EngineStore> {
    config: EngineConfig,
    engine: Arc<ProcessEngine<S>>,
    scheduler: Arc<JobScheduler<S>>,
    gateway: Arc<ExternalTaskGateway<S>>,
    migrations: Arc<MigrationEngine<S>>,
    compaction: Arc<CompactionJob<S>>,
    commands: CommandBus,
}

impl<S: EngineStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let events = EventBus::default();
        let node_id = config.engine.node_id.clone();

        let engine = Arc::new(ProcessEngine::new(
            Arc::clone(&store),
            events.clone(),
            config.engine.clone(),
        ));
        let scheduler = Arc::new(JobScheduler::new(
            Arc::clone(&store),
            events.clone(),
            config.jobs.clone(),
            node_id.clone(),
            engine.job_wake(),
        ));
        let gateway = Arc::new(ExternalTaskGateway::new(
            Arc::clone(&engine),
            config.external_tasks.clone(),
        ));
        let migrations = Arc::new(MigrationEngine::new(Arc::clone(&engine)));
        let compaction = Arc::new(CompactionJob::new(
            store,
            events,
            config.compaction.clone(),
            node_id,
        ));

        scheduler.register(Arc::new(ActivityJobHandler::new(Arc::clone(&engine))));
        scheduler.register(Arc::clone(&compaction) as _);
        scheduler.register(Arc::new(MigrationJobHandler::new(Arc::clone(&migrations))));

        let commands = build_commands(&engine, &scheduler, &migrations);

        Self {
            config,
            engine,
            scheduler,
            gateway,
            migrations,
            compaction,
            commands,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<ProcessEngine<S>> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler<S>> {
        &self.scheduler
    }

    pub fn gateway(&self) -> &Arc<ExternalTaskGateway<S>> {
        &self.gateway
    }

    pub fn migrations(&self) -> &Arc<MigrationEngine<S>> {
        &self.migrations
    }

    pub fn events(&self) -> &EventBus {
        self.engine.events()
    }

    pub fn commands(&self) -> &CommandBus {
        &self.commands
    }

    /// Shorthand for `commands().execute(command)`.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, EngineError> {
        self.commands.execute(command).await
    }

    /// Run the job loop, the timeout sweep, the in-process external task
    /// worker and, when enabled, the compaction cron trigger until
    /// `shutdown` trips. Background tasks are awaited before returning.
    pub async fn serve(&self, workers: WorkerRegistry, shutdown: CancellationToken) -> Result<(), EngineError> {
        let mut tasks = JoinSet::new();

        tasks.spawn(Arc::clone(&self.scheduler).run(shutdown.child_token()));

        let engine = Arc::clone(&self.engine);
        let sweep_token = shutdown.child_token();
        let every = Duration::from_millis(self.config.engine.timeout_sweep_interval_ms.max(10));
        tasks.spawn(async move { sweep_timeouts(engine, every, sweep_token).await });

        if !workers.is_empty() {
            let worker_id = format!("{}-worker", self.config.engine.node_id);
            let worker = Arc::new(ExternalTaskWorker::new(Arc::clone(&self.gateway), workers, worker_id));
            tasks.spawn(worker.run(shutdown.child_token()));
        }

        let cron = CronScheduler::new();
        if self.compaction.settings().enabled {
            cron.start().await?;
            let scheduler = Arc::clone(&self.scheduler);
            let callback: CronCallback = Arc::new(move |_: String, _: DateTime<Utc>| -> BoxFuture<'static, ()> {
                let scheduler = Arc::clone(&scheduler);
                Box::pin(async move {
                    let input = CompactionJob::<S>::input(&CompactionCommand::cron());
                    if let Err(e) = scheduler.enqueue(job_types::COMPACTION, input, None).await {
                        tracing::warn!(error = %e, "failed to enqueue scheduled compaction");
                    }
                })
            });
            cron.schedule("compaction", &self.compaction.settings().cron, callback)
                .await?;
        }

        tracing::info!(node = %self.config.engine.node_id, "orchestrator serving");
        shutdown.cancelled().await;
        tracing::info!("orchestrator shutting down");

        if let Err(e) = cron.stop().await {
            tracing::warn!(error = %e, "cron scheduler did not stop cleanly");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "background task panicked");
            }
        }
        tracing::info!("orchestrator stopped");
        Ok(())
    }
}

async fn sweep_timeouts<S: EngineStore>(engine: Arc<ProcessEngine<S>>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match engine.sweep_timeouts(SWEEP_BATCH).await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "activities timed out"),
            Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn build_commands<S: EngineStore>(
    engine: &Arc<ProcessEngine<S>>,
    scheduler: &Arc<JobScheduler<S>>,
    migrations: &Arc<MigrationEngine<S>>,
) -> CommandBus {
    let mut bus = CommandBus::new();

    let e = Arc::clone(engine);
    bus.register_fn(move |c: DeployDefinitionCommand| {
        let e = Arc::clone(&e);
        async move { e.deploy(c.definition).await }
    });
    let e = Arc::clone(engine);
    bus.register_fn(move |c: StartProcessCommand| {
        let e = Arc::clone(&e);
        async move { e.start(c).await }
    });
    let e = Arc::clone(engine);
    bus.register_fn(move |c: CancelProcessCommand| {
        let e = Arc::clone(&e);
        async move { e.cancel(c.process_id).await }
    });
    let e = Arc::clone(engine);
    bus.register_fn(move |c: TerminateProcessCommand| {
        let e = Arc::clone(&e);
        async move { e.terminate(c.process_id).await }
    });
    let e = Arc::clone(engine);
    bus.register_fn(move |c: RecoverProcessCommand| {
        let e = Arc::clone(&e);
        async move { e.recover(c.process_id).await }
    });
    let e = Arc::clone(engine);
    bus.register_fn(move |c: SuspendProcessCommand| {
        let e = Arc::clone(&e);
        async move { e.set_suspended(c.process_id, c.suspended).await }
    });
    let e = Arc::clone(engine);
    bus.register_fn(move |c: SuspendDefinitionCommand| {
        let e = Arc::clone(&e);
        async move { e.set_suspended_by_key(&c.definition_key, c.suspended).await }
    });
    let e = Arc::clone(engine);
    bus.register_fn(move |c: SetVariablesCommand| {
        let e = Arc::clone(&e);
        async move { e.set_variables(c.process_id, c.variables).await }
    });

    let s = Arc::clone(scheduler);
    bus.register_fn(move |c: RunJobCommand| {
        let s = Arc::clone(&s);
        async move { run_job(&s, &c.job_type, c.input).await }
    });
    let s = Arc::clone(scheduler);
    bus.register_fn(move |c: CompactionCommand| {
        let s = Arc::clone(&s);
        async move {
            let job = run_job(&s, job_types::COMPACTION, CompactionJob::<S>::input(&c)).await?;
            compaction_report(job)
        }
    });

    let m = Arc::clone(migrations);
    bus.register_fn(move |c: PlanMigrationCommand| {
        let m = Arc::clone(&m);
        async move { m.plan(c).await }
    });
    let m = Arc::clone(migrations);
    bus.register_fn(move |c: GenerateMigrationPlanCommand| {
        let m = Arc::clone(&m);
        async move { m.generate(c).await }
    });
    let m = Arc::clone(migrations);
    bus.register_fn(move |c: ApplyMigrationCommand| {
        let m = Arc::clone(&m);
        async move { m.apply(c).await }
    });
    let (e, s) = (Arc::clone(engine), Arc::clone(scheduler));
    bus.register_fn(move |c: ScheduleMigrationCommand| {
        let (e, s) = (Arc::clone(&e), Arc::clone(&s));
        async move {
            if e.store().get_plan(&c.plan_id).await?.is_none() {
                return Err(EngineError::not_found("migration plan", c.plan_id));
            }
            let job = s
                .enqueue(job_types::PROCESS_MIGRATION, MigrationJobHandler::<S>::input(c.plan_id), None)
                .await?;
            tracing::info!(plan_id = %c.plan_id, job_id = %job.id, "migration scheduled");
            Ok(job)
        }
    });

    bus
}

async fn run_job<S: EngineStore>(
    scheduler: &JobScheduler<S>,
    job_type: &str,
    input: orchestrion_types::variables::Variables,
) -> Result<Job, EngineError> {
    let job = scheduler.enqueue(job_type, input, None).await?;
    scheduler.run_now(job.id).await
}

fn compaction_report(job: Job) -> Result<CompactionReport, EngineError> {
    if job.state != JobState::Completed {
        let reason = job
            .failure
            .map(|f| f.reason)
            .unwrap_or_else(|| format!("compaction job {} is {}", job.id, job.state));
        return Err(EngineError::execution(reason));
    }
    serde_json::from_value(serde_json::Value::Object(job.output))
        .map_err(|e| EngineError::execution(format!("unreadable compaction report: {e}")))
}
