//! In-process service tasks.
//!
//! A service task names a handler registered on the engine. Entering the
//! task schedules an `activity` job; [`ActivityJobHandler`] runs the handler
//! outside the process lock and reports the result back as a transition.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use orchestrion_types::job::{Job, job_types};
use orchestrion_types::variables::Variables;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::engine::{PreparedCall, ProcessEngine};
use crate::error::EngineError;
use crate::job::{Deferred, JobContext, JobHandler};
use crate::repository::EngineStore;

/// What a service handler sees of the activity it runs for.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub process_id: Uuid,
    pub activity_id: Uuid,
    /// Activity id within the definition.
    pub definition_id: String,
    pub business_key: Option<String>,
    /// Process scope overlaid by the activity's local scopes.
    pub variables: Variables,
    pub loop_index: Option<u32>,
    /// Tripped when the process is cancelled or terminated, or the job
    /// runs out of time.
    pub cancel: CancellationToken,
}

/// Work behind a service task. The returned variables merge into the
/// process scope.
pub trait ServiceHandler: Send + Sync {
    fn execute(&self, ctx: ServiceContext) -> BoxFuture<'_, anyhow::Result<Variables>>;
}

/// Adapter turning an async closure into a [`ServiceHandler`].
pub struct ServiceFn<F>(F);

pub fn service_fn<F, Fut>(f: F) -> Arc<dyn ServiceHandler>
where
    F: Fn(ServiceContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Variables>> + Send + 'static,
{
    Arc::new(ServiceFn(f))
}

impl<F, Fut> ServiceHandler for ServiceFn<F>
where
    F: Fn(ServiceContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Variables>> + Send + 'static,
{
    fn execute(&self, ctx: ServiceContext) -> BoxFuture<'_, anyhow::Result<Variables>> {
        Box::pin((self.0)(ctx))
    }
}

#[derive(Debug, Deserialize)]
struct ActivityJobInput {
    process_id: Uuid,
    activity_id: Uuid,
}

/// Job handler for the `activity` job type.
///
/// Activity jobs run once: the retry budget lives on the activity, and a
/// failed attempt schedules a fresh job through the engine.
pub struct ActivityJobHandler<S: EngineStore> {
    engine: Arc<ProcessEngine<S>>,
}

impl<S: EngineStore> ActivityJobHandler<S> {
    pub fn new(engine: Arc<ProcessEngine<S>>) -> Self {
        Self { engine }
    }

    async fn run_job(&self, ctx: JobContext) -> anyhow::Result<Variables> {
        let input: ActivityJobInput =
            serde_json::from_value(serde_json::Value::Object(ctx.job.input.clone()))?;
        let job_id = ctx.job.id;
        let call = match self
            .engine
            .prepare_service_call(input.process_id, input.activity_id, job_id)
            .await?
        {
            PreparedCall::Ready(call) => call,
            PreparedCall::Suspended => {
                return Err(Deferred(format!("process {} is suspended", input.process_id)).into());
            }
            PreparedCall::Stale => {
                tracing::debug!(%job_id, activity_id = %input.activity_id, "stale activity job skipped");
                return Ok(Variables::new());
            }
        };

        let Some(handler) = call.handler else {
            let reason = format!("no service handler registered as '{}'", call.handler_name);
            self.engine
                .fail_service(input.process_id, input.activity_id, job_id, &reason, None, true)
                .await?;
            anyhow::bail!(reason);
        };

        let process_cancel = call.context.cancel.clone();
        let result = tokio::select! {
            result = handler.execute(call.context) => result,
            _ = process_cancel.cancelled() => {
                tracing::debug!(%job_id, process_id = %input.process_id, "service call abandoned, process cancelled");
                return Ok(Variables::new());
            }
            _ = ctx.cancel.cancelled() => Err(anyhow::anyhow!("service call timed out")),
        };

        match result {
            Ok(output) => {
                self.engine
                    .complete_service(input.process_id, input.activity_id, job_id, output.clone())
                    .await?;
                Ok(output)
            }
            Err(e) => {
                let reason = e.to_string();
                let trace = format!("{e:?}");
                self.engine
                    .fail_service(input.process_id, input.activity_id, job_id, &reason, Some(trace), false)
                    .await?;
                Err(e)
            }
        }
    }
}

impl<S: EngineStore> JobHandler for ActivityJobHandler<S> {
    fn job_type(&self) -> &str {
        job_types::ACTIVITY
    }

    fn run(&self, ctx: JobContext) -> BoxFuture<'_, anyhow::Result<Variables>> {
        Box::pin(self.run_job(ctx))
    }

    /// A job that dies without reporting (lease lost, store error while
    /// reporting) still owns its activity. Fail the activity so its retry
    /// budget decides between a fresh job and an incident.
    fn exhausted<'a>(&'a self, job: &'a Job, reason: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let input: ActivityJobInput = serde_json::from_value(serde_json::Value::Object(job.input.clone()))?;
            match self
                .engine
                .fail_service(input.process_id, input.activity_id, job.id, reason, None, false)
                .await
            {
                Ok(true) => {
                    tracing::warn!(job_id = %job.id, activity_id = %input.activity_id, reason, "activity failed by its abandoned job");
                    Ok(())
                }
                Ok(false) | Err(EngineError::NotFound { .. }) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
