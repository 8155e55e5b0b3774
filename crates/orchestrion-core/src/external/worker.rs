//! In-process external-task worker.
//!
//! Handlers are registered explicitly per `(topic, definition key)` at
//! startup. The worker polls the gateway exactly like a remote worker would
//! and reports each outcome through `complete`/`fail`, or `throw_error` when
//! the handler answers with a business error code.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use orchestrion_types::task::{ExternalTask, TaskFailure};
use orchestrion_types::variables::Variables;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::gateway::{ExternalTaskGateway, FetchRequest};
use crate::error::EngineError;
use crate::repository::EngineStore;

/// Work done for one locked external task.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: ExternalTask) -> BoxFuture<'_, Result<Variables, TaskFailure>>;
}

#[derive(Clone)]
pub struct Subscription {
    pub topic: String,
    /// All definitions when `None`.
    pub definition_key: Option<String>,
    pub handler: Arc<dyn TaskHandler>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("definition_key", &self.definition_key)
            .finish_non_exhaustive()
    }
}

/// Explicit `(topic, definition key)` → handler table.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    subscriptions: Vec<Subscription>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, replacing an existing one for the same pair.
    pub fn register(&mut self, topic: impl Into<String>, definition_key: Option<String>, handler: Arc<dyn TaskHandler>) {
        let topic = topic.into();
        self.subscriptions
            .retain(|s| !(s.topic == topic && s.definition_key == definition_key));
        tracing::debug!(%topic, definition_key = ?definition_key, "external task handler registered");
        self.subscriptions.push(Subscription {
            topic,
            definition_key,
            handler,
        });
    }

    /// Most specific handler for a task: an exact key match beats a
    /// topic-wide one.
    pub fn resolve(&self, topic: &str, definition_key: &str) -> Option<Arc<dyn TaskHandler>> {
        let exact = self
            .subscriptions
            .iter()
            .find(|s| s.topic == topic && s.definition_key.as_deref() == Some(definition_key));
        exact
            .or_else(|| {
                self.subscriptions
                    .iter()
                    .find(|s| s.topic == topic && s.definition_key.is_none())
            })
            .map(|s| Arc::clone(&s.handler))
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

pub struct ExternalTaskWorker<S: EngineStore> {
    gateway: Arc<ExternalTaskGateway<S>>,
    registry: WorkerRegistry,
    worker_id: String,
}

impl<S: EngineStore> ExternalTaskWorker<S> {
    pub fn new(gateway: Arc<ExternalTaskGateway<S>>, registry: WorkerRegistry, worker_id: impl Into<String>) -> Self {
        Self {
            gateway,
            registry,
            worker_id: worker_id.into(),
        }
    }

    /// Fetch once for every subscription and handle what came back.
    /// Returns how many tasks were handled.
    pub async fn poll_once(&self) -> Result<usize, EngineError> {
        let mut handled = 0;
        for subscription in self.registry.subscriptions() {
            let mut request = FetchRequest::new(subscription.topic.clone(), self.worker_id.clone());
            request.definition_key = subscription.definition_key.clone();
            let tasks = self.gateway.fetch_and_lock(&request).await?;

            let mut running = JoinSet::new();
            for task in tasks {
                let Some(handler) = self.registry.resolve(&task.topic, &task.definition_key) else {
                    continue;
                };
                running.spawn(async move {
                    let result = handler.handle(task.clone()).await;
                    (task, result)
                });
            }
            while let Some(joined) = running.join_next().await {
                match joined {
                    Ok((task, result)) => {
                        self.report(task, result).await;
                        handled += 1;
                    }
                    Err(e) => tracing::error!(error = %e, "external task handler panicked"),
                }
            }
        }
        Ok(handled)
    }

    /// Poll until `shutdown` trips.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let every = Duration::from_millis(self.gateway.settings().worker_poll_interval_ms.max(10));
        tracing::info!(worker = %self.worker_id, subscriptions = self.registry.subscriptions().len(), "external task worker started");
        loop {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(worker = %self.worker_id, handled = n, "external tasks handled"),
                Err(e) => tracing::warn!(worker = %self.worker_id, error = %e, "external task poll failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
            }
        }
        tracing::info!(worker = %self.worker_id, "external task worker stopped");
    }

    async fn report(&self, task: ExternalTask, result: Result<Variables, TaskFailure>) {
        let outcome = match result {
            Ok(variables) => self.gateway.complete(task.id, &self.worker_id, variables).await,
            Err(TaskFailure {
                error_code: Some(code),
                ..
            }) => {
                self.gateway
                    .throw_error(task.id, &self.worker_id, &code, Variables::new())
                    .await
            }
            Err(failure) => self.gateway.fail(task.id, &self.worker_id, failure).await.map(|_| ()),
        };
        if let Err(e) = outcome {
            // A lost lock means another worker owns the task now.
            match e {
                EngineError::Lock(_) => tracing::debug!(task_id = %task.id, error = %e, "external task result discarded"),
                other => tracing::warn!(task_id = %task.id, error = %other, "external task result not recorded"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::repository::MemoryStore;
    use crate::runtime::ProcessEngine;
    use chrono::Utc;
    use orchestrion_types::command::{DefinitionRef, StartProcessCommand};
    use orchestrion_types::config::{EngineSettings, ExternalTaskSettings};
    use orchestrion_types::definition::{ActivityDefinition, ActivityKind, ProcessDefinition, SequenceFlow};
    use orchestrion_types::process::ProcessState;
    use orchestrion_types::variables;
    use serde_json::json;
    use uuid::Uuid;

    /// Answers with a fixed outcome and tags it with its name.
    struct Fixed {
        name: &'static str,
        fail: bool,
    }

    impl TaskHandler for Fixed {
        fn handle(&self, _task: ExternalTask) -> BoxFuture<'_, Result<Variables, TaskFailure>> {
            Box::pin(async move {
                if self.fail {
                    return Err(TaskFailure {
                        retries_left: Some(0),
                        ..TaskFailure::new(format!("{} refused", self.name))
                    });
                }
                Ok(variables::from_value(json!({ "handled_by": self.name })))
            })
        }
    }

    fn fixed(name: &'static str, fail: bool) -> Arc<dyn TaskHandler> {
        Arc::new(Fixed { name, fail })
    }

    fn handled_by(registry: &WorkerRegistry, topic: &str, key: &str) -> Option<&'static str> {
        // Handlers are told apart by the pointer they were registered with.
        let resolved = registry.resolve(topic, key)?;
        registry
            .subscriptions()
            .iter()
            .find(|s| Arc::ptr_eq(&s.handler, &resolved))
            .map(|s| match s.definition_key.as_deref() {
                Some(_) => "exact",
                None => "topic",
            })
    }

    #[test]
    fn resolve_prefers_the_exact_definition_key() {
        let mut registry = WorkerRegistry::new();
        registry.register("ship", None, fixed("any", false));
        registry.register("ship", Some("express".to_string()), fixed("express", false));

        assert_eq!(handled_by(&registry, "ship", "express"), Some("exact"));
        assert_eq!(handled_by(&registry, "ship", "standard"), Some("topic"));
        assert_eq!(handled_by(&registry, "pack", "express"), None);
    }

    #[test]
    fn register_replaces_the_same_pair() {
        let mut registry = WorkerRegistry::new();
        registry.register("ship", None, fixed("old", false));
        registry.register("ship", None, fixed("new", false));
        registry.register("ship", Some("express".to_string()), fixed("express", false));
        assert_eq!(registry.subscriptions().len(), 2);
    }

    #[test]
    fn key_only_subscription_does_not_cover_other_keys() {
        let mut registry = WorkerRegistry::new();
        registry.register("ship", Some("express".to_string()), fixed("express", false));
        assert!(registry.resolve("ship", "standard").is_none());
    }

    fn ship_definition(key: &str) -> ProcessDefinition {
        ProcessDefinition {
            id: Uuid::now_v7(),
            key: key.to_string(),
            version: 0,
            name: None,
            activities: vec![
                ActivityDefinition::new("start", ActivityKind::StartEvent),
                ActivityDefinition::new("ship", ActivityKind::ExternalTask {
                    topic: "ship".to_string(),
                }),
                ActivityDefinition::new("end", ActivityKind::EndEvent),
            ],
            flows: vec![
                SequenceFlow::new("f1", "start", "ship"),
                SequenceFlow::new("f2", "ship", "end"),
            ],
            variables: Variables::new(),
            deployed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn poll_once_reports_each_outcome() {
        let engine = Arc::new(ProcessEngine::new(
            Arc::new(MemoryStore::new()),
            EventBus::default(),
            EngineSettings::default(),
        ));
        let mut started = Vec::new();
        for key in ["standard", "express"] {
            engine.deploy(ship_definition(key)).await.unwrap();
            let process = engine
                .start(StartProcessCommand {
                    definition: DefinitionRef::latest(key),
                    variables: Variables::new(),
                    business_key: None,
                })
                .await
                .unwrap();
            started.push(process.id);
        }

        let mut registry = WorkerRegistry::new();
        registry.register("ship", None, fixed("courier", false));
        registry.register("ship", Some("express".to_string()), fixed("express", true));
        let gateway = Arc::new(ExternalTaskGateway::new(Arc::clone(&engine), ExternalTaskSettings::default()));
        let worker = ExternalTaskWorker::new(gateway, registry, "worker-1");

        assert_eq!(worker.poll_once().await.unwrap(), 2);
        assert_eq!(worker.poll_once().await.unwrap(), 0);

        let standard = engine.process(started[0]).await.unwrap();
        assert_eq!(standard.state, ProcessState::Completed);
        assert_eq!(standard.variables["handled_by"], json!("courier"));

        let express = engine.process(started[1]).await.unwrap();
        assert_eq!(express.state, ProcessState::Incident);
        let incidents = engine.incidents(started[1]).await.unwrap();
        assert_eq!(incidents[0].reason, "express refused");
    }

    struct OutOfStock;

    impl TaskHandler for OutOfStock {
        fn handle(&self, _task: ExternalTask) -> BoxFuture<'_, Result<Variables, TaskFailure>> {
            Box::pin(async {
                Err(TaskFailure {
                    error_code: Some("NO_STOCK".to_string()),
                    ..TaskFailure::new("warehouse empty")
                })
            })
        }
    }

    #[tokio::test]
    async fn error_code_answer_takes_the_boundary_path() {
        let engine = Arc::new(ProcessEngine::new(
            Arc::new(MemoryStore::new()),
            EventBus::default(),
            EngineSettings::default(),
        ));
        let mut def = ship_definition("standard");
        def.activities.push(ActivityDefinition::new("no-stock", ActivityKind::ErrorBoundaryEvent {
            attached_to: "ship".to_string(),
            error_code: Some("NO_STOCK".to_string()),
        }));
        def.activities.push(ActivityDefinition::new("backorder", ActivityKind::EndEvent));
        def.flows.push(SequenceFlow::new("f3", "no-stock", "backorder"));
        engine.deploy(def).await.unwrap();
        let process = engine
            .start(StartProcessCommand {
                definition: DefinitionRef::latest("standard"),
                variables: Variables::new(),
                business_key: None,
            })
            .await
            .unwrap();

        let mut registry = WorkerRegistry::new();
        registry.register("ship", None, Arc::new(OutOfStock));
        let gateway = Arc::new(ExternalTaskGateway::new(Arc::clone(&engine), ExternalTaskSettings::default()));
        let worker = ExternalTaskWorker::new(gateway, registry, "worker-1");
        assert_eq!(worker.poll_once().await.unwrap(), 1);

        let done = engine.process(process.id).await.unwrap();
        assert_eq!(done.state, ProcessState::Completed);
        let backorder = engine
            .activities(process.id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.definition_id == "backorder");
        assert!(backorder.is_some());
    }
}
