//! Event bus distributing `EngineEvent` to subscribers and handlers.
//!
//! Two delivery paths share one `publish`:
//! - raw `broadcast` receivers, for streaming observers such as `orch serve`;
//! - registered [`EventHandler`]s, each with its own unbounded FIFO queue and
//!   drain task. A failing or panicking handler is logged and skipped; it
//!   never affects other handlers or the publisher.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use orchestrion_types::event::{EngineEvent, EventKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Capacity of the raw broadcast channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Asynchronous reaction to committed engine events.
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn handle(&self, event: EngineEvent) -> BoxFuture<'_, anyhow::Result<()>>;
}

pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
    handlers: Arc<DashMap<EventKind, Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            handlers: Arc::new(DashMap::new()),
        }
    }

    /// A receiver for every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Register `handler` for `kinds` and spawn its drain task.
    ///
    /// Events of one kind reach the handler in publish order. Must be called
    /// from within a tokio runtime.
    pub fn register(&self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<EngineEvent>();
        for kind in kinds {
            self.handlers.entry(*kind).or_default().push(tx.clone());
        }
        drop(tx);

        tracing::debug!(handler = handler.name(), ?kinds, "event handler registered");

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let kind = event.kind();
                match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(handler = handler.name(), ?kind, error = %e, "event handler failed");
                    }
                    Err(_) => {
                        tracing::error!(handler = handler.name(), ?kind, "event handler panicked");
                    }
                }
            }
        })
    }

    /// Publish to subscribers and registered handlers. Never blocks and
    /// never fails; with nobody listening the event is dropped.
    pub fn publish(&self, event: EngineEvent) {
        if let Some(queues) = self.handlers.get(&event.kind()) {
            for queue in queues.iter() {
                let _ = queue.send(event.clone());
            }
        }
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .field("handled_kinds", &self.handlers.len())
            .finish()
    }
}
