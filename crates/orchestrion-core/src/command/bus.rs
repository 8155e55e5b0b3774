//! Typed command bus.
//!
//! Every command type has exactly one handler, registered at assembly time.
//! `execute` awaits the handler and returns its result to the caller; there
//! is no queueing and no fan-out. A panicking handler fails its command
//! with [`EngineError::Execution`] and leaves the bus usable.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::EngineError;

/// A request with a single typed answer.
pub trait Command: Send + 'static {
    type Output: Send + 'static;
}

pub trait CommandHandler<C: Command>: Send + Sync {
    fn handle(&self, command: C) -> BoxFuture<'_, Result<C::Output, EngineError>>;
}

/// Adapts an async closure into a [`CommandHandler`].
struct FnHandler<F>(F);

impl<C, F, Fut> CommandHandler<C> for FnHandler<F>
where
    C: Command,
    F: Fn(C) -> Fut + Send + Sync,
    Fut: Future<Output = Result<C::Output, EngineError>> + Send + 'static,
{
    fn handle(&self, command: C) -> BoxFuture<'_, Result<C::Output, EngineError>> {
        Box::pin((self.0)(command))
    }
}

#[derive(Default)]
pub struct CommandBus {
    // TypeId of C -> Arc<dyn CommandHandler<C>>
    handlers: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `C`, replacing any previous one.
    pub fn register<C: Command>(&mut self, handler: Arc<dyn CommandHandler<C>>) {
        tracing::debug!(command = type_name::<C>(), "command handler registered");
        self.handlers.insert(TypeId::of::<C>(), Box::new(handler));
    }

    pub fn register_fn<C, F, Fut>(&mut self, f: F)
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C::Output, EngineError>> + Send + 'static,
    {
        self.register::<C>(Arc::new(FnHandler(f)));
    }

    pub fn has_handler<C: Command>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<C>())
    }

    /// Run `command` through its handler.
    ///
    /// Fails with [`EngineError::NoHandler`] when nothing is registered for
    /// `C`. Handler errors propagate unchanged; a handler panic becomes
    /// [`EngineError::Execution`].
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output, EngineError> {
        let handler = self
            .handlers
            .get(&TypeId::of::<C>())
            .and_then(|h| h.downcast_ref::<Arc<dyn CommandHandler<C>>>())
            .cloned()
            .ok_or_else(|| EngineError::NoHandler(type_name::<C>().to_string()))?;

        let result = match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(command = type_name::<C>(), panic = %message, "command handler panicked");
                Err(EngineError::execution(format!("command handler panicked: {message}")))
            }
        };
        if let Err(e) = &result {
            tracing::debug!(command = type_name::<C>(), error = %e, "command failed");
        }
        result
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Add(i64, i64);
    impl Command for Add {
        type Output = i64;
    }

    struct Divide(i64, i64);
    impl Command for Divide {
        type Output = i64;
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        let mut bus = CommandBus::new();
        bus.register_fn(|Add(a, b): Add| async move { Ok(a + b) });
        assert!(bus.has_handler::<Add>());
        assert_eq!(bus.execute(Add(2, 3)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let bus = CommandBus::new();
        let err = bus.execute(Add(1, 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::NoHandler(name) if name.contains("Add")));
    }

    #[tokio::test]
    async fn handler_error_reaches_caller() {
        let mut bus = CommandBus::new();
        bus.register_fn(|Divide(a, b): Divide| async move {
            if b == 0 {
                return Err(EngineError::execution("division by zero"));
            }
            Ok(a / b)
        });
        assert_eq!(bus.execute(Divide(9, 3)).await.unwrap(), 3);
        let err = bus.execute(Divide(1, 0)).await.unwrap_err();
        assert!(matches!(err, EngineError::Execution { .. }));
    }

    #[tokio::test]
    async fn panicking_handler_fails_only_its_command() {
        let mut bus = CommandBus::new();
        bus.register_fn(|Divide(a, b): Divide| async move {
            if b == 0 {
                panic!("divide by zero");
            }
            Ok(a / b)
        });
        bus.register_fn(|Add(a, b): Add| async move { Ok(a + b) });

        let err = bus.execute(Divide(1, 0)).await.unwrap_err();
        assert!(matches!(&err, EngineError::Execution { message, .. } if message.contains("divide by zero")));
        assert_eq!(bus.execute(Divide(8, 2)).await.unwrap(), 4);
        assert_eq!(bus.execute(Add(1, 1)).await.unwrap(), 2);
    }
}
