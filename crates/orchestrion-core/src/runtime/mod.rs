//! Process and activity state machines.
//!
//! `transition` holds the synchronous token-flow rules; `engine` wraps them
//! with locking, persistence and cross-process effects.

pub mod engine;
pub mod lock;
pub mod service;
pub mod transition;

#[cfg(test)]
mod scenarios;

pub use engine::ProcessEngine;
pub use lock::ProcessLocks;
pub use service::{ActivityJobHandler, ServiceContext, ServiceHandler, service_fn};
pub use transition::LOOP_COUNTER;
