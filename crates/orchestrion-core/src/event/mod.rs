//! Event distribution.
//!
//! Provides an `EventBus` that fans committed `EngineEvent`s out to raw
//! broadcast subscribers and to registered asynchronous handlers.

pub mod bus;

pub use bus::{EventBus, EventHandler};
