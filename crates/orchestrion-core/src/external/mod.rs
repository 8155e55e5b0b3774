//! External task gateway and the in-process worker built on it.

pub mod gateway;
pub mod worker;

pub use gateway::{ExternalTaskGateway, FetchRequest};
pub use worker::{ExternalTaskWorker, Subscription, TaskHandler, WorkerRegistry};
