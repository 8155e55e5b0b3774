//! Process engine, job scheduler and repository traits for Orchestrion.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements. It depends only on `orchestrion-types` -- never on
//! `orchestrion-infra` or any database/IO crate.

pub mod command;
pub mod compaction;
pub mod error;
pub mod event;
pub mod expression;
pub mod external;
pub mod job;
pub mod migration;
pub mod orchestrator;
pub mod repository;
pub mod runtime;

pub use error::EngineError;
pub use orchestrator::Orchestrator;
