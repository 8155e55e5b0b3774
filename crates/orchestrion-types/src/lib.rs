//! Shared domain types for Orchestrion.
//!
//! This crate contains the types every other crate speaks: process
//! definitions, runtime entities (processes, activity executions, jobs),
//! the event and command vocabularies, configuration and the repository
//! error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod activity;
pub mod command;
pub mod compaction;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod history;
pub mod job;
pub mod migration;
pub mod process;
pub mod task;
pub mod variables;
