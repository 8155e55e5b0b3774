//! Infrastructure layer for Orchestrion.
//!
//! Implements the repository traits from `orchestrion-core` on SQLite and
//! loads the engine's two kinds of input files: `config.toml` and process
//! definition files.

pub mod config;
pub mod definition;
pub mod sqlite;
