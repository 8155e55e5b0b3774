//! CLI command definitions for the `orch` binary.
//!
//! Uses clap derive macros. Commands follow a noun-verb pattern
//! (`orch process start`, `orch migration apply`).

pub mod definition;
pub mod history;
pub mod job;
pub mod migration;
pub mod output;
pub mod process;
pub mod serve;
pub mod task;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and operate BPMN-style processes.
#[derive(Parser)]
#[command(name = "orch", version, about, long_about = None)]
pub struct Cli {
    /// Data directory holding `orchestrion.db` and `config.toml`.
    #[arg(long, global = true, env = "ORCHESTRION_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter for the chosen verbosity; `RUST_LOG` overrides it.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn,orchestrion_core=info",
            1 => "info,orchestrion_core=debug,orchestrion_infra=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the job loop, timeout sweep and scheduled compaction until stopped.
    Serve,

    /// Deploy and inspect process definitions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Start, inspect and operate processes.
    #[command(alias = "ps")]
    Process {
        #[command(subcommand)]
        action: process::ProcessCommand,
    },

    /// Act as an external worker: fetch, complete and fail tasks.
    Task {
        #[command(subcommand)]
        action: task::TaskCommand,
    },

    /// Inspect and run jobs.
    Job {
        #[command(subcommand)]
        action: job::JobCommand,
    },

    /// Archive old terminal processes into history now.
    Compact,

    /// Plan and apply process migrations between definition versions.
    Migration {
        #[command(subcommand)]
        action: migration::MigrationCommand,
    },

    /// Browse archived processes.
    History {
        #[command(subcommand)]
        action: history::HistoryCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_process_start() {
        let cli = Cli::try_parse_from([
            "orch", "--json", "process", "start", "order", "--var", "amount=200", "--version", "2",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Process {
                action: process::ProcessCommand::Start { key, version, vars, .. },
            } => {
                assert_eq!(key, "order");
                assert_eq!(version, Some(2));
                assert_eq!(vars[0].0, "amount");
                assert_eq!(vars[0].1, serde_json::json!(200));
            }
            _ => panic!("expected process start"),
        }
    }

    #[test]
    fn suspend_takes_an_id_or_a_key() {
        let cli = Cli::try_parse_from(["orch", "process", "suspend", "--key", "shipping"]).unwrap();
        match cli.command {
            Commands::Process {
                action: process::ProcessCommand::Suspend { id, key },
            } => {
                assert!(id.is_none());
                assert_eq!(key.as_deref(), Some("shipping"));
            }
            _ => panic!("expected process suspend"),
        }
        assert!(Cli::try_parse_from(["orch", "process", "suspend"]).is_err());
        let id = uuid::Uuid::now_v7().to_string();
        assert!(Cli::try_parse_from(["orch", "process", "resume", id.as_str(), "--key", "shipping"]).is_err());
    }

    #[test]
    fn parses_task_extend_lock_and_async_apply() {
        let id = uuid::Uuid::now_v7().to_string();
        let cli = Cli::try_parse_from(["orch", "task", "extend-lock", id.as_str(), "--lock-ms", "30000"]).unwrap();
        match cli.command {
            Commands::Task {
                action: task::TaskCommand::ExtendLock { worker, lock_ms, .. },
            } => {
                assert_eq!(worker, "orch-cli");
                assert_eq!(lock_ms, 30_000);
            }
            _ => panic!("expected task extend-lock"),
        }

        let cli = Cli::try_parse_from(["orch", "migration", "apply", id.as_str(), "--async"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Migration {
                action: migration::MigrationCommand::Apply { background: true, .. }
            }
        ));
    }

    #[test]
    fn parses_task_error_with_variables() {
        let id = uuid::Uuid::now_v7().to_string();
        let cli = Cli::try_parse_from(["orch", "task", "error", id.as_str(), "--code", "OUT_OF_STOCK", "sku=\"A-1\""])
            .unwrap();
        match cli.command {
            Commands::Task {
                action: task::TaskCommand::Error { code, vars, .. },
            } => {
                assert_eq!(code, "OUT_OF_STOCK");
                assert_eq!(vars.len(), 1);
                assert_eq!(vars[0].0, "sku");
            }
            _ => panic!("expected task error"),
        }
        assert!(Cli::try_parse_from(["orch", "task", "error", id.as_str()]).is_err());
    }

    #[test]
    fn verbosity_picks_filter() {
        let quiet = Cli::try_parse_from(["orch", "-q", "compact"]).unwrap();
        assert_eq!(quiet.log_filter(), "error");
        let loud = Cli::try_parse_from(["orch", "-vv", "compact"]).unwrap();
        assert_eq!(loud.log_filter(), "trace");
    }
}
