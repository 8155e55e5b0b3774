//! Orchestrion CLI entry point.
//!
//! Binary name: `orch`
//!
//! Parses CLI arguments, opens the data directory and the engine, then
//! dispatches to the matching command handler or runs `serve` until stopped.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use orchestrion_infra::sqlite::pool::default_data_dir;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "orch", &mut std::io::stdout());
        return Ok(());
    }

    orchestrion_observe::init_tracing(cli.otel, cli.log_filter())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    orchestrion_observe::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir(),
    };
    let state = AppState::init(data_dir).await?;
    let json = cli.json;

    match cli.command {
        Commands::Serve => cli::serve::handle_serve(&state, cli.quiet).await?,
        Commands::Definition { action } => cli::definition::handle_definition_command(action, &state, json).await?,
        Commands::Process { action } => cli::process::handle_process_command(action, &state, json).await?,
        Commands::Task { action } => cli::task::handle_task_command(action, &state, json).await?,
        Commands::Job { action } => cli::job::handle_job_command(action, &state, json).await?,
        Commands::Compact => cli::job::handle_compact(&state, json).await?,
        Commands::Migration { action } => cli::migration::handle_migration_command(action, &state, json).await?,
        Commands::History { action } => cli::history::handle_history_command(action, &state, json).await?,
        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}
