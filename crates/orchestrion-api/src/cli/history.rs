//! `orch history` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use orchestrion_core::repository::HistoryRepository;
use uuid::Uuid;

use super::output;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum HistoryCommand {
    /// List archived processes, most recently archived first.
    #[command(alias = "ls")]
    List {
        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one archived process with its activities and jobs.
    Show { process_id: Uuid },
}

pub async fn handle_history_command(cmd: HistoryCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        HistoryCommand::List { limit, offset } => {
            let records = state.store.list_history(limit, offset).await?;
            if json {
                return output::print_json(&records);
            }
            if records.is_empty() {
                output::empty("History is empty.", Some("Terminal processes are archived by: orch compact"));
                return Ok(());
            }
            let total = state.store.count_history().await?;
            let mut table = output::table(&["Process", "Definition", "State", "Completed", "Archived", "Activities"]);
            for r in &records {
                table.add_row(vec![
                    Cell::new(r.process.id),
                    Cell::new(format!("{}:{}", r.process.definition_key, r.process.definition_version)),
                    output::process_state_cell(r.process.state),
                    Cell::new(output::opt_timestamp(r.process.completed_at.as_ref())),
                    Cell::new(output::timestamp(&r.archived_at)),
                    Cell::new(r.activities.len()),
                ]);
            }
            output::print_table(&table);
            println!("  {} of {total} archived", records.len());
            println!();
            Ok(())
        }
        HistoryCommand::Show { process_id } => {
            let record = state
                .store
                .get_history(&process_id)
                .await?
                .with_context(|| format!("no history for process {process_id}"))?;
            if json {
                return output::print_json(&record);
            }

            let p = &record.process;
            println!();
            println!("  {} {}", style("Archived process").bold(), style(p.id).cyan());
            println!("  Definition: {}:{}", p.definition_key, p.definition_version);
            println!("  State: {}", p.state);
            println!("  Completed: {}", output::opt_timestamp(p.completed_at.as_ref()));
            println!("  Archived: {}", output::timestamp(&record.archived_at));
            if !p.variables.is_empty() {
                println!("  Variables: {}", serde_json::to_string(&p.variables)?);
            }

            let mut activities = output::table(&["Activity", "Type", "State", "Attempts"]);
            for a in &record.activities {
                activities.add_row(vec![
                    Cell::new(&a.definition_id),
                    Cell::new(a.activity_type),
                    output::activity_state_cell(a.state),
                    Cell::new(a.attempts),
                ]);
            }
            output::print_table(&activities);

            if !record.jobs.is_empty() {
                let mut jobs = output::table(&["Job", "Type", "State", "Attempts"]);
                for j in &record.jobs {
                    jobs.add_row(vec![
                        Cell::new(j.id),
                        Cell::new(&j.job_type),
                        output::job_state_cell(j.state),
                        Cell::new(j.attempts),
                    ]);
                }
                output::print_table(&jobs);
            }
            Ok(())
        }
    }
}
