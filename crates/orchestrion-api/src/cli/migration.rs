//! `orch migration` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use orchestrion_core::repository::MigrationPlanRepository;
use orchestrion_types::command::{
    ApplyMigrationCommand, GenerateMigrationPlanCommand, PlanMigrationCommand, ScheduleMigrationCommand,
};
use orchestrion_types::migration::{ActivityMigrationInstruction, MigrationOutcome, ProcessMigrationPlan};
use uuid::Uuid;

use super::output::{self, parse_mapping};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum MigrationCommand {
    /// Save a plan from explicit activity mappings.
    Plan {
        /// Definition key.
        key: String,

        #[arg(long)]
        from: u32,

        #[arg(long)]
        to: u32,

        /// `from_activity=to_activity` (repeatable).
        #[arg(long = "map", required = true, value_parser = parse_mapping)]
        mappings: Vec<(String, String)>,
    },

    /// Save a plan mapping every activity id present in both versions.
    Generate {
        key: String,

        #[arg(long)]
        from: u32,

        #[arg(long)]
        to: u32,
    },

    /// Apply a saved plan to processes of the source version.
    Apply {
        plan_id: Uuid,

        /// Limit to these processes (all of the source version when omitted).
        #[arg(long = "process", conflicts_with = "background")]
        processes: Vec<Uuid>,

        /// Queue a process-migration job for `orch serve` instead of
        /// migrating inline.
        #[arg(long = "async")]
        background: bool,
    },

    /// List saved plans.
    #[command(alias = "ls")]
    List {
        #[arg(long)]
        key: Option<String>,
    },
}

pub async fn handle_migration_command(cmd: MigrationCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        MigrationCommand::Plan { key, from, to, mappings } => {
            let plan = state
                .engine
                .execute(PlanMigrationCommand {
                    definition_key: key,
                    from_version: from,
                    to_version: to,
                    instructions: mappings
                        .into_iter()
                        .map(|(f, t)| ActivityMigrationInstruction::new(f, t))
                        .collect(),
                })
                .await
                .context("failed to save migration plan")?;
            report_plan(&plan, json)
        }
        MigrationCommand::Generate { key, from, to } => {
            let plan = state
                .engine
                .execute(GenerateMigrationPlanCommand {
                    definition_key: key,
                    from_version: from,
                    to_version: to,
                })
                .await
                .context("failed to generate migration plan")?;
            report_plan(&plan, json)
        }
        MigrationCommand::Apply {
            plan_id,
            background: true,
            ..
        } => {
            let job = state
                .engine
                .execute(ScheduleMigrationCommand { plan_id })
                .await
                .with_context(|| format!("failed to schedule plan {plan_id}"))?;
            if json {
                return output::print_json(&job);
            }
            output::success(&format!("Queued migration job {}", style(job.id).cyan()));
            println!("  Follow with: {}", style(format!("orch job show {}", job.id)).dim());
            Ok(())
        }
        MigrationCommand::Apply { plan_id, processes, .. } => {
            let spinner = output::spinner("Migrating processes...", json);
            let result = state
                .engine
                .execute(ApplyMigrationCommand {
                    plan_id,
                    process_ids: processes,
                })
                .await;
            spinner.finish_and_clear();
            let results = result.with_context(|| format!("failed to apply plan {plan_id}"))?;

            if json {
                return output::print_json(&results);
            }
            if results.is_empty() {
                output::empty("No processes to migrate.", None);
                return Ok(());
            }
            let mut table = output::table(&["Process", "Outcome", "Detail"]);
            for r in &results {
                let (outcome, detail) = match &r.outcome {
                    MigrationOutcome::Migrated { remapped } => (
                        Cell::new("migrated").fg(Color::Green),
                        format!("{remapped} execution(s) remapped"),
                    ),
                    MigrationOutcome::Skipped { reason } => (Cell::new("skipped").fg(Color::DarkGrey), reason.clone()),
                    MigrationOutcome::Failed { reason } => (Cell::new("failed").fg(Color::Red), reason.clone()),
                };
                table.add_row(vec![Cell::new(r.process_id), outcome, Cell::new(detail)]);
            }
            output::print_table(&table);
            Ok(())
        }
        MigrationCommand::List { key } => {
            let plans = state.store.list_plans(key.as_deref()).await?;
            if json {
                return output::print_json(&plans);
            }
            if plans.is_empty() {
                output::empty("No migration plans.", Some("Create one with: orch migration generate <key> --from 1 --to 2"));
                return Ok(());
            }
            let mut table = output::table(&["ID", "Definition", "From", "To", "Mappings", "Created"]);
            for p in &plans {
                table.add_row(vec![
                    Cell::new(p.id),
                    Cell::new(&p.definition_key),
                    Cell::new(p.from_version),
                    Cell::new(p.to_version),
                    Cell::new(p.instructions.len()),
                    Cell::new(output::timestamp(&p.created_at)),
                ]);
            }
            output::print_table(&table);
            Ok(())
        }
    }
}

fn report_plan(plan: &ProcessMigrationPlan, json: bool) -> Result<()> {
    if json {
        return output::print_json(plan);
    }
    println!();
    output::success(&format!(
        "Saved plan {} for {} v{} -> v{}",
        style(plan.id).cyan(),
        plan.definition_key,
        plan.from_version,
        plan.to_version
    ));
    for i in &plan.instructions {
        println!("    {} -> {}", i.from_activity_id, i.to_activity_id);
    }
    println!("  Apply with: {}", style(format!("orch migration apply {}", plan.id)).dim());
    println!();
    Ok(())
}
