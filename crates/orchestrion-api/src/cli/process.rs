//! `orch process` subcommands.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use orchestrion_core::repository::{ProcessQuery, RuntimeRepository};
use orchestrion_types::command::{
    CancelProcessCommand, DefinitionRef, RecoverProcessCommand, SetVariablesCommand, StartProcessCommand,
    SuspendDefinitionCommand, SuspendProcessCommand, TerminateProcessCommand,
};
use orchestrion_types::process::{Process, ProcessState};
use serde_json::{Value, json};
use uuid::Uuid;

use super::output::{self, parse_var};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum ProcessCommand {
    /// Start a process of the latest (or a pinned) definition version.
    Start {
        /// Definition key.
        key: String,

        #[arg(long)]
        version: Option<u32>,

        /// Initial variable, `name=value` (repeatable; JSON values allowed).
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,

        #[arg(long)]
        business_key: Option<String>,
    },

    /// List processes, oldest first.
    #[command(alias = "ls")]
    List {
        /// Filter by state (created, running, incident, completed, cancelled, terminated).
        #[arg(long)]
        state: Option<ProcessState>,

        /// Filter by definition key.
        #[arg(long)]
        key: Option<String>,

        /// Only processes called by this parent.
        #[arg(long)]
        parent: Option<Uuid>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show a process with its activity executions and incidents.
    Show { id: Uuid },

    /// Cancel a process and every open activity and called process.
    Cancel { id: Uuid },

    /// Terminate a process immediately.
    Terminate { id: Uuid },

    /// Retry the failed activities of a process in incident.
    Recover { id: Uuid },

    /// Stop handing out work for a process, or every process of a key.
    Suspend {
        #[arg(required_unless_present = "key", conflicts_with = "key")]
        id: Option<Uuid>,

        /// Every non-terminal process of this definition key.
        #[arg(long)]
        key: Option<String>,
    },

    /// Resume a suspended process, or every process of a key.
    Resume {
        #[arg(required_unless_present = "key", conflicts_with = "key")]
        id: Option<Uuid>,

        #[arg(long)]
        key: Option<String>,
    },

    /// Merge variables into a process scope.
    #[command(name = "set-var")]
    SetVar {
        id: Uuid,

        /// `name=value` pairs.
        #[arg(required = true, value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Correlate a message to a waiting receive task.
    Message {
        id: Uuid,

        /// Message name.
        name: String,

        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },
}

pub async fn handle_process_command(cmd: ProcessCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ProcessCommand::Start {
            key,
            version,
            vars,
            business_key,
        } => {
            let process = state
                .engine
                .execute(StartProcessCommand {
                    definition: DefinitionRef::Key { key, version },
                    variables: output::variables(vars),
                    business_key,
                })
                .await
                .context("failed to start process")?;
            report(&process, "Started", json)
        }
        ProcessCommand::List {
            state: filter,
            key,
            parent,
            limit,
            offset,
        } => {
            let query = ProcessQuery {
                state: filter,
                definition_key: key,
                parent_process_id: parent,
                limit: Some(limit),
                offset,
                ..Default::default()
            };
            list(&state.store.list_processes(&query).await?, json)
        }
        ProcessCommand::Show { id } => show(id, state, json).await,
        ProcessCommand::Cancel { id } => {
            let process = state.engine.execute(CancelProcessCommand { process_id: id }).await?;
            report(&process, "Cancelled", json)
        }
        ProcessCommand::Terminate { id } => {
            let process = state.engine.execute(TerminateProcessCommand { process_id: id }).await?;
            report(&process, "Terminated", json)
        }
        ProcessCommand::Recover { id } => {
            let process = state.engine.execute(RecoverProcessCommand { process_id: id }).await?;
            report(&process, "Recovered", json)
        }
        ProcessCommand::Suspend { id, key } => suspend(id, key, true, state, json).await,
        ProcessCommand::Resume { id, key } => suspend(id, key, false, state, json).await,
        ProcessCommand::SetVar { id, vars } => {
            let process = state
                .engine
                .execute(SetVariablesCommand {
                    process_id: id,
                    variables: output::variables(vars),
                })
                .await?;
            report(&process, "Updated", json)
        }
        ProcessCommand::Message { id, name, vars } => {
            let process = state
                .engine
                .engine()
                .correlate_message(id, &name, output::variables(vars))
                .await
                .with_context(|| format!("failed to correlate '{name}'"))?;
            report(&process, "Correlated", json)
        }
    }
}

async fn suspend(id: Option<Uuid>, key: Option<String>, suspended: bool, state: &AppState, json: bool) -> Result<()> {
    let verb = if suspended { "Suspended" } else { "Resumed" };
    match (id, key) {
        (Some(process_id), _) => {
            let process = state
                .engine
                .execute(SuspendProcessCommand { process_id, suspended })
                .await?;
            report(&process, verb, json)
        }
        (None, Some(definition_key)) => {
            let changed = state
                .engine
                .execute(SuspendDefinitionCommand {
                    definition_key: definition_key.clone(),
                    suspended,
                })
                .await?;
            if json {
                return output::print_json(&changed);
            }
            println!();
            output::success(&format!(
                "{verb} {} process(es) of {}",
                changed.len(),
                style(&definition_key).cyan()
            ));
            if !changed.is_empty() {
                list(&changed, false)?;
            }
            Ok(())
        }
        (None, None) => bail!("give a process id or --key"),
    }
}

fn report(process: &Process, verb: &str, json: bool) -> Result<()> {
    if json {
        return output::print_json(process);
    }
    println!();
    output::success(&format!(
        "{verb} process {} ({})",
        style(process.id).cyan(),
        process.state
    ));
    println!(
        "  Definition: {}:{}",
        process.definition_key, process.definition_version
    );
    if process.suspended {
        println!("  {}", style("suspended").yellow());
    }
    println!();
    Ok(())
}

fn list(processes: &[Process], json: bool) -> Result<()> {
    if json {
        return output::print_json(processes);
    }
    if processes.is_empty() {
        output::empty("No processes.", Some("Start one with: orch process start <key>"));
        return Ok(());
    }

    let mut table = output::table(&["ID", "Definition", "State", "Business key", "Created", "Completed"]);
    for p in processes {
        let mut state_cell = output::process_state_cell(p.state);
        if p.suspended {
            state_cell = Cell::new(format!("{} (suspended)", p.state));
        }
        table.add_row(vec![
            Cell::new(p.id),
            Cell::new(format!("{}:{}", p.definition_key, p.definition_version)),
            state_cell,
            Cell::new(p.business_key.as_deref().unwrap_or("-")),
            Cell::new(output::timestamp(&p.created_at)),
            Cell::new(output::opt_timestamp(p.completed_at.as_ref())),
        ]);
    }
    output::print_table(&table);
    Ok(())
}

async fn show(id: Uuid, state: &AppState, json: bool) -> Result<()> {
    let engine = state.engine.engine();
    let process = engine.process(id).await?;
    let activities = engine.activities(id).await?;
    let incidents = engine.incidents(id).await?;

    if json {
        return output::print_json(&json!({
            "process": process,
            "activities": activities,
            "incidents": incidents,
        }));
    }

    println!();
    println!("  {} {}", style("Process").bold(), style(process.id).cyan());
    println!("  Definition: {}:{}", process.definition_key, process.definition_version);
    println!("  State: {}{}", process.state, if process.suspended { " (suspended)" } else { "" });
    if let Some(key) = &process.business_key {
        println!("  Business key: {key}");
    }
    if let Some(parent) = &process.parent {
        println!("  Called by: {} (activity {})", parent.process_id, parent.activity_id);
    }
    println!("  Created: {}", output::timestamp(&process.created_at));
    println!("  Completed: {}", output::opt_timestamp(process.completed_at.as_ref()));
    if !process.variables.is_empty() {
        println!("  Variables: {}", serde_json::to_string(&process.variables)?);
    }

    let mut table = output::table(&["Activity", "Type", "State", "Attempts", "Loop", "Lock", "ID"]);
    for a in &activities {
        table.add_row(vec![
            Cell::new(&a.definition_id),
            Cell::new(a.activity_type),
            output::activity_state_cell(a.state),
            Cell::new(format!("{}/{}", a.attempts, a.retries)),
            Cell::new(a.loop_index.map(|i| i.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(a.lock.as_ref().map(|l| l.worker_id.as_str()).unwrap_or("-")),
            Cell::new(a.id),
        ]);
    }
    output::print_table(&table);

    for incident in &incidents {
        println!(
            "  {} incident at '{}' ({}): {}",
            style("!").red().bold(),
            incident.activity_definition_id,
            output::timestamp(&incident.occurred_at),
            incident.reason
        );
        if let Some(trace) = &incident.trace {
            println!("    {}", style(trace).dim());
        }
    }
    if !incidents.is_empty() {
        println!("  Recover with: {}", style(format!("orch process recover {id}")).dim());
        println!();
    }
    Ok(())
}
