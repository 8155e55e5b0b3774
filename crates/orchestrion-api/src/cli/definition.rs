//! `orch definition` subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use orchestrion_core::repository::DefinitionRepository;
use orchestrion_infra::definition::{load_definition_file, to_yaml};
use orchestrion_types::command::DeployDefinitionCommand;
use orchestrion_types::definition::ProcessDefinition;

use super::output;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Deploy a definition file (YAML or JSON) as the next version of its key.
    Deploy {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// List every deployed version.
    #[command(alias = "ls")]
    List {
        /// Only versions of this key.
        #[arg(long)]
        key: Option<String>,
    },

    /// Show one version (the latest unless --version is given).
    Show {
        key: String,

        #[arg(long)]
        version: Option<u32>,

        /// Print the definition as YAML.
        #[arg(long)]
        yaml: bool,
    },
}

pub async fn handle_definition_command(cmd: DefinitionCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        DefinitionCommand::Deploy { file } => deploy(&file, state, json).await,
        DefinitionCommand::List { key } => list(key.as_deref(), state, json).await,
        DefinitionCommand::Show { key, version, yaml } => show(&key, version, yaml, state, json).await,
    }
}

async fn deploy(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let definition = load_definition_file(file)
        .await
        .with_context(|| format!("failed to load {}", file.display()))?;
    let deployed = state
        .engine
        .execute(DeployDefinitionCommand { definition })
        .await
        .context("deploy failed")?;

    if json {
        return output::print_json(&deployed);
    }
    println!();
    output::success(&format!("Deployed {}", style(deployed.label()).cyan()));
    println!("  ID: {}", deployed.id);
    println!("  Activities: {}", deployed.activities.len());
    println!("  Flows: {}", deployed.flows.len());
    println!();
    Ok(())
}

async fn list(key: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let definitions: Vec<ProcessDefinition> = state
        .store
        .list_definitions()
        .await?
        .into_iter()
        .filter(|d| key.is_none_or(|k| d.key == k))
        .collect();

    if json {
        return output::print_json(&definitions);
    }
    if definitions.is_empty() {
        output::empty("No definitions deployed.", Some("Deploy one with: orch definition deploy <file.yaml>"));
        return Ok(());
    }

    let mut table = output::table(&["Key", "Version", "Name", "Activities", "Deployed", "ID"]);
    for d in &definitions {
        table.add_row(vec![
            Cell::new(&d.key),
            Cell::new(d.version),
            Cell::new(d.name.as_deref().unwrap_or("-")),
            Cell::new(d.activities.len()),
            Cell::new(output::timestamp(&d.deployed_at)),
            Cell::new(d.id),
        ]);
    }
    output::print_table(&table);
    Ok(())
}

async fn show(key: &str, version: Option<u32>, yaml: bool, state: &AppState, json: bool) -> Result<()> {
    let definition = match version {
        Some(v) => state.store.find_definition(key, v).await?,
        None => state.store.latest_definition(key).await?,
    }
    .ok_or_else(|| match version {
        Some(v) => anyhow!("definition {key}:{v} not found"),
        None => anyhow!("no definition deployed under key '{key}'"),
    })?;

    if json {
        return output::print_json(&definition);
    }
    if yaml {
        print!("{}", to_yaml(&definition)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style(definition.label()).cyan().bold(),
        definition.name.as_deref().map(|n| format!("({n})")).unwrap_or_default()
    );
    println!("  ID: {}", definition.id);
    println!("  Deployed: {}", output::timestamp(&definition.deployed_at));

    let mut activities = output::table(&["Activity", "Type", "Parent", "Multi-instance", "Retries"]);
    for a in &definition.activities {
        activities.add_row(vec![
            Cell::new(&a.id),
            Cell::new(a.activity_type()),
            Cell::new(a.parent.as_deref().unwrap_or("-")),
            Cell::new(match &a.multi_instance {
                Some(mi) if mi.sequential => format!("sequential over {}", mi.collection),
                Some(mi) => format!("parallel over {}", mi.collection),
                None => "-".to_string(),
            }),
            Cell::new(a.retries.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())),
        ]);
    }
    output::print_table(&activities);

    let mut flows = output::table(&["Flow", "Source", "Target", "Condition"]);
    for f in &definition.flows {
        flows.add_row(vec![
            Cell::new(&f.id),
            Cell::new(&f.source),
            Cell::new(&f.target),
            Cell::new(f.condition.as_deref().unwrap_or("-")),
        ]);
    }
    output::print_table(&flows);
    Ok(())
}
