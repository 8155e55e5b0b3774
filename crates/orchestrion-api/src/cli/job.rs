//! `orch job` subcommands and `orch compact`.

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use orchestrion_core::repository::{JobQuery, JobRepository};
use orchestrion_types::command::RunJobCommand;
use orchestrion_types::compaction::{CompactionCommand, CompactionReport};
use orchestrion_types::job::{Job, JobState};
use orchestrion_types::variables;
use uuid::Uuid;

use super::output;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum JobCommand {
    /// List jobs, oldest first.
    #[command(alias = "ls")]
    List {
        /// Filter by state (created, running, completed, failed).
        #[arg(long)]
        state: Option<JobState>,

        #[arg(long = "type")]
        job_type: Option<String>,

        /// Only jobs owned by this process.
        #[arg(long)]
        process: Option<Uuid>,

        #[arg(long, default_value = "50")]
        limit: u32,

        #[arg(long, default_value = "0")]
        offset: u32,
    },

    /// Show one job with its input, output and failure.
    Show { id: Uuid },

    /// Enqueue a job and run it in this process.
    Run {
        job_type: String,

        /// Job input as a JSON object.
        #[arg(long)]
        input: Option<String>,
    },
}

pub async fn handle_job_command(cmd: JobCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        JobCommand::List {
            state: filter,
            job_type,
            process,
            limit,
            offset,
        } => {
            let query = JobQuery {
                state: filter,
                job_type,
                process_id: process,
                limit: Some(limit),
                offset,
            };
            list(&state.store.list_jobs(&query).await?, json)
        }
        JobCommand::Show { id } => {
            let job = state
                .store
                .get_job(&id)
                .await?
                .with_context(|| format!("job {id} not found"))?;
            if json {
                return output::print_json(&job);
            }
            show(&job)
        }
        JobCommand::Run { job_type, input } => {
            let input = match input {
                Some(raw) => {
                    let value: serde_json::Value = serde_json::from_str(&raw).context("--input is not valid JSON")?;
                    if !value.is_object() {
                        bail!("--input must be a JSON object");
                    }
                    variables::from_value(value)
                }
                None => Default::default(),
            };

            let spinner = output::spinner(&format!("Running {job_type} job..."), json);
            let result = state.engine.execute(RunJobCommand { job_type, input }).await;
            spinner.finish_and_clear();
            let job = result.context("job run failed")?;

            if json {
                return output::print_json(&job);
            }
            show(&job)
        }
    }
}

/// Run compaction once and print what it did.
pub async fn handle_compact(state: &AppState, json: bool) -> Result<()> {
    let spinner = output::spinner("Compacting terminal processes...", json);
    let result = state.engine.execute(CompactionCommand::manual()).await;
    spinner.finish_and_clear();
    let report = result.context("compaction failed")?;

    if json {
        return output::print_json(&report);
    }
    print_report(&report);
    Ok(())
}

fn print_report(report: &CompactionReport) {
    println!();
    output::success(&format!(
        "Compaction ({}) archived {} process(es) in {} page(s)",
        report.trigger,
        style(report.archived).cyan(),
        report.pages
    ));
    if report.already_archived > 0 {
        println!("  Already archived: {}", report.already_archived);
    }
    println!("  Deleted activities: {}", report.deleted_activities);
    println!("  Deleted jobs: {}", report.deleted_jobs);
    println!("  Purged jobs: {}", report.purged_jobs);
    if let (Some(start), Some(end)) = (report.started_at, report.finished_at) {
        println!("  Took: {} ms", (end - start).num_milliseconds());
    }
    println!();
}

fn list(jobs: &[Job], json: bool) -> Result<()> {
    if json {
        return output::print_json(jobs);
    }
    if jobs.is_empty() {
        output::empty("No jobs.", None);
        return Ok(());
    }

    let mut table = output::table(&["ID", "Type", "State", "Attempts", "Run at", "Process", "Lease"]);
    for job in jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.job_type),
            output::job_state_cell(job.state),
            Cell::new(format!("{}/{}", job.attempts, job.max_attempts)),
            Cell::new(output::timestamp(&job.run_at)),
            Cell::new(job.process_id.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())),
            Cell::new(job.lease.as_ref().map(|l| l.owner.as_str()).unwrap_or("-")),
        ]);
    }
    output::print_table(&table);
    Ok(())
}

fn show(job: &Job) -> Result<()> {
    println!();
    println!("  {} {} ({})", style("Job").bold(), style(job.id).cyan(), job.job_type);
    println!("  State: {}", job.state);
    println!("  Attempts: {}/{}", job.attempts, job.max_attempts);
    println!("  Run at: {}", output::timestamp(&job.run_at));
    if let Some(process_id) = job.process_id {
        println!("  Process: {process_id}");
    }
    if !job.input.is_empty() {
        println!("  Input: {}", serde_json::to_string(&job.input)?);
    }
    if !job.output.is_empty() {
        println!("  Output: {}", serde_json::to_string(&job.output)?);
    }
    if let Some(failure) = &job.failure {
        println!("  {} {}", style("Failed:").red().bold(), failure.reason);
        if let Some(trace) = &failure.trace {
            println!("    {}", style(trace).dim());
        }
    }
    println!();
    Ok(())
}
