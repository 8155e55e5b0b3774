//! `orch task` subcommands: act as an external worker from the shell.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::Cell;
use console::style;
use orchestrion_core::external::gateway::FetchRequest;
use orchestrion_types::task::TaskFailure;
use serde_json::{Value, json};
use uuid::Uuid;

use super::output::{self, parse_var};
use crate::state::AppState;

const DEFAULT_WORKER: &str = "orch-cli";

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Fetch and lock open tasks on a topic.
    Fetch {
        topic: String,

        #[arg(long, default_value = DEFAULT_WORKER)]
        worker: String,

        /// Only tasks of processes of this definition key.
        #[arg(long)]
        definition: Option<String>,

        /// Maximum tasks to lock (defaults to the configured limit).
        #[arg(long)]
        max: Option<usize>,

        /// Lock duration in milliseconds (defaults to the configured duration).
        #[arg(long)]
        lock_ms: Option<u64>,
    },

    /// Complete a locked task, merging output variables.
    Complete {
        task_id: Uuid,

        #[arg(long, default_value = DEFAULT_WORKER)]
        worker: String,

        #[arg(value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Report a failure for a locked task.
    Fail {
        task_id: Uuid,

        #[arg(long, default_value = DEFAULT_WORKER)]
        worker: String,

        #[arg(long)]
        reason: String,

        /// Retries the worker believes remain.
        #[arg(long)]
        retries: Option<u32>,

        /// Delay before the task can be fetched again.
        #[arg(long)]
        retry_delay_ms: Option<u64>,
    },

    /// Throw a business error from a locked task.
    Error {
        task_id: Uuid,

        #[arg(long, default_value = DEFAULT_WORKER)]
        worker: String,

        /// Error code matched against error boundary events.
        #[arg(long)]
        code: String,

        #[arg(value_parser = parse_var)]
        vars: Vec<(String, Value)>,
    },

    /// Push the lock of a task this worker holds.
    #[command(name = "extend-lock")]
    ExtendLock {
        task_id: Uuid,

        #[arg(long, default_value = DEFAULT_WORKER)]
        worker: String,

        /// New lock duration from now, in milliseconds.
        #[arg(long)]
        lock_ms: u64,
    },
}

pub async fn handle_task_command(cmd: TaskCommand, state: &AppState, json: bool) -> Result<()> {
    let gateway = state.engine.gateway();
    match cmd {
        TaskCommand::Fetch {
            topic,
            worker,
            definition,
            max,
            lock_ms,
        } => {
            let mut request = FetchRequest::new(&topic, &worker);
            if let Some(key) = definition {
                request = request.for_definition(key);
            }
            if let Some(max) = max {
                request = request.max_tasks(max);
            }
            if let Some(ms) = lock_ms {
                request = request.lock_for(Duration::from_millis(ms));
            }
            let tasks = gateway.fetch_and_lock(&request).await.context("fetch failed")?;

            if json {
                return output::print_json(&tasks);
            }
            if tasks.is_empty() {
                output::empty(&format!("No open tasks on '{topic}'."), None);
                return Ok(());
            }
            let mut table = output::table(&["Task", "Process", "Activity", "Retries", "Locked until", "Variables"]);
            for task in &tasks {
                table.add_row(vec![
                    Cell::new(task.id),
                    Cell::new(task.process_id),
                    Cell::new(format!("{}/{}", task.definition_key, task.activity_id)),
                    Cell::new(task.retries),
                    Cell::new(output::timestamp(&task.lock_expires_at)),
                    Cell::new(serde_json::to_string(&task.variables)?),
                ]);
            }
            output::print_table(&table);
            Ok(())
        }
        TaskCommand::Complete { task_id, worker, vars } => {
            gateway
                .complete(task_id, &worker, output::variables(vars))
                .await
                .with_context(|| format!("failed to complete task {task_id}"))?;
            if json {
                return output::print_json(&json!({ "task_id": task_id, "completed": true }));
            }
            output::success(&format!("Completed task {}", style(task_id).cyan()));
            Ok(())
        }
        TaskCommand::Fail {
            task_id,
            worker,
            reason,
            retries,
            retry_delay_ms,
        } => {
            let failure = TaskFailure {
                retries_left: retries,
                retry_delay_ms,
                ..TaskFailure::new(reason)
            };
            let will_retry = gateway
                .fail(task_id, &worker, failure)
                .await
                .with_context(|| format!("failed to report failure for task {task_id}"))?;
            if json {
                return output::print_json(&json!({ "task_id": task_id, "will_retry": will_retry }));
            }
            if will_retry {
                output::success(&format!("Task {} will be retried", style(task_id).cyan()));
            } else {
                println!(
                    "  {} Task {} exhausted its retries; the process is in incident",
                    style("!").red().bold(),
                    style(task_id).cyan()
                );
            }
            Ok(())
        }
        TaskCommand::Error {
            task_id,
            worker,
            code,
            vars,
        } => {
            gateway
                .throw_error(task_id, &worker, &code, output::variables(vars))
                .await
                .with_context(|| format!("failed to throw error from task {task_id}"))?;
            if json {
                return output::print_json(&json!({ "task_id": task_id, "error_code": code }));
            }
            output::success(&format!("Threw '{code}' from task {}", style(task_id).cyan()));
            Ok(())
        }
        TaskCommand::ExtendLock { task_id, worker, lock_ms } => {
            gateway
                .extend_lock(task_id, &worker, Duration::from_millis(lock_ms))
                .await
                .with_context(|| format!("failed to extend the lock of task {task_id}"))?;
            if json {
                return output::print_json(&json!({ "task_id": task_id, "lock_ms": lock_ms }));
            }
            output::success(&format!("Extended lock of task {} by {lock_ms} ms", style(task_id).cyan()));
            Ok(())
        }
    }
}
