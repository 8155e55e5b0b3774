//! Shared rendering and argument parsing for CLI subcommands.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use indicatif::{ProgressBar, ProgressStyle};
use orchestrion_types::activity::ActivityState;
use orchestrion_types::job::JobState;
use orchestrion_types::process::ProcessState;
use orchestrion_types::variables::Variables;
use serde::Serialize;
use serde_json::Value;

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// A condensed table with a cyan first header cell.
pub fn table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    let header: Vec<Cell> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| if i == 0 { Cell::new(h).fg(Color::Cyan) } else { Cell::new(h) })
        .collect();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn print_table(table: &Table) {
    println!();
    println!("{table}");
    println!();
}

pub fn empty(message: &str, hint: Option<&str>) {
    println!();
    println!("  {message}");
    if let Some(hint) = hint {
        println!("  {}", console::style(hint).dim());
    }
    println!();
}

pub fn success(message: &str) {
    println!("  {} {message}", console::style("*").green().bold());
}

pub fn process_state_cell(state: ProcessState) -> Cell {
    let color = match state {
        ProcessState::Completed => Color::Green,
        ProcessState::Incident => Color::Red,
        ProcessState::Cancelled | ProcessState::Terminated => Color::DarkGrey,
        ProcessState::Created | ProcessState::Running => Color::Yellow,
    };
    Cell::new(state).fg(color)
}

pub fn activity_state_cell(state: ActivityState) -> Cell {
    let color = match state {
        ActivityState::Completed => Color::Green,
        ActivityState::Failed => Color::Red,
        ActivityState::Cancelled => Color::DarkGrey,
        ActivityState::Created | ActivityState::Active => Color::Yellow,
    };
    Cell::new(state).fg(color)
}

pub fn job_state_cell(state: JobState) -> Cell {
    let color = match state {
        JobState::Completed => Color::Green,
        JobState::Failed => Color::Red,
        JobState::Created | JobState::Running => Color::Yellow,
    };
    Cell::new(state).fg(color)
}

pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn opt_timestamp(at: Option<&DateTime<Utc>>) -> String {
    at.map(timestamp).unwrap_or_else(|| "-".to_string())
}

/// Steady-ticking spinner for slow commands. Hidden in JSON mode.
pub fn spinner(message: &str, json: bool) -> ProgressBar {
    if json {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

/// `key=value`, where `value` is JSON when it parses as JSON and a plain
/// string otherwise (`name=ada`, `amount=200`, `tags=["a","b"]`).
pub fn parse_var(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

/// `from=to` activity mapping.
pub fn parse_mapping(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => Ok((from.to_string(), to.to_string())),
        _ => Err(format!("expected from_activity=to_activity, got '{s}'")),
    }
}

pub fn variables(pairs: Vec<(String, Value)>) -> Variables {
    pairs.into_iter().collect()
}
