//! Run command handlers
//!
//! Handles run history, run details, logs and aborts.

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use keel_client::OrchestratorClient;
use keel_core::domain::log::{LogEntry, LogLevel};
use keel_core::domain::run::{Run, RunId, RunStatus, StageStatus};
use keel_core::dto::run::RunSummary;

use crate::config::Config;

/// Run subcommands
#[derive(Subcommand)]
pub enum RunCommands {
    /// List runs of a pipeline, newest first
    List {
        /// Pipeline name
        pipeline: String,
    },
    /// Get run details
    Get {
        /// Run ID
        id: RunId,
    },
    /// Abort an active run
    Abort {
        /// Run ID
        id: RunId,
    },
    /// Get run logs
    Logs {
        /// Run ID
        id: RunId,

        /// Only show entries of this stage
        #[arg(short, long)]
        stage: Option<String>,
    },
}

pub async fn handle_run_command(command: RunCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        RunCommands::List { pipeline } => list_runs(&client, &pipeline).await,
        RunCommands::Get { id } => get_run(&client, id).await,
        RunCommands::Abort { id } => abort_run(&client, id).await,
        RunCommands::Logs { id, stage } => get_run_logs(&client, id, stage.as_deref()).await,
    }
}

async fn list_runs(client: &OrchestratorClient, pipeline: &str) -> Result<()> {
    let runs = client.list_runs(pipeline).await?;

    if runs.is_empty() {
        println!(
            "{}",
            format!("No runs found for pipeline {}.", pipeline).yellow()
        );
    } else {
        println!(
            "{}",
            format!("Found {} run(s) for pipeline {}:", runs.len(), pipeline).bold()
        );
        println!();
        for run in runs {
            print_run_summary(&run);
        }
    }

    Ok(())
}

async fn get_run(client: &OrchestratorClient, id: RunId) -> Result<()> {
    let run = client.get_run(id).await?;
    print_run_details(&run);
    Ok(())
}

async fn abort_run(client: &OrchestratorClient, id: RunId) -> Result<()> {
    match client.abort_run(id).await {
        Ok(()) => {
            println!("{}", format!("✓ Abort requested for run {}", id).green().bold());
            Ok(())
        }
        Err(e) if e.is_conflict() => {
            println!("{}", format!("Run {} has already finished.", id).yellow());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn get_run_logs(client: &OrchestratorClient, id: RunId, stage: Option<&str>) -> Result<()> {
    let logs: Vec<LogEntry> = client
        .get_run_logs(id)
        .await?
        .into_iter()
        .filter(|entry| stage.is_none() || entry.stage.as_deref() == stage)
        .collect();

    if logs.is_empty() {
        println!("{}", "No logs found for this run.".yellow());
    } else {
        println!("{}", format!("Logs for run {}:", id).bold());
        println!("{}", "─".repeat(80).dimmed());
        for log in logs {
            print_log_entry(&log);
        }
        println!("{}", "─".repeat(80).dimmed());
    }

    Ok(())
}

fn print_run_summary(run: &RunSummary) {
    println!("  {} Run {}", "▸".cyan(), run.run_id.to_string().bold());
    println!("    Revision: {}", run.revision_id.dimmed());
    println!("    Status:   {}", colorize_status(run.status));
    println!(
        "    Created:  {}",
        run.requested_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_run_details(run: &Run) {
    println!("{}", "Run Details:".bold());
    println!("  ID:         {}", run.run_id.to_string().cyan());
    println!("  Pipeline:   {} v{}", run.pipeline, run.definition_version);
    println!("  Revision:   {}", run.revision_id);
    println!("  Status:     {}", colorize_status(run.status));
    println!(
        "  Requested:  {}",
        run.requested_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(started) = run.started_at {
        println!("  Started:    {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(finished) = run.finished_at {
        println!("  Finished:   {}", finished.format("%Y-%m-%d %H:%M:%S"));
        if let Some(started) = run.started_at {
            let duration = finished.signed_duration_since(started);
            println!("  Duration:   {}s", duration.num_seconds());
        }
    }

    println!("\n{}", "Stages:".bold());
    for stage in &run.stages {
        let marker = match stage.status {
            StageStatus::Succeeded => "✓".green(),
            StageStatus::Failed => "✗".red(),
            StageStatus::Skipped => "-".dimmed(),
            StageStatus::Running => "…".cyan(),
            StageStatus::Pending => "·".dimmed(),
        };
        let duration = stage
            .duration()
            .map(|d| format!("{}ms", d.num_milliseconds()))
            .unwrap_or_default();

        println!(
            "  {} {} {} {}",
            marker,
            stage.stage_name.bold(),
            format!("attempts: {}", stage.attempts).dimmed(),
            duration.dimmed()
        );
        if let Some(error) = &stage.error {
            println!("      {}", error.red());
        }
    }

    if let Some(error) = &run.error {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }
}

fn print_log_entry(log: &LogEntry) {
    let level_str = log.level.as_str().to_uppercase();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };
    let stage = match (&log.stage, log.attempt) {
        (Some(stage), Some(attempt)) => format!("{stage}#{attempt} "),
        (Some(stage), None) => format!("{stage} "),
        _ => String::new(),
    };

    println!(
        "{} [{}] {}{}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        level_colored,
        stage.cyan(),
        log.message
    );
}

fn colorize_status(status: RunStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        RunStatus::Queued => status_str.yellow(),
        RunStatus::Running => status_str.cyan(),
        RunStatus::Succeeded => status_str.green(),
        RunStatus::Failed => status_str.red(),
        RunStatus::Aborted => status_str.dimmed(),
    }
}
