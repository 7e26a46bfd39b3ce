//! Pipeline command handlers
//!
//! Handles registering, listing and viewing pipeline definitions, and the
//! manual revision trigger.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use keel_client::OrchestratorClient;
use keel_core::domain::pipeline::PipelineDefinition;
use keel_core::dto::pipeline::{CreatePipeline, PipelineSummary};
use keel_core::dto::trigger::{TriggerOutcome, TriggerRevision};

use crate::config::Config;

/// Pipeline subcommands
#[derive(Subcommand)]
pub enum PipelineCommands {
    /// Register a pipeline from a JSON definition
    Create {
        /// Path to the definition file
        #[arg(short, long)]
        file: String,

        /// Override the pipeline name from the file
        #[arg(short, long)]
        name: Option<String>,
    },
    /// List all pipelines
    List,
    /// Get the latest definition of a pipeline
    Get {
        /// Pipeline name
        name: String,
    },
}

pub async fn handle_pipeline_command(command: PipelineCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        PipelineCommands::Create { file, name } => create_pipeline(&client, &file, name).await,
        PipelineCommands::List => list_pipelines(&client).await,
        PipelineCommands::Get { name } => get_pipeline(&client, &name).await,
    }
}

/// Register a definition read from a JSON file
async fn create_pipeline(
    client: &OrchestratorClient,
    path: &str,
    name_override: Option<String>,
) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read definition file: {}", path))?;
    let mut req: CreatePipeline = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse pipeline definition: {}", path))?;

    if let Some(name) = name_override {
        req.name = name;
    }

    let definition = client.create_pipeline(&req).await?;

    println!("{}", "✓ Pipeline registered successfully!".green().bold());
    println!("  Name:    {}", definition.name.bold());
    println!("  Version: {}", definition.version.to_string().cyan());
    println!(
        "  Stages:  {}",
        definition
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
            .dimmed()
    );

    Ok(())
}

async fn list_pipelines(client: &OrchestratorClient) -> Result<()> {
    let pipelines = client.list_pipelines().await?;

    if pipelines.is_empty() {
        println!("{}", "No pipelines found.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} pipeline(s):", pipelines.len()).bold()
        );
        println!();
        for pipeline in pipelines {
            print_pipeline_summary(&pipeline);
        }
    }

    Ok(())
}

async fn get_pipeline(client: &OrchestratorClient, name: &str) -> Result<()> {
    let definition = client.get_pipeline(name).await?;
    print_pipeline_details(&definition);
    Ok(())
}

/// Announce a revision, as a source webhook would
pub async fn trigger(
    config: &Config,
    pipeline: &str,
    revision: String,
    parent_id: Option<String>,
) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);
    let outcome = client
        .trigger(pipeline, &TriggerRevision { revision, parent_id })
        .await?;

    match outcome {
        TriggerOutcome::Started { run_id } => {
            println!("{}", "✓ Run started".green().bold());
            println!("  Run ID: {}", run_id.to_string().cyan());
        }
        TriggerOutcome::Queued => {
            println!(
                "{}",
                "Revision queued behind the active run.".yellow()
            );
        }
        TriggerOutcome::Duplicate => {
            println!("{}", "Revision is already running or queued.".dimmed());
        }
    }

    Ok(())
}

fn print_pipeline_summary(pipeline: &PipelineSummary) {
    println!(
        "  {} {} {}",
        "▸".cyan(),
        pipeline.name.bold(),
        format!("v{}", pipeline.version).dimmed()
    );
    println!("    Stages:  {}", pipeline.stage_count.to_string().dimmed());
    if let Some(repository) = &pipeline.repository {
        println!("    Source:  {}", repository.dimmed());
    }
    println!(
        "    Created: {}",
        pipeline
            .created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}

fn print_pipeline_details(definition: &PipelineDefinition) {
    println!("{}", "Pipeline Details:".bold());
    println!("  Name:     {}", definition.name.bold());
    println!("  Version:  {}", definition.version.to_string().cyan());
    if let Some(source) = &definition.source {
        println!("  Source:   {} ({})", source.repository, source.branch);
    }
    println!(
        "  Created:  {}",
        definition.created_at.format("%Y-%m-%d %H:%M:%S")
    );

    println!("\n{}", "Stages:".bold());
    for (index, stage) in definition.stages.iter().enumerate() {
        let mut flags = Vec::new();
        if stage.retryable {
            flags.push("retryable");
        }
        if stage.continue_on_failure {
            flags.push("non-fatal");
        }

        println!(
            "  {}. {} [{}] timeout {}s {}",
            index + 1,
            stage.name.bold(),
            stage.action.to_string().cyan(),
            stage.timeout_seconds,
            flags.join(", ").dimmed()
        );
        if let Ok(params) = serde_json::to_string(&stage.parameters) {
            println!("     {}", params.dimmed());
        }
    }
}
