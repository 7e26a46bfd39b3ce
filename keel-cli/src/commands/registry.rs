//! Registry and alert command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use keel_client::OrchestratorClient;
use keel_core::domain::artifact::short_digest;

use crate::config::Config;

/// Registry subcommands
#[derive(Subcommand)]
pub enum RegistryCommands {
    /// List the aliases of a namespace
    Tags {
        /// Namespace (pipeline name)
        namespace: String,
    },
    /// Show the artifact an alias points at
    Pull {
        /// Namespace (pipeline name)
        namespace: String,

        /// Alias, e.g. latest
        tag: String,
    },
}

pub async fn handle_registry_command(command: RegistryCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        RegistryCommands::Tags { namespace } => {
            let tags = client.list_tags(&namespace).await?;
            if tags.is_empty() {
                println!("{}", format!("No tags in {}.", namespace).yellow());
            }
            for tag in tags {
                println!(
                    "  {}:{} → {}",
                    tag.namespace.dimmed(),
                    tag.tag.bold(),
                    short_digest(&tag.digest).cyan()
                );
            }
            Ok(())
        }
        RegistryCommands::Pull { namespace, tag } => {
            let artifact = client.pull_tag(&namespace, &tag).await?;
            println!("{}", "Artifact:".bold());
            println!("  Digest:  {}", artifact.digest.cyan());
            println!("  Run:     {}", artifact.run_id);
            println!("  Size:    {} bytes", artifact.size_bytes);
            println!(
                "  Created: {}",
                artifact.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            Ok(())
        }
    }
}

pub async fn list_alerts(config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);
    let alerts = client.list_alerts().await?;

    if alerts.is_empty() {
        println!("{}", "No alerts.".green());
        return Ok(());
    }

    for alert in alerts {
        let run = alert
            .run_id
            .map(|id| format!(" run {}", id))
            .unwrap_or_default();
        println!(
            "{} {} {}{}: {}",
            alert.raised_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            format!("{:?}", alert.kind).red().bold(),
            alert.pipeline.bold(),
            run,
            alert.message
        );
    }

    Ok(())
}
