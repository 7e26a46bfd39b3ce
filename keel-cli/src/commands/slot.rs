//! Slot command handlers

use anyhow::Result;
use clap::Subcommand;
use colored::*;
use keel_client::OrchestratorClient;
use keel_core::domain::artifact::short_digest;
use keel_core::domain::slot::{DeploymentSlot, HealthStatus};

use crate::config::Config;

/// Slot subcommands
#[derive(Subcommand)]
pub enum SlotCommands {
    /// List deployment slots
    List,
    /// Get slot details
    Get {
        /// Slot ID
        id: String,
    },
    /// Roll a slot back to the artifact it ran before
    Rollback {
        /// Slot ID
        id: String,
    },
}

pub async fn handle_slot_command(command: SlotCommands, config: &Config) -> Result<()> {
    let client = OrchestratorClient::new(&config.orchestrator_url);

    match command {
        SlotCommands::List => {
            let slots = client.list_slots().await?;
            if slots.is_empty() {
                println!("{}", "No slots found.".yellow());
            }
            for slot in slots {
                print_slot(&slot);
            }
            Ok(())
        }
        SlotCommands::Get { id } => {
            print_slot(&client.get_slot(&id).await?);
            Ok(())
        }
        SlotCommands::Rollback { id } => {
            let slot = client.rollback_slot(&id).await?;
            println!("{}", "✓ Rollback complete".green().bold());
            print_slot(&slot);
            Ok(())
        }
    }
}

fn print_slot(slot: &DeploymentSlot) {
    let health = match slot.health_status {
        HealthStatus::Healthy => slot.health_status.to_string().green(),
        HealthStatus::Unhealthy => slot.health_status.to_string().red(),
        HealthStatus::Unknown => slot.health_status.to_string().dimmed(),
    };
    let digest = |d: &Option<String>| {
        d.as_deref()
            .map(short_digest)
            .unwrap_or("-")
            .to_string()
    };

    println!("  {} {}", "▸".cyan(), slot.slot_id.bold());
    println!("    Current:  {}", digest(&slot.current_artifact_digest).cyan());
    println!("    Previous: {}", digest(&slot.previous_artifact_digest).dimmed());
    println!("    Health:   {}", health);
    println!("    Phase:    {}", slot.phase);
    println!(
        "    Updated:  {}",
        slot.updated_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!();
}
