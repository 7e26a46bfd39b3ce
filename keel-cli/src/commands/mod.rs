//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod pipeline;
mod registry;
mod run;
mod slot;

pub use pipeline::PipelineCommands;
pub use registry::RegistryCommands;
pub use run::RunCommands;
pub use slot::SlotCommands;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pipeline management
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Announce a revision for a pipeline
    Trigger {
        /// Pipeline name
        pipeline: String,

        /// Revision id (commit hash or sequence number)
        revision: String,

        /// Revision observed before this one
        #[arg(long)]
        parent: Option<String>,
    },
    /// Run history, logs and aborts
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Deployment slots
    Slot {
        #[command(subcommand)]
        command: SlotCommands,
    },
    /// Artifact registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },
    /// Show raised alerts
    Alerts,
}

/// Routes a command to its handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Pipeline { command } => pipeline::handle_pipeline_command(command, config).await,
        Commands::Trigger {
            pipeline,
            revision,
            parent,
        } => pipeline::trigger(config, &pipeline, revision, parent).await,
        Commands::Run { command } => run::handle_run_command(command, config).await,
        Commands::Slot { command } => slot::handle_slot_command(command, config).await,
        Commands::Registry { command } => registry::handle_registry_command(command, config).await,
        Commands::Alerts => registry::list_alerts(config).await,
    }
}
