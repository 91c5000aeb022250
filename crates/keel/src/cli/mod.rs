mod cancel;
mod events;
mod signal;
mod status;

pub use cancel::CancelCommand;
pub use events::EventsCommand;
pub use signal::SignalCommand;
pub use status::StatusCommand;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use keel_core::config::KeelConfig;
use keel_core::workflow::{StepStatus, WorkflowStatus};
use keel_runtime::observability::init_tracing;
use keel_runtime::{Database, PgStore, Registry, WorkflowClient};

/// KEEL - inspect and control durable workflows
#[derive(Parser)]
#[command(name = "keel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true, default_value = "keel.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Show the status of a workflow instance.
    Status(StatusCommand),

    /// Show the event history of a workflow instance.
    Events(EventsCommand),

    /// Deliver a signal to a waiting workflow instance.
    Signal(SignalCommand),

    /// Cancel a workflow instance.
    Cancel(CancelCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Status(cmd) => cmd.execute(&self.config).await,
            Commands::Events(cmd) => cmd.execute(&self.config).await,
            Commands::Signal(cmd) => cmd.execute(&self.config).await,
            Commands::Cancel(cmd) => cmd.execute(&self.config).await,
        }
    }
}

fn load_config(path: &str) -> Result<KeelConfig> {
    if !Path::new(path).exists() {
        anyhow::bail!(
            "Configuration file not found: {}\nPass --config or create keel.toml with a [database] section.",
            path
        );
    }
    KeelConfig::from_file(path).with_context(|| format!("Failed to load {}", path))
}

/// Connect a client to the configured database.
async fn connect(config_path: &str) -> Result<WorkflowClient> {
    let config = load_config(config_path)?;
    init_tracing(&config.observability.logging)?;

    let db = Database::from_config(&config.database)
        .await
        .context("Failed to connect to database")?;
    let store = Arc::new(PgStore::new(db.pool().clone()));

    Ok(WorkflowClient::new(
        store,
        Arc::new(Registry::new()),
        config.worker.commit_retries,
    ))
}

fn styled_workflow_status(status: WorkflowStatus) -> String {
    let text = status.to_string();
    match status {
        WorkflowStatus::Completed => style(text).green().to_string(),
        WorkflowStatus::Failed => style(text).red().to_string(),
        WorkflowStatus::Cancelled => style(text).yellow().to_string(),
        _ => style(text).cyan().to_string(),
    }
}

fn styled_step_status(status: StepStatus) -> String {
    let text = status.to_string();
    match status {
        StepStatus::Succeeded => style(text).green().to_string(),
        StepStatus::Failed => style(text).red().to_string(),
        StepStatus::Cancelled => style(text).yellow().to_string(),
        StepStatus::Running => style(text).cyan().to_string(),
        _ => style(text).dim().to_string(),
    }
}
