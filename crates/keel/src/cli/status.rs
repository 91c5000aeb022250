use anyhow::Result;
use clap::Parser;
use console::style;
use uuid::Uuid;

use super::{connect, styled_step_status, styled_workflow_status};

/// Show the status of a workflow instance.
#[derive(Parser)]
pub struct StatusCommand {
    /// Workflow instance ID.
    pub instance_id: Uuid,

    /// Print the status as JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusCommand {
    /// Execute the status command.
    pub async fn execute(self, config_path: &str) -> Result<()> {
        let client = connect(config_path).await?;
        let status = client.get_status(self.instance_id).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }

        println!();
        println!(
            "  {} {}  {}",
            style(&status.workflow_type).bold(),
            style(status.instance_id).dim(),
            styled_workflow_status(status.status)
        );
        println!("  created   {}", status.created_at.to_rfc3339());
        if let Some(completed_at) = status.completed_at {
            println!("  finished  {}", completed_at.to_rfc3339());
        }
        if let Some(error) = &status.error {
            println!("  {} {}", style("error").red().bold(), error);
        }
        if let Some(output) = &status.output {
            println!("  output    {}", output);
        }

        println!();
        for step in &status.steps {
            println!(
                "  {:>3}  {:<8} {:<24} {:<10} attempts={}",
                step.seq,
                step.kind.to_string(),
                step.name,
                styled_step_status(step.status),
                step.attempts
            );
            if let Some(error) = &step.error {
                println!("       {}", style(error).red());
            }
        }
        println!();

        Ok(())
    }
}
