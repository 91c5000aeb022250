use anyhow::Result;
use clap::Parser;
use console::style;
use uuid::Uuid;

use super::{connect, styled_workflow_status};

/// Cancel a workflow instance.
#[derive(Parser)]
pub struct CancelCommand {
    /// Workflow instance ID.
    pub instance_id: Uuid,
}

impl CancelCommand {
    /// Execute the cancel command.
    pub async fn execute(self, config_path: &str) -> Result<()> {
        let client = connect(config_path).await?;
        client.cancel(self.instance_id).await?;

        let status = client.get_status(self.instance_id).await?;
        println!(
            "{} {} is {}",
            style("✓").green().bold(),
            self.instance_id,
            styled_workflow_status(status.status)
        );
        Ok(())
    }
}
