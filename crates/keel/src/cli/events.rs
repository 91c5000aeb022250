use anyhow::Result;
use clap::Parser;
use console::style;
use uuid::Uuid;

use keel_core::workflow::{Event, EventStatus};

use super::connect;

/// Show the event history of a workflow instance.
#[derive(Parser)]
pub struct EventsCommand {
    /// Workflow instance ID.
    pub instance_id: Uuid,

    /// Only step events, without the workflow start and end markers.
    #[arg(long)]
    pub timeline: bool,

    /// Print events as JSON.
    #[arg(long)]
    pub json: bool,
}

impl EventsCommand {
    /// Execute the events command.
    pub async fn execute(self, config_path: &str) -> Result<()> {
        let client = connect(config_path).await?;
        let events = if self.timeline {
            client.timeline(self.instance_id).await?
        } else {
            client.get_events(self.instance_id).await?
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&events)?);
            return Ok(());
        }

        for event in &events {
            println!("{}", format_event(event));
        }
        Ok(())
    }
}

fn format_event(event: &Event) -> String {
    let status = match event.status {
        EventStatus::Succeeded => style(event.status).green(),
        EventStatus::Failed => style(event.status).red(),
        EventStatus::Retrying | EventStatus::Cancelled => style(event.status).yellow(),
        EventStatus::Started => style(event.status).cyan(),
    };
    let took = event
        .duration()
        .map(|d| format!(" ({}ms)", d.num_milliseconds()))
        .unwrap_or_default();

    format!(
        "{:>4}  {}  {:<8} {:<24} {}{}",
        event.sequence,
        event.started_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        event.category.to_string(),
        event.name,
        status,
        style(took).dim()
    )
}
