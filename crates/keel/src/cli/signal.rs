use anyhow::Result;
use clap::Parser;
use console::style;
use uuid::Uuid;

use super::connect;

/// Deliver a signal to a waiting workflow instance.
#[derive(Parser)]
pub struct SignalCommand {
    /// Workflow instance ID.
    pub instance_id: Uuid,

    /// Signal name.
    pub name: String,

    /// JSON payload handed to the signal step.
    #[arg(short, long, default_value = "null", value_parser = parse_payload)]
    pub payload: serde_json::Value,
}

fn parse_payload(raw: &str) -> std::result::Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON payload: {}", e))
}

impl SignalCommand {
    /// Execute the signal command.
    pub async fn execute(self, config_path: &str) -> Result<()> {
        let client = connect(config_path).await?;
        client
            .signal(self.instance_id, &self.name, self.payload)
            .await?;

        println!(
            "{} Signal '{}' delivered to {}",
            style("✓").green().bold(),
            self.name,
            self.instance_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use serde_json::json;

    use crate::cli::{Cli, Commands};

    const ID: &str = "0b7d1f6a-3c1e-4a4f-9a53-0d4c2f1f9e11";

    #[test]
    fn test_signal_payload_parsed() {
        let cli = Cli::try_parse_from([
            "keel",
            "signal",
            ID,
            "approved",
            "--payload",
            r#"{"by":"ops"}"#,
        ])
        .unwrap();
        let Commands::Signal(cmd) = cli.command else {
            panic!("expected signal command");
        };
        assert_eq!(cmd.name, "approved");
        assert_eq!(cmd.payload, json!({ "by": "ops" }));
    }

    #[test]
    fn test_signal_payload_defaults_to_null() {
        let cli = Cli::try_parse_from(["keel", "signal", ID, "approved"]).unwrap();
        let Commands::Signal(cmd) = cli.command else {
            panic!("expected signal command");
        };
        assert!(cmd.payload.is_null());
    }

    #[test]
    fn test_signal_rejects_invalid_json() {
        let result =
            Cli::try_parse_from(["keel", "signal", ID, "approved", "--payload", "{oops"]);
        assert!(result.is_err());
    }
}
