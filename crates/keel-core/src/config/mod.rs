mod database;
mod observability;
mod worker;

pub use database::DatabaseConfig;
pub use observability::{LoggingConfig, ObservabilityConfig};
pub use worker::WorkerConfig;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{KeelError, Result};
use crate::retry::RetryPolicy;

/// Root configuration for KEEL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeelConfig {
    /// Database configuration.
    pub database: DatabaseConfig,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Default retry policies per step kind.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl KeelConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| KeelError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| KeelError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration with defaults for everything but the database URL.
    pub fn default_with_database_url(url: &str) -> Self {
        Self {
            database: DatabaseConfig {
                url: url.to_string(),
                ..Default::default()
            },
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.retry.activity.validate()?;
        Ok(())
    }
}

/// Retry policies per step kind. Only activities run fallible host code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub activity: RetryPolicy,
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| KeelError::Internal(format!("invalid substitution pattern: {}", e)))?;

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => result = result.replace(&cap[0], &value),
            Err(_) => tracing::debug!(var = var_name, "Config references unset variable"),
        }
    }

    Ok(result)
}
