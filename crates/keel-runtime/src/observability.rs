use tracing_subscriber::EnvFilter;

use keel_core::config::LoggingConfig;
use keel_core::error::{KeelError, Result};

/// Install the global fmt subscriber. `RUST_LOG` overrides the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| KeelError::Config(format!("Invalid log level '{}': {}", config.level, e)))?;

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };

    installed.map_err(|e| KeelError::Config(format!("Failed to install subscriber: {}", e)))
}
