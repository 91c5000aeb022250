use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// Worker process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker identity recorded on claimed steps; generated when unset.
    #[serde(default)]
    pub id: Option<String>,

    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum steps claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum concurrently executing steps.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Claim lease in seconds.
    #[serde(default = "default_lease")]
    pub lease_secs: u64,

    /// Default activity timeout in seconds.
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_secs: u64,

    /// How long shutdown waits for in-flight steps.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Commit attempts before a version conflict is given up on.
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            max_concurrent: default_max_concurrent(),
            lease_secs: default_lease(),
            activity_timeout_secs: default_activity_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            commit_retries: default_commit_retries(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Interval between heartbeats of a long-running step.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease() / 3
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.max_concurrent == 0 {
            return Err(KeelError::Config(
                "worker batch_size and max_concurrent must be positive".into(),
            ));
        }
        if self.lease_secs == 0 {
            return Err(KeelError::Config("worker lease_secs must be positive".into()));
        }
        if self.commit_retries == 0 {
            return Err(KeelError::Config(
                "worker commit_retries must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_poll_interval() -> u64 {
    500
}

fn default_batch_size() -> usize {
    10
}

fn default_max_concurrent() -> usize {
    32
}

fn default_lease() -> u64 {
    30
}

fn default_activity_timeout() -> u64 {
    300
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_commit_retries() -> u32 {
    5
}
