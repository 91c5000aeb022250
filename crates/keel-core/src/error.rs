use thiserror::Error;
use uuid::Uuid;

use crate::workflow::StepId;

/// Core error type for KEEL operations.
#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// An append collided with an existing event.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("Lease lost for step {step}")]
    LeaseLost { step: StepId },

    #[error("No pending waiter for signal '{signal}' on workflow {instance_id}")]
    NoMatchingWaiter { instance_id: Uuid, signal: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KeelError {
    /// Whether the error is an optimistic-concurrency conflict that the caller
    /// recovers from by re-reading state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Conflict(_))
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(e: serde_json::Error) -> Self {
        KeelError::Serialization(e.to_string())
    }
}

/// Result type alias using KeelError.
pub type Result<T> = std::result::Result<T, KeelError>;
