use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::StepRecord;
use crate::error::KeelError;

/// Workflow instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Steps are still being scheduled.
    Running,
    /// The final step succeeded.
    Completed,
    /// A step failed terminally.
    Failed,
    /// Cancelled by an external caller.
    Cancelled,
}

impl WorkflowStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if the workflow is terminal (no longer running).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(KeelError::Serialization(format!(
                "unknown workflow status '{}'",
                other
            ))),
        }
    }
}

/// Terminal error recorded on a failed step or workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowError {
    /// Error class, matched against the retry policy's non-retryable set.
    pub class: String,
    /// Human readable message.
    pub message: String,
}

impl WorkflowError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

/// A durable workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Unique instance ID.
    pub id: Uuid,
    /// Registered workflow type.
    pub workflow_type: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Input data as JSON.
    pub input: serde_json::Value,
    /// Output data as JSON (only when completed).
    pub output: Option<serde_json::Value>,
    /// Terminal error (only when failed).
    pub error: Option<WorkflowError>,
    /// Optimistic concurrency version, bumped by every transition.
    pub version: i64,
    /// When the instance was submitted.
    pub created_at: DateTime<Utc>,
    /// When the instance reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Create a new running instance.
    pub fn new(workflow_type: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_type: workflow_type.into(),
            status: WorkflowStatus::Running,
            input,
            output: None,
            error: None,
            version: 1,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Mark as completed.
    pub fn complete(&mut self, output: serde_json::Value, at: DateTime<Utc>) {
        self.status = WorkflowStatus::Completed;
        self.output = Some(output);
        self.completed_at = Some(at);
    }

    /// Mark as failed.
    pub fn fail(&mut self, error: WorkflowError, at: DateTime<Utc>) {
        self.status = WorkflowStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(at);
    }

    /// Mark as cancelled.
    pub fn cancel(&mut self, at: DateTime<Utc>) {
        self.status = WorkflowStatus::Cancelled;
        self.completed_at = Some(at);
    }
}

/// Consistent view of an instance and its materialized steps.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance: WorkflowInstance,
    /// Steps ordered by sequence index.
    pub steps: Vec<StepRecord>,
}

impl InstanceSnapshot {
    /// Find a step by sequence index.
    pub fn step(&self, seq: i32) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.seq == seq)
    }

    /// Mutable access to a step by sequence index.
    pub fn step_mut(&mut self, seq: i32) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|s| s.seq == seq)
    }
}
