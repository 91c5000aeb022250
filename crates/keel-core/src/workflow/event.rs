use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::step::{StepKind, StepRecord};
use crate::error::KeelError;

/// Event category, one per step kind plus instance-level markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventCategory {
    Activity,
    Signal,
    Await,
    Sleep,
    /// Instance start/end markers.
    Workflow,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "ACTIVITY",
            Self::Signal => "SIGNAL",
            Self::Await => "AWAIT",
            Self::Sleep => "SLEEP",
            Self::Workflow => "WORKFLOW",
        }
    }
}

impl From<StepKind> for EventCategory {
    fn from(kind: StepKind) -> Self {
        match kind {
            StepKind::Activity => Self::Activity,
            StepKind::Signal => Self::Signal,
            StepKind::Await => Self::Await,
            StepKind::Sleep => Self::Sleep,
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVITY" => Ok(Self::Activity),
            "SIGNAL" => Ok(Self::Signal),
            "AWAIT" => Ok(Self::Await),
            "SLEEP" => Ok(Self::Sleep),
            "WORKFLOW" => Ok(Self::Workflow),
            other => Err(KeelError::Serialization(format!(
                "unknown event category '{}'",
                other
            ))),
        }
    }
}

/// What the event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Succeeded,
    /// A failed attempt that will be retried.
    Retrying,
    Failed,
    Cancelled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "retrying" => Ok(Self::Retrying),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(KeelError::Serialization(format!(
                "unknown event status '{}'",
                other
            ))),
        }
    }
}

/// An immutable history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub instance_id: Uuid,
    /// Per-instance write order, starting at 1.
    pub sequence: i64,
    /// Step index; `None` for workflow-level markers.
    pub step_seq: Option<i32>,
    pub category: EventCategory,
    pub status: EventStatus,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<serde_json::Value>,
}

impl Event {
    /// Time between start and end, if the event has ended.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

/// An event waiting for the store to assign its sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub step_seq: Option<i32>,
    pub category: EventCategory,
    pub status: EventStatus,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<serde_json::Value>,
}

impl EventDraft {
    /// Instance-level marker (start or end) at a single instant.
    pub fn workflow(
        workflow_type: &str,
        status: EventStatus,
        at: DateTime<Utc>,
        summary: Option<serde_json::Value>,
    ) -> Self {
        Self {
            step_seq: None,
            category: EventCategory::Workflow,
            status,
            name: workflow_type.to_string(),
            started_at: at,
            ended_at: Some(at),
            summary,
        }
    }

    /// Outcome of a step, spanning from when the chain reached it until `ended_at`.
    pub fn step(
        step: &StepRecord,
        status: EventStatus,
        ended_at: DateTime<Utc>,
        summary: Option<serde_json::Value>,
    ) -> Self {
        Self {
            step_seq: Some(step.seq),
            category: step.kind.into(),
            status,
            name: step.name.clone(),
            started_at: step.started_at,
            ended_at: Some(ended_at.max(step.started_at)),
            summary,
        }
    }

    /// Finalize with the sequence assigned by the store.
    pub fn into_event(self, instance_id: Uuid, sequence: i64) -> Event {
        Event {
            instance_id,
            sequence,
            step_seq: self.step_seq,
            category: self.category,
            status: self.status,
            name: self.name,
            started_at: self.started_at,
            ended_at: self.ended_at,
            summary: self.summary,
        }
    }
}

/// Sort events into history order: start time, then write order.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then(a.sequence.cmp(&b.sequence))
    });
}
