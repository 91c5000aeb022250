use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instance::WorkflowError;
use crate::error::KeelError;

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Activity,
    Signal,
    Await,
    Sleep,
}

impl StepKind {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activity => "activity",
            Self::Signal => "signal",
            Self::Await => "await",
            Self::Sleep => "sleep",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepKind {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activity" => Ok(Self::Activity),
            "signal" => Ok(Self::Signal),
            "await" => Ok(Self::Await),
            "sleep" => Ok(Self::Sleep),
            other => Err(KeelError::Serialization(format!(
                "unknown step kind '{}'",
                other
            ))),
        }
    }
}

/// Step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Blocked on a signal or an awaited step.
    Pending,
    /// Claimable once `next_eligible_at` has passed.
    Ready,
    /// Claimed by a worker.
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepStatus {
    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Pending or ready steps, which are cancelled with their instance.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(KeelError::Serialization(format!(
                "unknown step status '{}'",
                other
            ))),
        }
    }
}

/// Identifies a step: (instance id, sequence index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId {
    pub instance_id: Uuid,
    pub seq: i32,
}

impl StepId {
    pub fn new(instance_id: Uuid, seq: i32) -> Self {
        Self { instance_id, seq }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.instance_id, self.seq)
    }
}

/// A materialized step of a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub instance_id: Uuid,
    /// Position in the workflow definition.
    pub seq: i32,
    pub kind: StepKind,
    /// Activity name, signal name, or `sleep` / `await`.
    pub name: String,
    pub status: StepStatus,
    /// Committed executions so far.
    pub attempts: i32,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Earliest time the scheduler may claim the step.
    pub next_eligible_at: DateTime<Utc>,
    /// Wake time of a sleep step.
    pub wake_at: Option<DateTime<Utc>>,
    /// Sequence index awaited by an await step.
    pub awaits: Option<i32>,
    /// Detached activities run alongside the steps that follow them.
    pub detached: bool,
    pub claimed_by: Option<String>,
    pub claim_token: Option<Uuid>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// When the chain reached this step.
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn base(
        instance_id: Uuid,
        seq: i32,
        kind: StepKind,
        name: impl Into<String>,
        status: StepStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            seq,
            kind,
            name: name.into(),
            status,
            attempts: 0,
            input: None,
            output: None,
            error: None,
            next_eligible_at: now,
            wake_at: None,
            awaits: None,
            detached: false,
            claimed_by: None,
            claim_token: None,
            claim_expires_at: None,
            started_at: now,
            completed_at: None,
        }
    }

    /// A ready activity step.
    pub fn activity(
        instance_id: Uuid,
        seq: i32,
        name: impl Into<String>,
        detached: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let mut step = Self::base(instance_id, seq, StepKind::Activity, name, StepStatus::Ready, now);
        step.detached = detached;
        step
    }

    /// A sleep step, claimable once it is due.
    pub fn sleep(instance_id: Uuid, seq: i32, wake_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let mut step = Self::base(instance_id, seq, StepKind::Sleep, "sleep", StepStatus::Ready, now);
        step.wake_at = Some(wake_at);
        step.next_eligible_at = wake_at;
        step
    }

    /// A signal step, pending until the signal is delivered.
    pub fn signal(instance_id: Uuid, seq: i32, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::base(instance_id, seq, StepKind::Signal, name, StepStatus::Pending, now)
    }

    /// An await step; ready immediately if the awaited step already succeeded.
    pub fn await_step(
        instance_id: Uuid,
        seq: i32,
        awaits: i32,
        available: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let status = if available {
            StepStatus::Ready
        } else {
            StepStatus::Pending
        };
        let mut step = Self::base(instance_id, seq, StepKind::Await, "await", status, now);
        step.awaits = Some(awaits);
        step
    }

    /// Attach the step input.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn id(&self) -> StepId {
        StepId::new(self.instance_id, self.seq)
    }

    /// Whether the step holds a claim that has not expired at `now`.
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Running
            && self.claim_expires_at.is_some_and(|expires| expires > now)
    }

    /// Whether the scheduler may claim the step at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            StepStatus::Ready => self.next_eligible_at <= now,
            StepStatus::Running => !self.has_live_claim(now),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_conversion() {
        assert_eq!(StepStatus::Ready.as_str(), "ready");
        assert_eq!(
            "succeeded".parse::<StepStatus>().unwrap(),
            StepStatus::Succeeded
        );
        assert_eq!("await".parse::<StepKind>().unwrap(), StepKind::Await);
        assert!(StepStatus::Cancelled.is_terminal());
        assert!(StepStatus::Pending.is_open());
        assert!(!StepStatus::Running.is_open());
    }

    #[test]
    fn test_sleep_step_not_claimable_before_wake() {
        let now = Utc::now();
        let step = StepRecord::sleep(Uuid::new_v4(), 1, now + Duration::seconds(2), now);
        assert_eq!(step.status, StepStatus::Ready);
        assert!(!step.is_claimable(now));
        assert!(step.is_claimable(now + Duration::seconds(2)));
    }

    #[test]
    fn test_expired_claim_is_claimable() {
        let now = Utc::now();
        let mut step = StepRecord::activity(Uuid::new_v4(), 0, "charge", false, now);
        step.status = StepStatus::Running;
        step.claim_expires_at = Some(now + Duration::seconds(30));
        assert!(step.has_live_claim(now));
        assert!(!step.is_claimable(now));
        assert!(step.is_claimable(now + Duration::seconds(31)));
    }

    #[test]
    fn test_await_step_readiness() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        assert_eq!(
            StepRecord::await_step(id, 3, 1, true, now).status,
            StepStatus::Ready
        );
        assert_eq!(
            StepRecord::await_step(id, 3, 1, false, now).status,
            StepStatus::Pending
        );
    }
}
