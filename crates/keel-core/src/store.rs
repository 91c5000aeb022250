//! Persistence contracts for workflow state and history.
//!
//! A [`WorkflowRepository`] owns instances and steps and writes events in the
//! same atomic unit as the state change they describe. Every state change goes
//! through [`WorkflowRepository::transition`], which checks the instance
//! version so concurrent writers never overwrite each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::TryStreamExt;
use uuid::Uuid;

use crate::error::Result;
use crate::workflow::{
    Event, EventDraft, InstanceSnapshot, StepId, StepRecord, StepStatus, WorkflowError,
    WorkflowInstance,
};

/// Append-only event history.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Write one event. Fails with `Conflict` if the instance already has an
    /// event with the same sequence.
    async fn append(&self, event: &Event) -> Result<()>;

    /// Events of an instance in history order. Each call starts a fresh read.
    fn stream_for(&self, instance_id: Uuid) -> BoxStream<'_, Result<Event>>;

    /// Collect the full history of an instance.
    async fn events_for(&self, instance_id: Uuid) -> Result<Vec<Event>> {
        self.stream_for(instance_id).try_collect().await
    }
}

/// Durable current state of instances and steps.
#[async_trait]
pub trait WorkflowRepository: EventStore {
    /// Persist a new instance with its initial steps and the workflow start
    /// event. Fails with `Duplicate` if the id exists.
    async fn create(
        &self,
        instance: &WorkflowInstance,
        steps: &[StepRecord],
        started: EventDraft,
    ) -> Result<()>;

    /// Apply a transition atomically and return the new instance version.
    async fn transition(&self, transition: Transition) -> Result<i64>;

    async fn load_instance(&self, id: Uuid) -> Result<WorkflowInstance>;

    /// Instance plus steps ordered by sequence index.
    async fn load_snapshot(&self, id: Uuid) -> Result<InstanceSnapshot>;

    /// Claim up to `limit` eligible steps, at most one per instance.
    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedStep>>;

    /// Extend a live claim and return the new expiry.
    async fn heartbeat(&self, step: StepId, token: Uuid, lease: Duration)
        -> Result<DateTime<Utc>>;
}

/// A step claimed for execution together with its instance.
#[derive(Debug, Clone)]
pub struct ClaimedStep {
    pub instance: WorkflowInstance,
    pub step: StepRecord,
}

impl ClaimedStep {
    /// The claim token minted for this claim.
    pub fn token(&self) -> Option<Uuid> {
        self.step.claim_token
    }
}

/// A version-checked state change of one instance.
#[derive(Debug, Clone)]
pub struct Transition {
    pub instance_id: Uuid,
    /// Version the change was planned against.
    pub expected_version: i64,
    pub step: Option<StepChange>,
    /// Applied in order after the step change.
    pub effects: Vec<Effect>,
}

impl Transition {
    pub fn new(instance_id: Uuid, expected_version: i64) -> Self {
        Self {
            instance_id,
            expected_version,
            step: None,
            effects: Vec::new(),
        }
    }

    pub fn with_step(mut self, change: StepChange) -> Self {
        self.step = Some(change);
        self
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Update of a single step. The claim is always released.
#[derive(Debug, Clone)]
pub struct StepChange {
    pub seq: i32,
    /// Claim the change is made under; the store rejects the change with
    /// `LeaseLost` unless this claim is still live.
    pub claim_token: Option<Uuid>,
    pub update: StepUpdate,
}

/// New values for a step's mutable columns.
#[derive(Debug, Clone)]
pub struct StepUpdate {
    pub status: StepStatus,
    pub attempts: i32,
    /// Replaces the input when set.
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    /// Replaces the next eligible time when set.
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepUpdate {
    /// Keep the step's current values, changing only the status.
    pub fn from_step(step: &StepRecord, status: StepStatus) -> Self {
        Self {
            status,
            attempts: step.attempts,
            input: None,
            output: step.output.clone(),
            error: step.error.clone(),
            next_eligible_at: None,
            completed_at: step.completed_at,
        }
    }
}

/// Side effects applied with a transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Materialize a step the chain has reached.
    InsertStep(StepRecord),
    /// Move a pending step to ready, optionally replacing its input.
    MarkReady {
        seq: i32,
        input: Option<serde_json::Value>,
        at: DateTime<Utc>,
    },
    CompleteInstance {
        output: serde_json::Value,
        at: DateTime<Utc>,
    },
    /// Fail the instance and cancel its open steps.
    FailInstance {
        error: WorkflowError,
        at: DateTime<Utc>,
    },
    /// Cancel the instance and its open steps.
    CancelInstance { at: DateTime<Utc> },
    /// Append an event with the next sequence of the instance.
    AppendEvent(EventDraft),
}
