//! Boundary API for submitting, inspecting, signalling and cancelling
//! workflow instances.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use uuid::Uuid;

use keel_core::error::{KeelError, Result};
use keel_core::store::WorkflowRepository;
use keel_core::workflow::{
    Event, EventCategory, EventDraft, EventStatus, StepKind, StepRecord, StepStatus,
    WorkflowError, WorkflowInstance, WorkflowStatus,
};

use crate::engine::progress;
use crate::engine::SignalRouter;
use crate::registry::Registry;

/// Current state of an instance as seen by callers.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub instance_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    /// Present when completed.
    pub output: Option<serde_json::Value>,
    /// Present when failed.
    pub error: Option<WorkflowError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepSummary>,
}

/// One materialized step in a [`StatusView`].
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub seq: i32,
    pub kind: StepKind,
    pub name: String,
    pub status: StepStatus,
    pub attempts: i32,
    pub error: Option<WorkflowError>,
    pub next_eligible_at: DateTime<Utc>,
}

impl From<&StepRecord> for StepSummary {
    fn from(step: &StepRecord) -> Self {
        Self {
            seq: step.seq,
            kind: step.kind,
            name: step.name.clone(),
            status: step.status,
            attempts: step.attempts,
            error: step.error.clone(),
            next_eligible_at: step.next_eligible_at,
        }
    }
}

/// Client for workflow instances.
#[derive(Clone)]
pub struct WorkflowClient {
    store: Arc<dyn WorkflowRepository>,
    registry: Arc<Registry>,
    signals: SignalRouter,
    commit_retries: u32,
}

impl WorkflowClient {
    pub fn new(
        store: Arc<dyn WorkflowRepository>,
        registry: Arc<Registry>,
        commit_retries: u32,
    ) -> Self {
        Self {
            signals: SignalRouter::new(store.clone(), commit_retries),
            store,
            registry,
            commit_retries: commit_retries.max(1),
        }
    }

    /// Start a new instance of a registered workflow type.
    pub async fn submit(&self, workflow_type: &str, input: serde_json::Value) -> Result<Uuid> {
        let definition = self
            .registry
            .workflow(workflow_type)
            .ok_or_else(|| KeelError::UnknownWorkflowType(workflow_type.to_string()))?;

        let instance = WorkflowInstance::new(workflow_type, input);
        let steps = progress::initial_steps(definition, &instance);
        let started = EventDraft::workflow(
            workflow_type,
            EventStatus::Started,
            instance.created_at,
            None,
        );
        self.store.create(&instance, &steps, started).await?;

        tracing::info!(instance_id = %instance.id, workflow_type, "Workflow submitted");
        Ok(instance.id)
    }

    pub async fn get_status(&self, instance_id: Uuid) -> Result<StatusView> {
        let snapshot = self.store.load_snapshot(instance_id).await?;
        let instance = snapshot.instance;
        Ok(StatusView {
            instance_id: instance.id,
            workflow_type: instance.workflow_type,
            status: instance.status,
            output: instance.output,
            error: instance.error,
            created_at: instance.created_at,
            completed_at: instance.completed_at,
            steps: snapshot.steps.iter().map(StepSummary::from).collect(),
        })
    }

    /// Full event history in order.
    pub async fn get_events(&self, instance_id: Uuid) -> Result<Vec<Event>> {
        self.store.load_instance(instance_id).await?;
        self.store.events_for(instance_id).await
    }

    /// Lazily stream the event history.
    pub fn stream_events(&self, instance_id: Uuid) -> BoxStream<'_, Result<Event>> {
        self.store.stream_for(instance_id)
    }

    /// Step events only, without the workflow start and end markers.
    pub async fn timeline(&self, instance_id: Uuid) -> Result<Vec<Event>> {
        let mut events = self.get_events(instance_id).await?;
        events.retain(|e| e.category != EventCategory::Workflow);
        Ok(events)
    }

    /// Deliver a signal. Fails with `NoMatchingWaiter` when no step waits for it.
    pub async fn signal(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.signals.deliver(instance_id, name, payload).await
    }

    /// Cancel an instance. A running step finishes but nothing after it starts.
    /// Already terminal instances are left as they are.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<()> {
        for attempt in 1..=self.commit_retries {
            let snapshot = self.store.load_snapshot(instance_id).await?;
            let Some(transition) = progress::plan_cancel(&snapshot, Utc::now()) else {
                tracing::debug!(%instance_id, status = %snapshot.instance.status, "Cancel ignored, already terminal");
                return Ok(());
            };
            match self.store.transition(transition).await {
                Ok(_) => {
                    tracing::info!(%instance_id, "Workflow cancelled");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(%instance_id, attempt, "Cancel conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(KeelError::Conflict(format!(
            "cancel of {} not applied after {} attempts",
            instance_id, self.commit_retries
        )))
    }
}
