//! In-memory store for tests and single-process embedding.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use uuid::Uuid;

use keel_core::error::{KeelError, Result};
use keel_core::store::{ClaimedStep, Effect, EventStore, StepChange, Transition, WorkflowRepository};
use keel_core::workflow::{
    sort_events, Event, EventDraft, InstanceSnapshot, StepId, StepRecord, StepStatus,
    WorkflowInstance, WorkflowStatus,
};

#[derive(Debug, Default)]
struct MemoryState {
    instances: HashMap<Uuid, WorkflowInstance>,
    steps: HashMap<Uuid, BTreeMap<i32, StepRecord>>,
    events: HashMap<Uuid, Vec<Event>>,
}

/// Store that keeps all state in process memory.
///
/// Every operation runs under one lock, which gives the same atomicity as a
/// database transaction.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| KeelError::Internal("memory store lock poisoned".into()))
    }

    /// Number of stored instances.
    pub fn instance_count(&self) -> Result<usize> {
        Ok(self.lock()?.instances.len())
    }
}

pub(crate) fn lease_duration(lease: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(lease)
        .map_err(|e| KeelError::Validation(format!("invalid lease {:?}: {}", lease, e)))
}

fn next_sequence(events: &[Event]) -> i64 {
    events.iter().map(|e| e.sequence).max().unwrap_or(0) + 1
}

/// Cancel steps that have not started, and running steps whose claim expired.
/// A step under a live claim finishes and records its own result.
fn cancel_open_steps(
    steps: &mut BTreeMap<i32, StepRecord>,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    let abandoned = |s: &StepRecord| s.status == StepStatus::Running && !s.has_live_claim(now);
    for step in steps
        .values_mut()
        .filter(|s| s.status.is_open() || abandoned(s))
    {
        step.status = StepStatus::Cancelled;
        step.completed_at = Some(at);
        step.claimed_by = None;
        step.claim_token = None;
        step.claim_expires_at = None;
    }
}

fn apply_step_change(
    steps: &mut BTreeMap<i32, StepRecord>,
    instance_id: Uuid,
    change: StepChange,
) -> Result<()> {
    let step = steps.get_mut(&change.seq).ok_or_else(|| {
        KeelError::NotFound(format!("step {}", StepId::new(instance_id, change.seq)))
    })?;
    let update = change.update;
    step.status = update.status;
    step.attempts = update.attempts;
    if let Some(input) = update.input {
        step.input = Some(input);
    }
    step.output = update.output;
    step.error = update.error;
    if let Some(at) = update.next_eligible_at {
        step.next_eligible_at = at;
    }
    step.completed_at = update.completed_at;
    step.claimed_by = None;
    step.claim_token = None;
    step.claim_expires_at = None;
    Ok(())
}

/// Pick the step to claim for one instance, if any.
fn claimable_seq(steps: &BTreeMap<i32, StepRecord>, now: DateTime<Utc>) -> Option<i32> {
    if steps.values().any(|s| s.has_live_claim(now)) {
        return None;
    }
    steps
        .values()
        .filter(|s| s.is_claimable(now))
        .min_by_key(|s| (s.next_eligible_at, s.seq))
        .map(|s| s.seq)
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, event: &Event) -> Result<()> {
        let mut state = self.lock()?;
        if !state.instances.contains_key(&event.instance_id) {
            return Err(KeelError::NotFound(format!(
                "workflow instance {}",
                event.instance_id
            )));
        }
        let events = state.events.entry(event.instance_id).or_default();
        if events.iter().any(|e| e.sequence == event.sequence) {
            return Err(KeelError::Conflict(format!(
                "event {} of {} already exists",
                event.sequence, event.instance_id
            )));
        }
        events.push(event.clone());
        Ok(())
    }

    fn stream_for(&self, instance_id: Uuid) -> BoxStream<'_, Result<Event>> {
        let events = self.lock().map(|state| {
            let mut events = state.events.get(&instance_id).cloned().unwrap_or_default();
            sort_events(&mut events);
            events
        });
        match events {
            Ok(events) => stream::iter(events.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

#[async_trait]
impl WorkflowRepository for MemoryStore {
    async fn create(
        &self,
        instance: &WorkflowInstance,
        steps: &[StepRecord],
        started: EventDraft,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if state.instances.contains_key(&instance.id) {
            return Err(KeelError::Duplicate(format!(
                "workflow instance {}",
                instance.id
            )));
        }
        state.instances.insert(instance.id, instance.clone());
        state.steps.insert(
            instance.id,
            steps.iter().map(|s| (s.seq, s.clone())).collect(),
        );
        state
            .events
            .insert(instance.id, vec![started.into_event(instance.id, 1)]);
        Ok(())
    }

    async fn transition(&self, transition: Transition) -> Result<i64> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let id = transition.instance_id;

        let mut instance = state
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| KeelError::NotFound(format!("workflow instance {}", id)))?;
        let mut steps = state.steps.get(&id).cloned().unwrap_or_default();
        let mut events = state.events.get(&id).cloned().unwrap_or_default();

        if let Some(StepChange {
            seq,
            claim_token: Some(token),
            ..
        }) = &transition.step
        {
            let held = steps.get(seq).is_some_and(|step| {
                step.claim_token == Some(*token) && step.has_live_claim(now)
            });
            if !held {
                return Err(KeelError::LeaseLost {
                    step: StepId::new(id, *seq),
                });
            }
        }

        if instance.version != transition.expected_version {
            return Err(KeelError::VersionConflict {
                expected: transition.expected_version,
                actual: instance.version,
            });
        }

        if let Some(change) = transition.step {
            apply_step_change(&mut steps, id, change)?;
        }

        for effect in transition.effects {
            match effect {
                Effect::InsertStep(step) => {
                    if steps.contains_key(&step.seq) {
                        return Err(KeelError::Conflict(format!(
                            "step {} already exists",
                            step.id()
                        )));
                    }
                    steps.insert(step.seq, step);
                }
                Effect::MarkReady { seq, input, at } => {
                    let step = steps.get_mut(&seq).ok_or_else(|| {
                        KeelError::NotFound(format!("step {}", StepId::new(id, seq)))
                    })?;
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Ready;
                        step.next_eligible_at = at;
                        if let Some(input) = input {
                            step.input = Some(input);
                        }
                    }
                }
                Effect::CompleteInstance { output, at } => instance.complete(output, at),
                Effect::FailInstance { error, at } => {
                    instance.fail(error, at);
                    cancel_open_steps(&mut steps, at, now);
                }
                Effect::CancelInstance { at } => {
                    instance.cancel(at);
                    cancel_open_steps(&mut steps, at, now);
                }
                Effect::AppendEvent(draft) => {
                    let sequence = next_sequence(&events);
                    events.push(draft.into_event(id, sequence));
                }
            }
        }

        instance.version += 1;
        let version = instance.version;
        state.instances.insert(id, instance);
        state.steps.insert(id, steps);
        state.events.insert(id, events);
        Ok(version)
    }

    async fn load_instance(&self, id: Uuid) -> Result<WorkflowInstance> {
        self.lock()?
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| KeelError::NotFound(format!("workflow instance {}", id)))
    }

    async fn load_snapshot(&self, id: Uuid) -> Result<InstanceSnapshot> {
        let state = self.lock()?;
        let instance = state
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| KeelError::NotFound(format!("workflow instance {}", id)))?;
        let steps = state
            .steps
            .get(&id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default();
        Ok(InstanceSnapshot { instance, steps })
    }

    async fn claim_batch(
        &self,
        worker_id: &str,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ClaimedStep>> {
        let lease = lease_duration(lease)?;
        let now = Utc::now();
        let mut guard = self.lock()?;
        let state = &mut *guard;

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = state
            .instances
            .values()
            .filter(|i| i.status == WorkflowStatus::Running)
            .map(|i| (i.created_at, i.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, id) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let (Some(instance), Some(steps)) =
                (state.instances.get_mut(&id), state.steps.get_mut(&id))
            else {
                continue;
            };
            let Some(seq) = claimable_seq(steps, now) else {
                continue;
            };
            let Some(step) = steps.get_mut(&seq) else {
                continue;
            };

            step.status = StepStatus::Running;
            step.claimed_by = Some(worker_id.to_string());
            step.claim_token = Some(Uuid::new_v4());
            step.claim_expires_at = Some(now + lease);
            instance.version += 1;

            claimed.push(ClaimedStep {
                instance: instance.clone(),
                step: step.clone(),
            });
        }

        Ok(claimed)
    }

    async fn heartbeat(
        &self,
        step: StepId,
        token: Uuid,
        lease: Duration,
    ) -> Result<DateTime<Utc>> {
        let lease = lease_duration(lease)?;
        let now = Utc::now();
        let mut state = self.lock()?;
        let record = state
            .steps
            .get_mut(&step.instance_id)
            .and_then(|steps| steps.get_mut(&step.seq))
            .filter(|s| s.claim_token == Some(token) && s.has_live_claim(now))
            .ok_or(KeelError::LeaseLost { step })?;
        let expires = now + lease;
        record.claim_expires_at = Some(expires);
        Ok(expires)
    }
}
