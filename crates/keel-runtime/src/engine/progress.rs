//! Pure planning of workflow progress.
//!
//! Given a snapshot and the result of a step, these functions compute the
//! [`Transition`] that records the result and moves the chain forward. They
//! never touch the store, so every commit attempt re-plans against fresh state.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use keel_core::error::{KeelError, Result};
use keel_core::retry::{RetryDecision, RetryPolicy};
use keel_core::store::{Effect, StepChange, StepUpdate, Transition};
use keel_core::workflow::{
    ActivityError, EventDraft, EventStatus, InstanceSnapshot, StepDef, StepId, StepKind,
    StepRecord, StepStatus, WorkflowDefinition, WorkflowError, WorkflowInstance, WorkflowStatus,
};

/// How a claimed step finished executing.
#[derive(Debug, Clone)]
pub enum Completion {
    /// An activity returned.
    Activity(std::result::Result<Value, ActivityError>),
    /// A failure that is never retried.
    Terminal(WorkflowError),
    /// Sleep, signal and await steps are resolved against the snapshot.
    Evaluate,
}

/// What committing a step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded,
    RetryScheduled { delay: Duration },
    Failed(WorkflowError),
    /// The step is not due yet and went back to waiting.
    Waiting,
    /// The claim was no longer held; nothing was written.
    LeaseLost,
}

/// A transition and the outcome it records.
#[derive(Debug, Clone)]
pub struct Plan {
    pub transition: Transition,
    pub outcome: StepOutcome,
}

pub(crate) fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

/// Materialize the step at `seq` and, behind a detached activity, the steps
/// that start alongside it.
pub fn activate(
    definition: &WorkflowDefinition,
    instance_id: Uuid,
    seq: i32,
    input: Value,
    now: DateTime<Utc>,
    succeeded: &dyn Fn(i32) -> bool,
) -> Vec<StepRecord> {
    let mut steps = Vec::new();
    let mut seq = seq;
    while let Some(def) = definition.step(seq) {
        let step = match def {
            StepDef::Activity { name, detached } => {
                StepRecord::activity(instance_id, seq, name.clone(), *detached, now)
            }
            StepDef::Sleep { duration } => {
                StepRecord::sleep(instance_id, seq, now + chrono_delay(*duration), now)
            }
            StepDef::Signal { name } => StepRecord::signal(instance_id, seq, name.clone(), now),
            StepDef::Await { step } => {
                let awaits = i32::try_from(*step).unwrap_or(i32::MAX);
                StepRecord::await_step(instance_id, seq, awaits, succeeded(awaits), now)
            }
        };
        let detached = step.detached;
        steps.push(step.with_input(input.clone()));
        if !detached {
            break;
        }
        seq += 1;
    }
    steps
}

/// Steps created together with a new instance.
pub fn initial_steps(definition: &WorkflowDefinition, instance: &WorkflowInstance) -> Vec<StepRecord> {
    activate(
        definition,
        instance.id,
        0,
        instance.input.clone(),
        instance.created_at,
        &|_| false,
    )
}

fn step_event(step: &StepRecord, status: EventStatus, now: DateTime<Utc>, summary: Value) -> Effect {
    Effect::AppendEvent(EventDraft::step(step, status, now, Some(summary)))
}

fn succeeded_update(step: &StepRecord, output: Value, now: DateTime<Utc>) -> StepUpdate {
    StepUpdate {
        status: StepStatus::Succeeded,
        attempts: step.attempts + 1,
        input: None,
        output: Some(output),
        error: None,
        next_eligible_at: None,
        completed_at: Some(now),
    }
}

fn failed_update(step: &StepRecord, error: &WorkflowError, now: DateTime<Utc>) -> StepUpdate {
    StepUpdate {
        status: StepStatus::Failed,
        attempts: step.attempts + 1,
        input: None,
        output: None,
        error: Some(error.clone()),
        next_eligible_at: None,
        completed_at: Some(now),
    }
}

fn success_summary(step: &StepRecord, attempts: i32) -> Value {
    match step.kind {
        StepKind::Activity => json!({ "attempt": attempts }),
        StepKind::Sleep => json!({ "wake_at": step.wake_at }),
        StepKind::Signal => json!({ "signal": step.name }),
        StepKind::Await => json!({ "awaits": step.awaits }),
    }
}

/// Plan the commit of a claimed step.
pub fn plan_step(
    definition: Option<&WorkflowDefinition>,
    policy: &RetryPolicy,
    snapshot: &InstanceSnapshot,
    seq: i32,
    claim_token: Option<Uuid>,
    completion: Completion,
    now: DateTime<Utc>,
) -> Result<Plan> {
    let instance = &snapshot.instance;
    let step = snapshot.step(seq).ok_or_else(|| {
        KeelError::NotFound(format!("step {}", StepId::new(instance.id, seq)))
    })?;

    let Some(definition) = definition else {
        let error = WorkflowError::new(
            keel_core::workflow::UNKNOWN_WORKFLOW_CLASS,
            format!("workflow type '{}' is not registered", instance.workflow_type),
        );
        return Ok(plan_terminal_failure(snapshot, step, claim_token, error, now));
    };

    match completion {
        Completion::Activity(Ok(output)) => Ok(plan_success(
            definition,
            snapshot,
            step,
            claim_token,
            output,
            now,
        )),
        Completion::Activity(Err(error)) => Ok(plan_failure(
            policy,
            snapshot,
            step,
            claim_token,
            error,
            now,
        )),
        Completion::Terminal(error) => Ok(plan_terminal_failure(
            snapshot,
            step,
            claim_token,
            error,
            now,
        )),
        Completion::Evaluate => {
            let input = step.input.clone().unwrap_or(Value::Null);
            match step.kind {
                StepKind::Sleep => match step.wake_at {
                    Some(wake_at) if wake_at > now => Ok(plan_release(
                        snapshot,
                        step,
                        claim_token,
                        StepStatus::Ready,
                        Some(wake_at),
                        now,
                    )),
                    _ => Ok(plan_success(definition, snapshot, step, claim_token, input, now)),
                },
                StepKind::Signal => Ok(plan_success(
                    definition,
                    snapshot,
                    step,
                    claim_token,
                    input,
                    now,
                )),
                StepKind::Await => {
                    let awaited = step
                        .awaits
                        .and_then(|awaits| snapshot.step(awaits))
                        .filter(|awaited| awaited.status == StepStatus::Succeeded);
                    match awaited {
                        Some(awaited) => {
                            let output = awaited.output.clone().unwrap_or(Value::Null);
                            Ok(plan_success(definition, snapshot, step, claim_token, output, now))
                        }
                        None => Ok(plan_release(
                            snapshot,
                            step,
                            claim_token,
                            StepStatus::Pending,
                            None,
                            now,
                        )),
                    }
                }
                StepKind::Activity => Err(KeelError::InvalidState(format!(
                    "activity step {} has no result",
                    step.id()
                ))),
            }
        }
    }
}

/// Record a step result and move the chain forward.
fn plan_success(
    definition: &WorkflowDefinition,
    snapshot: &InstanceSnapshot,
    step: &StepRecord,
    claim_token: Option<Uuid>,
    output: Value,
    now: DateTime<Utc>,
) -> Plan {
    let instance = &snapshot.instance;
    let update = succeeded_update(step, output.clone(), now);
    let summary = success_summary(step, update.attempts);
    let mut transition = Transition::new(instance.id, instance.version)
        .with_step(StepChange {
            seq: step.seq,
            claim_token,
            update,
        })
        .with_effect(step_event(step, EventStatus::Succeeded, now, summary));

    if instance.status != WorkflowStatus::Running {
        return Plan {
            transition,
            outcome: StepOutcome::Succeeded,
        };
    }

    let succeeded: HashSet<i32> = snapshot
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Succeeded)
        .map(|s| s.seq)
        .chain(std::iter::once(step.seq))
        .collect();

    for waiter in snapshot.steps.iter().filter(|s| {
        s.kind == StepKind::Await && s.status == StepStatus::Pending && s.awaits == Some(step.seq)
    }) {
        transition = transition.with_effect(Effect::MarkReady {
            seq: waiter.seq,
            input: None,
            at: now,
        });
    }

    let next = step.seq + 1;
    let mut inserted = false;
    if !step.detached && definition.step(next).is_some() && snapshot.step(next).is_none() {
        let new_steps = activate(
            definition,
            instance.id,
            next,
            output.clone(),
            now,
            &|seq| succeeded.contains(&seq),
        );
        inserted = !new_steps.is_empty();
        transition = transition.with_effects(new_steps.into_iter().map(Effect::InsertStep));
    }

    if !inserted {
        let last = i32::try_from(definition.len()).unwrap_or(i32::MAX) - 1;
        let complete = (0..=last).all(|seq| succeeded.contains(&seq));
        if complete {
            let final_output = if last == step.seq {
                output
            } else {
                snapshot
                    .step(last)
                    .and_then(|s| s.output.clone())
                    .unwrap_or(Value::Null)
            };
            transition = transition
                .with_effect(Effect::CompleteInstance {
                    output: final_output,
                    at: now,
                })
                .with_effect(Effect::AppendEvent(EventDraft::workflow(
                    &instance.workflow_type,
                    EventStatus::Succeeded,
                    now,
                    None,
                )));
        }
    }

    Plan {
        transition,
        outcome: StepOutcome::Succeeded,
    }
}

/// Record a failed attempt, scheduling a retry when the policy allows it.
fn plan_failure(
    policy: &RetryPolicy,
    snapshot: &InstanceSnapshot,
    step: &StepRecord,
    claim_token: Option<Uuid>,
    error: ActivityError,
    now: DateTime<Utc>,
) -> Plan {
    let instance = &snapshot.instance;
    let attempts = step.attempts + 1;
    let decision = if instance.status == WorkflowStatus::Running {
        policy.evaluate(u32::try_from(attempts).unwrap_or(u32::MAX), &error.class)
    } else {
        RetryDecision::Exhausted
    };

    match decision {
        RetryDecision::Retry { delay } => {
            let workflow_error = WorkflowError::from(error);
            let summary = json!({
                "attempt": attempts,
                "error": workflow_error.to_string(),
                "retry_in_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
            let update = StepUpdate {
                status: StepStatus::Ready,
                attempts,
                input: None,
                output: None,
                error: Some(workflow_error),
                next_eligible_at: Some(now + chrono_delay(delay)),
                completed_at: None,
            };
            Plan {
                transition: Transition::new(instance.id, instance.version)
                    .with_step(StepChange {
                        seq: step.seq,
                        claim_token,
                        update,
                    })
                    .with_effect(step_event(step, EventStatus::Retrying, now, summary)),
                outcome: StepOutcome::RetryScheduled { delay },
            }
        }
        RetryDecision::NonRetryable | RetryDecision::Exhausted => {
            plan_terminal_failure(snapshot, step, claim_token, error.into(), now)
        }
    }
}

/// Fail the step and, if it is still running, the instance.
fn plan_terminal_failure(
    snapshot: &InstanceSnapshot,
    step: &StepRecord,
    claim_token: Option<Uuid>,
    error: WorkflowError,
    now: DateTime<Utc>,
) -> Plan {
    let instance = &snapshot.instance;
    let update = failed_update(step, &error, now);
    let summary = json!({ "attempt": update.attempts, "error": error.to_string() });
    let mut transition = Transition::new(instance.id, instance.version)
        .with_step(StepChange {
            seq: step.seq,
            claim_token,
            update,
        })
        .with_effect(step_event(step, EventStatus::Failed, now, summary));

    if instance.status == WorkflowStatus::Running {
        transition = transition
            .with_effect(Effect::FailInstance {
                error: error.clone(),
                at: now,
            })
            .with_effect(Effect::AppendEvent(EventDraft::workflow(
                &instance.workflow_type,
                EventStatus::Failed,
                now,
                Some(json!({ "class": error.class, "message": error.message })),
            )));
    }

    Plan {
        transition,
        outcome: StepOutcome::Failed(error),
    }
}

/// Hand a claimed step back without executing it.
fn plan_release(
    snapshot: &InstanceSnapshot,
    step: &StepRecord,
    claim_token: Option<Uuid>,
    status: StepStatus,
    next_eligible_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Plan {
    let instance = &snapshot.instance;
    let mut update = StepUpdate::from_step(step, status);
    update.next_eligible_at = next_eligible_at;
    if instance.status != WorkflowStatus::Running {
        update.status = StepStatus::Cancelled;
        update.completed_at = Some(now);
    }
    Plan {
        transition: Transition::new(instance.id, instance.version).with_step(StepChange {
            seq: step.seq,
            claim_token,
            update,
        }),
        outcome: StepOutcome::Waiting,
    }
}

/// Plan delivery of a signal to the pending signal step of that name.
pub fn plan_signal(
    snapshot: &InstanceSnapshot,
    signal: &str,
    payload: Value,
    now: DateTime<Utc>,
) -> Result<Transition> {
    let instance = &snapshot.instance;
    let waiter = snapshot
        .steps
        .iter()
        .filter(|_| instance.status == WorkflowStatus::Running)
        .find(|s| s.kind == StepKind::Signal && s.status == StepStatus::Pending && s.name == signal)
        .ok_or_else(|| KeelError::NoMatchingWaiter {
            instance_id: instance.id,
            signal: signal.to_string(),
        })?;

    let mut update = StepUpdate::from_step(waiter, StepStatus::Ready);
    update.input = Some(payload);
    update.next_eligible_at = Some(now);
    Ok(
        Transition::new(instance.id, instance.version).with_step(StepChange {
            seq: waiter.seq,
            claim_token: None,
            update,
        }),
    )
}

/// Plan cancellation. `None` when the instance is already terminal.
pub fn plan_cancel(snapshot: &InstanceSnapshot, now: DateTime<Utc>) -> Option<Transition> {
    let instance = &snapshot.instance;
    if instance.status.is_terminal() {
        return None;
    }
    Some(
        Transition::new(instance.id, instance.version)
            .with_effect(Effect::CancelInstance { at: now })
            .with_effect(Effect::AppendEvent(EventDraft::workflow(
                &instance.workflow_type,
                EventStatus::Cancelled,
                now,
                None,
            ))),
    )
}
