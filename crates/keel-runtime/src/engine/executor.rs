use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::time::timeout;

use keel_core::config::{RetryConfig, WorkerConfig};
use keel_core::error::{KeelError, Result};
use keel_core::retry::RetryPolicy;
use keel_core::store::{ClaimedStep, WorkflowRepository};
use keel_core::workflow::{
    ActivityError, StepKind, WorkflowDefinition, WorkflowError, UNKNOWN_ACTIVITY_CLASS,
    UNKNOWN_WORKFLOW_CLASS,
};

use super::progress::{self, Completion, StepOutcome};
use crate::registry::Registry;

/// Settings the executor applies to every claimed step.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub lease: Duration,
    /// How often a running step renews its lease.
    pub heartbeat_interval: Duration,
    pub activity_timeout: Duration,
    pub commit_retries: u32,
    /// Default activity retry policy.
    pub retry: RetryPolicy,
}

impl ExecutorConfig {
    pub fn new(worker_id: impl Into<String>, worker: &WorkerConfig, retry: &RetryConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            lease: worker.lease(),
            heartbeat_interval: worker.heartbeat_interval(),
            activity_timeout: worker.activity_timeout(),
            commit_retries: worker.commit_retries.max(1),
            retry: retry.activity.clone(),
        }
    }
}

/// Runs claimed steps and commits their results.
pub struct StepExecutor {
    store: Arc<dyn WorkflowRepository>,
    registry: Arc<Registry>,
    config: ExecutorConfig,
}

impl StepExecutor {
    pub fn new(
        store: Arc<dyn WorkflowRepository>,
        registry: Arc<Registry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a claimed step and commit the outcome.
    pub async fn execute(&self, claim: &ClaimedStep) -> Result<StepOutcome> {
        let definition = self
            .registry
            .workflow(&claim.instance.workflow_type)
            .cloned();

        let policy = self
            .registry
            .activity(&claim.step.name)
            .filter(|_| claim.step.kind == StepKind::Activity)
            .map(|entry| entry.retry_policy(&self.config.retry).clone())
            .unwrap_or_else(|| self.config.retry.clone());

        let Some(completion) = self.run(claim, definition.as_deref()).await else {
            return Ok(StepOutcome::LeaseLost);
        };

        self.commit(claim, definition.as_deref(), &policy, completion)
            .await
    }

    /// Run the step body. `None` if the claim was lost while running.
    async fn run(
        &self,
        claim: &ClaimedStep,
        definition: Option<&WorkflowDefinition>,
    ) -> Option<Completion> {
        if definition.is_none() {
            return Some(Completion::Terminal(WorkflowError::new(
                UNKNOWN_WORKFLOW_CLASS,
                format!(
                    "workflow type '{}' is not registered",
                    claim.instance.workflow_type
                ),
            )));
        }
        if claim.step.kind != StepKind::Activity {
            return Some(Completion::Evaluate);
        }

        let Some(entry) = self.registry.activity(&claim.step.name) else {
            return Some(Completion::Terminal(WorkflowError::new(
                UNKNOWN_ACTIVITY_CLASS,
                format!("activity '{}' is not registered", claim.step.name),
            )));
        };

        let limit = entry.timeout(self.config.activity_timeout);
        let input = claim.step.input.clone().unwrap_or(serde_json::Value::Null);

        tracing::debug!(
            instance_id = %claim.instance.id,
            step = claim.step.seq,
            activity = %claim.step.name,
            attempt = claim.step.attempts + 1,
            "Running activity"
        );

        let execution = AssertUnwindSafe(entry.activity.execute(input)).catch_unwind();
        tokio::select! {
            result = timeout(limit, execution) => {
                let result = match result {
                    Ok(Ok(result)) => result,
                    Ok(Err(payload)) => {
                        let error = ActivityError::panic(payload.as_ref());
                        tracing::error!(
                            instance_id = %claim.instance.id,
                            step = claim.step.seq,
                            activity = %claim.step.name,
                            error = %error,
                            "Activity panicked"
                        );
                        Err(error)
                    }
                    Err(_) => Err(ActivityError::timeout(limit)),
                };
                Some(Completion::Activity(result))
            }
            () = self.keep_alive(claim) => None,
        }
    }

    /// Extend the claim until it is lost. Never returns while it is held.
    async fn keep_alive(&self, claim: &ClaimedStep) {
        let Some(token) = claim.token() else {
            return std::future::pending().await;
        };
        let interval = self.config.heartbeat_interval;
        loop {
            tokio::time::sleep(interval).await;
            match self
                .store
                .heartbeat(claim.step.id(), token, self.config.lease)
                .await
            {
                Ok(expires) => {
                    tracing::trace!(step = %claim.step.id(), %expires, "Heartbeat");
                }
                Err(KeelError::LeaseLost { .. }) => {
                    tracing::warn!(
                        step = %claim.step.id(),
                        worker_id = %self.config.worker_id,
                        "Lease lost while running, abandoning step"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(step = %claim.step.id(), error = %e, "Heartbeat failed");
                }
            }
        }
    }

    /// Commit a completion, re-planning on version conflicts.
    async fn commit(
        &self,
        claim: &ClaimedStep,
        definition: Option<&WorkflowDefinition>,
        policy: &RetryPolicy,
        completion: Completion,
    ) -> Result<StepOutcome> {
        let instance_id = claim.instance.id;
        let seq = claim.step.seq;
        let token = claim.token();

        for attempt in 1..=self.config.commit_retries {
            let now = Utc::now();
            let snapshot = self.store.load_snapshot(instance_id).await?;

            let held = snapshot
                .step(seq)
                .is_some_and(|step| step.claim_token == token && step.has_live_claim(now));
            if !held {
                tracing::warn!(
                    step = %claim.step.id(),
                    worker_id = %self.config.worker_id,
                    "Lease lost before commit, discarding result"
                );
                return Ok(StepOutcome::LeaseLost);
            }

            let plan = progress::plan_step(
                definition,
                policy,
                &snapshot,
                seq,
                token,
                completion.clone(),
                now,
            )?;

            match self.store.transition(plan.transition).await {
                Ok(version) => {
                    tracing::debug!(step = %claim.step.id(), version, "Step committed");
                    return Ok(plan.outcome);
                }
                Err(KeelError::LeaseLost { step }) => {
                    tracing::warn!(
                        %step,
                        worker_id = %self.config.worker_id,
                        "Lease lost at commit, discarding result"
                    );
                    return Ok(StepOutcome::LeaseLost);
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(step = %claim.step.id(), attempt, error = %e, "Commit conflicted, re-planning");
                }
                Err(e) => return Err(e),
            }
        }

        Err(KeelError::Conflict(format!(
            "step {} not committed after {} attempts",
            claim.step.id(),
            self.config.commit_retries
        )))
    }
}
