use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use keel_core::config::{RetryConfig, WorkerConfig};
use keel_core::error::{KeelError, Result};
use keel_core::store::{ClaimedStep, WorkflowRepository};

use super::executor::{ExecutorConfig, StepExecutor};
use super::progress::StepOutcome;
use crate::registry::Registry;

/// Polls the store for due steps and executes them.
pub struct Worker {
    id: String,
    config: WorkerConfig,
    store: Arc<dyn WorkflowRepository>,
    executor: Arc<StepExecutor>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Create a new worker.
    pub fn new(
        config: WorkerConfig,
        retry: &RetryConfig,
        store: Arc<dyn WorkflowRepository>,
        registry: Arc<Registry>,
    ) -> Self {
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            registry,
            ExecutorConfig::new(id.clone(), &config, retry),
        ));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        Self {
            id,
            config,
            store,
            executor,
            semaphore,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get worker ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that stops the worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn claim(&self) -> Result<Vec<ClaimedStep>> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            return Ok(Vec::new());
        }
        let limit = available.min(self.config.batch_size);
        self.store
            .claim_batch(&self.id, limit, self.config.lease())
            .await
    }

    async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| KeelError::Internal("worker semaphore closed".into()))
    }

    /// Claim one batch and wait for all of it to finish.
    pub async fn poll_once(&self) -> Result<Vec<StepOutcome>> {
        let claims = self.claim().await?;
        let mut tasks = JoinSet::new();
        for claim in claims {
            let permit = self.permit().await?;
            tasks.spawn(run_claim(self.executor.clone(), claim, permit));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| KeelError::Internal(format!("step task failed: {}", e)))?;
            if let Some(outcome) = outcome {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    /// Run the worker until shutdown, then drain in-flight steps.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            worker_id = %self.id,
            max_concurrent = self.config.max_concurrent,
            batch_size = self.config.batch_size,
            "Worker started"
        );

        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(worker_id = %self.id, "Worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {
                    while let Some(joined) = in_flight.try_join_next() {
                        self.log_join_error(joined);
                    }

                    let claims = match self.claim().await {
                        Ok(claims) => claims,
                        Err(e) => {
                            tracing::error!(worker_id = %self.id, error = %e, "Failed to claim steps");
                            continue;
                        }
                    };
                    if claims.is_empty() {
                        continue;
                    }
                    tracing::debug!(worker_id = %self.id, count = claims.len(), "Claimed steps");

                    for claim in claims {
                        let permit = self.permit().await?;
                        in_flight.spawn(run_claim(self.executor.clone(), claim, permit));
                    }
                }
            }
        }

        let drain = async {
            while let Some(joined) = in_flight.join_next().await {
                self.log_join_error(joined);
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            tracing::warn!(
                worker_id = %self.id,
                remaining = in_flight.len(),
                "Shutdown timeout reached, abandoning in-flight steps"
            );
            in_flight.abort_all();
        }

        tracing::info!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    fn log_join_error<T>(&self, joined: std::result::Result<T, tokio::task::JoinError>) {
        if let Err(e) = joined {
            tracing::error!(worker_id = %self.id, error = %e, "Step task failed");
        }
    }
}

async fn run_claim(
    executor: Arc<StepExecutor>,
    claim: ClaimedStep,
    permit: OwnedSemaphorePermit,
) -> Option<StepOutcome> {
    let instance_id = claim.instance.id;
    let step = claim.step.seq;
    let name = claim.step.name.clone();

    let outcome = match executor.execute(&claim).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(%instance_id, step, name = %name, error = %e, "Failed to execute step");
            drop(permit);
            return None;
        }
    };

    match &outcome {
        StepOutcome::Succeeded => {
            tracing::info!(%instance_id, step, name = %name, "Step succeeded");
        }
        StepOutcome::RetryScheduled { delay } => {
            tracing::warn!(%instance_id, step, name = %name, retry_in = ?delay, "Step failed, will retry");
        }
        StepOutcome::Failed(error) => {
            tracing::error!(%instance_id, step, name = %name, error = %error, "Step failed permanently");
        }
        StepOutcome::Waiting => {
            tracing::debug!(%instance_id, step, name = %name, "Step not ready, released");
        }
        StepOutcome::LeaseLost => {
            tracing::warn!(%instance_id, step, name = %name, "Step result discarded after lease loss");
        }
    }

    drop(permit);
    Some(outcome)
}
