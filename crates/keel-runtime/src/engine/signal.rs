use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use keel_core::error::{KeelError, Result};
use keel_core::store::WorkflowRepository;

use super::progress;

/// Delivers external signals to the steps waiting for them.
///
/// A signal only matches a step that is already pending; signals that arrive
/// before the chain reaches their step are rejected, not buffered.
#[derive(Clone)]
pub struct SignalRouter {
    store: Arc<dyn WorkflowRepository>,
    commit_retries: u32,
}

impl SignalRouter {
    pub fn new(store: Arc<dyn WorkflowRepository>, commit_retries: u32) -> Self {
        Self {
            store,
            commit_retries: commit_retries.max(1),
        }
    }

    /// Make the pending signal step named `signal` ready with `payload` as input.
    pub async fn deliver(
        &self,
        instance_id: Uuid,
        signal: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        for attempt in 1..=self.commit_retries {
            let snapshot = self.store.load_snapshot(instance_id).await?;
            let transition = match progress::plan_signal(&snapshot, signal, payload.clone(), Utc::now()) {
                Ok(transition) => transition,
                Err(e) => {
                    tracing::debug!(%instance_id, signal, "No step waiting for signal");
                    return Err(e);
                }
            };

            match self.store.transition(transition).await {
                Ok(_) => {
                    tracing::info!(%instance_id, signal, "Signal delivered");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(%instance_id, signal, attempt, "Signal delivery conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(KeelError::Conflict(format!(
            "signal '{}' for {} not delivered after {} attempts",
            signal, instance_id, self.commit_retries
        )))
    }
}
