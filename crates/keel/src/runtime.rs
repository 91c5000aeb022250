//! KEEL - durable workflow execution
//!
//! Single process runtime that wires together:
//! - PostgreSQL or in-memory workflow store
//! - Activity and workflow registry
//! - Step worker with leased claims
//! - Client for submitting, signalling and cancelling instances

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use keel_core::config::KeelConfig;
use keel_core::error::{KeelError, Result};
use keel_core::store::WorkflowRepository;
use keel_core::workflow::{Activity, ActivityError, ActivityInfo, WorkflowDefinition};
use keel_runtime::{Database, PgStore, Registry, Worker, WorkflowClient};

/// Prelude module for common imports.
pub mod prelude {
    pub use chrono::{DateTime, Utc};
    pub use uuid::Uuid;

    /// Timestamp type alias for convenience.
    pub type Timestamp = DateTime<Utc>;

    pub use keel_core::config::KeelConfig;
    pub use keel_core::error::{KeelError, Result};
    pub use keel_core::retry::RetryPolicy;
    pub use keel_core::workflow::{
        Activity, ActivityError, ActivityFn, ActivityInfo, Event, EventCategory, EventStatus,
        StepStatus, WorkflowDefinition, WorkflowError, WorkflowStatus,
    };
    pub use keel_runtime::observability::init_tracing;
    pub use keel_runtime::{StatusView, WorkflowClient};

    pub use crate::{Keel, KeelBuilder};
}

/// The main KEEL runtime.
pub struct Keel {
    config: KeelConfig,
    db: Option<Database>,
    store: Arc<dyn WorkflowRepository>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

impl Keel {
    /// Create a new builder for configuring KEEL.
    pub fn builder() -> KeelBuilder {
        KeelBuilder::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &KeelConfig {
        &self.config
    }

    /// Get the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Get the workflow store.
    pub fn store(&self) -> Arc<dyn WorkflowRepository> {
        self.store.clone()
    }

    /// Client bound to this runtime's store and registry.
    pub fn client(&self) -> WorkflowClient {
        WorkflowClient::new(
            self.store.clone(),
            self.registry.clone(),
            self.config.worker.commit_retries,
        )
    }

    /// Token that stops [`Keel::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn worker(&self) -> Worker {
        Worker::new(
            self.config.worker.clone(),
            &self.config.retry,
            self.store.clone(),
            self.registry.clone(),
        )
    }

    /// Run the worker until ctrl-c or [`Keel::shutdown`].
    pub async fn run(self) -> Result<()> {
        tracing::info!("KEEL runtime starting");

        let worker = Arc::new(self.worker());
        let worker_id = worker.id().to_string();
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };

        tracing::info!(
            worker_id = %worker_id,
            workflows = ?self.registry.workflow_names(),
            "KEEL runtime started"
        );

        wait_for_shutdown(tokio::signal::ctrl_c(), &self.shutdown).await;

        worker.shutdown();
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(worker_id = %worker_id, error = %e, "Worker error"),
            Err(e) => tracing::error!(worker_id = %worker_id, error = %e, "Worker task panicked"),
        }

        if let Some(db) = &self.db {
            db.close().await;
        }

        tracing::info!("KEEL runtime stopped");
        Ok(())
    }
}

/// Builder for configuring the KEEL runtime.
pub struct KeelBuilder {
    config: Option<KeelConfig>,
    store: Option<Arc<dyn WorkflowRepository>>,
    registry: Registry,
    workflows: Vec<WorkflowDefinition>,
    /// First registration failure, reported by `build`.
    error: Option<KeelError>,
}

impl KeelBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            registry: Registry::new(),
            workflows: Vec::new(),
            error: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: KeelConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this store instead of connecting to `[database]`.
    pub fn store(mut self, store: Arc<dyn WorkflowRepository>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an activity implementation.
    pub fn activity<A: Activity>(mut self, info: ActivityInfo, activity: A) -> Self {
        let result = self.registry.register_activity(info, activity);
        self.record(result);
        self
    }

    /// Register an async closure as an activity with default settings.
    pub fn activity_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, ActivityError>>
            + Send
            + 'static,
    {
        let result = self.registry.register_fn(name, f);
        self.record(result);
        self
    }

    /// Register a workflow definition.
    pub fn workflow(mut self, definition: WorkflowDefinition) -> Self {
        self.workflows.push(definition);
        self
    }

    /// Get mutable access to the registry.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    fn record(&mut self, result: Result<()>) {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
    }

    /// Build the KEEL runtime, connecting to the database unless a store was given.
    pub async fn build(self) -> Result<Keel> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut config = self
            .config
            .ok_or_else(|| KeelError::Config("Configuration is required".to_string()))?;
        config.validate()?;

        let mut registry = self.registry;
        for definition in self.workflows {
            registry.register_workflow(definition)?;
        }
        registry.validate()?;

        if config.worker.id.is_none() {
            config.worker.id = Some(default_worker_id());
        }

        let (store, db): (Arc<dyn WorkflowRepository>, _) = match self.store {
            Some(store) => (store, None),
            None => {
                let db = Database::from_config(&config.database).await?;
                tracing::info!("Connected to database");
                (Arc::new(PgStore::new(db.pool().clone())), Some(db))
            }
        };

        Ok(Keel {
            config,
            db,
            store,
            registry: Arc::new(registry),
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for KeelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for ctrl-c or the shutdown token. If the signal handler cannot be
/// installed, only the token ends the wait.
async fn wait_for_shutdown<S>(signal: S, shutdown: &CancellationToken)
where
    S: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        result = signal => match result {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal, waiting for shutdown token");
                shutdown.cancelled().await;
                tracing::info!("Received shutdown notification");
            }
        },
        _ = shutdown.cancelled() => {
            tracing::info!("Received shutdown notification");
        }
    }
}

/// `<hostname>-<short uuid>`, unique per process.
fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use keel_core::workflow::WorkflowStatus;
    use keel_runtime::MemoryStore;
    use serde_json::json;

    use super::*;

    fn config() -> KeelConfig {
        let mut config = KeelConfig::default_with_database_url("postgres://localhost/test");
        config.worker.poll_interval_ms = 10;
        config
    }

    fn memory() -> Arc<dyn WorkflowRepository> {
        Arc::new(MemoryStore::new())
    }

    fn greeting() -> WorkflowDefinition {
        WorkflowDefinition::builder("greet")
            .activity("hello")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_keel_builder_requires_config() {
        let result = KeelBuilder::new().store(memory()).build().await;
        assert!(matches!(result, Err(KeelError::Config(_))));
    }

    #[tokio::test]
    async fn test_keel_builder_with_store() {
        let keel = Keel::builder()
            .config(config())
            .store(memory())
            .activity_fn("hello", |input| async move { Ok(input) })
            .workflow(greeting())
            .build()
            .await
            .unwrap();

        assert_eq!(keel.registry().workflow_names(), vec!["greet"]);
        let worker_id = keel.config().worker.id.clone().unwrap();
        assert!(!worker_id.is_empty());
    }

    #[tokio::test]
    async fn test_keel_builder_rejects_unregistered_activity() {
        let result = Keel::builder()
            .config(config())
            .store(memory())
            .workflow(greeting())
            .build()
            .await;
        assert!(matches!(result, Err(KeelError::Validation(_))));
    }

    #[tokio::test]
    async fn test_keel_builder_rejects_duplicate_workflow() {
        let result = Keel::builder()
            .config(config())
            .store(memory())
            .activity_fn("hello", |input| async move { Ok(input) })
            .workflow(greeting())
            .workflow(greeting())
            .build()
            .await;
        assert!(matches!(result, Err(KeelError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_keel_builder_rejects_duplicate_activity() {
        let result = Keel::builder()
            .config(config())
            .store(memory())
            .activity_fn("hello", |input| async move { Ok(input) })
            .activity_fn("hello", |_| async move { Ok(json!("shadowed")) })
            .workflow(greeting())
            .build()
            .await;
        assert!(matches!(result, Err(KeelError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_keel_run_until_shutdown() {
        let keel = Keel::builder()
            .config(config())
            .store(memory())
            .activity_fn("hello", |input| async move {
                Ok(json!({ "greeting": input }))
            })
            .workflow(greeting())
            .build()
            .await
            .unwrap();

        let client = keel.client();
        let shutdown = keel.shutdown_token();
        let running = tokio::spawn(keel.run());

        let id = client.submit("greet", json!("world")).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = client.get_status(id).await.unwrap();
            if status.status == WorkflowStatus::Completed {
                assert_eq!(status.output, Some(json!({ "greeting": "world" })));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_signal_failure_waits_for_shutdown_token() {
        let shutdown = CancellationToken::new();
        let failed = async { Err(std::io::Error::other("no signal handler")) };
        let waiting = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { wait_for_shutdown(failed, &shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_signal_ends_wait() {
        let shutdown = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(1),
            wait_for_shutdown(async { Ok(()) }, &shutdown),
        )
        .await
        .unwrap();
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn test_default_worker_id() {
        let a = default_worker_id();
        let b = default_worker_id();
        assert_ne!(a, b);
        assert!(a.len() > 9);
    }
}
