use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use keel_core::error::{KeelError, Result};
use keel_core::retry::RetryPolicy;
use keel_core::workflow::{Activity, ActivityError, ActivityFn, ActivityInfo, WorkflowDefinition};

/// A registered activity.
#[derive(Clone)]
pub struct ActivityEntry {
    /// Activity metadata.
    pub info: ActivityInfo,
    /// The callable.
    pub activity: Arc<dyn Activity>,
}

impl ActivityEntry {
    /// Retry policy for this activity, falling back to the kind default.
    pub fn retry_policy<'a>(&'a self, default: &'a RetryPolicy) -> &'a RetryPolicy {
        self.info.retry.as_ref().unwrap_or(default)
    }

    /// Timeout for this activity, falling back to the worker default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.info.timeout.unwrap_or(default)
    }
}

/// Registry of workflow definitions and activities.
#[derive(Clone, Default)]
pub struct Registry {
    workflows: HashMap<String, Arc<WorkflowDefinition>>,
    activities: HashMap<String, ActivityEntry>,
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity implementation. Names are unique.
    pub fn register_activity<A: Activity>(
        &mut self,
        info: ActivityInfo,
        activity: A,
    ) -> Result<()> {
        if self.activities.contains_key(&info.name) {
            return Err(KeelError::Duplicate(format!("activity '{}'", info.name)));
        }
        self.activities.insert(
            info.name.clone(),
            ActivityEntry {
                info,
                activity: Arc::new(activity),
            },
        );
        Ok(())
    }

    /// Register an async closure as an activity with default settings.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, ActivityError>> + Send + 'static,
    {
        self.register_activity(ActivityInfo::new(name), ActivityFn::new(f))
    }

    /// Register a workflow definition. Names are unique.
    pub fn register_workflow(&mut self, definition: WorkflowDefinition) -> Result<()> {
        let name = definition.name().to_string();
        if self.workflows.contains_key(&name) {
            return Err(KeelError::Duplicate(format!("workflow type '{}'", name)));
        }
        self.workflows.insert(name, Arc::new(definition));
        Ok(())
    }

    pub fn workflow(&self, name: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.workflows.get(name)
    }

    pub fn activity(&self, name: &str) -> Option<&ActivityEntry> {
        self.activities.get(name)
    }

    /// Check that every activity a workflow invokes is registered.
    pub fn validate(&self) -> Result<()> {
        for definition in self.workflows.values() {
            for name in definition.activity_names() {
                if !self.activities.contains_key(name) {
                    return Err(KeelError::Validation(format!(
                        "workflow '{}' uses unregistered activity '{}'",
                        definition.name(),
                        name
                    )));
                }
            }
        }
        for entry in self.activities.values() {
            if let Some(policy) = &entry.info.retry {
                policy.validate()?;
            }
        }
        Ok(())
    }

    /// Get all workflow type names.
    pub fn workflow_names(&self) -> Vec<&str> {
        self.workflows.keys().map(|s| s.as_str()).collect()
    }
}
