use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;

use super::instance::WorkflowError;
use crate::retry::RetryPolicy;

/// Error class used when an activity exceeds its timeout.
pub const TIMEOUT_ERROR_CLASS: &str = "timeout";
/// Error class used when an activity panics.
pub const PANIC_ERROR_CLASS: &str = "panic";
/// Error class used when a step names an activity that is not registered.
pub const UNKNOWN_ACTIVITY_CLASS: &str = "unknown_activity";
/// Error class used when an instance's workflow type is no longer registered.
pub const UNKNOWN_WORKFLOW_CLASS: &str = "unknown_workflow_type";

/// Failure raised by an activity.
///
/// Whether it is retried depends on the retry policy's non-retryable classes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityError {
    pub class: String,
    pub message: String,
}

impl ActivityError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// An error of the generic `transient` class.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new("transient", message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TIMEOUT_ERROR_CLASS,
            format!("activity timed out after {:?}", after),
        )
    }

    /// Error for an activity that panicked, from the unwind payload.
    pub fn panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "activity panicked".to_string());
        Self::new(PANIC_ERROR_CLASS, message)
    }
}

impl fmt::Display for ActivityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<ActivityError> for WorkflowError {
    fn from(e: ActivityError) -> Self {
        WorkflowError::new(e.class, e.message)
    }
}

impl From<serde_json::Error> for ActivityError {
    fn from(e: serde_json::Error) -> Self {
        ActivityError::new("serialization", e.to_string())
    }
}

/// A host-supplied unit of work.
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Run the activity with the step input.
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ActivityError>;
}

/// Adapts an async closure into an [`Activity`].
pub struct ActivityFn<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

impl<F, Fut> ActivityFn<F, Fut>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ActivityError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> Activity for ActivityFn<F, Fut>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ActivityError>> + Send + 'static,
{
    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ActivityError> {
        (self.f)(input).await
    }
}

/// Activity metadata.
#[derive(Debug, Clone)]
pub struct ActivityInfo {
    /// Activity name (used for routing).
    pub name: String,
    /// Per-invocation timeout; the worker default applies when unset.
    pub timeout: Option<Duration>,
    /// Retry policy override; the activity kind default applies when unset.
    pub retry: Option<RetryPolicy>,
}

impl ActivityInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            retry: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}
