pub mod config;
pub mod error;
pub mod retry;
pub mod store;
pub mod workflow;

pub use config::KeelConfig;
pub use error::{KeelError, Result};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{
    ClaimedStep, Effect, EventStore, StepChange, StepUpdate, Transition, WorkflowRepository,
};
pub use workflow::{
    Activity, ActivityError, ActivityFn, ActivityInfo, Event, EventCategory, EventDraft,
    EventStatus, InstanceSnapshot, StepDef, StepId, StepKind, StepRecord, StepStatus,
    WorkflowBuilder, WorkflowDefinition, WorkflowError, WorkflowInstance, WorkflowStatus,
};
