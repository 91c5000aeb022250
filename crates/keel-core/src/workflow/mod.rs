mod activity;
mod definition;
mod event;
mod instance;
mod step;

pub use activity::{
    Activity, ActivityError, ActivityFn, ActivityInfo, PANIC_ERROR_CLASS, TIMEOUT_ERROR_CLASS,
    UNKNOWN_ACTIVITY_CLASS, UNKNOWN_WORKFLOW_CLASS,
};
pub use definition::{StepDef, WorkflowBuilder, WorkflowDefinition};
pub use event::{sort_events, Event, EventCategory, EventDraft, EventStatus};
pub use instance::{InstanceSnapshot, WorkflowError, WorkflowInstance, WorkflowStatus};
pub use step::{StepId, StepKind, StepRecord, StepStatus};
