pub mod client;
pub mod db;
pub mod engine;
pub mod observability;
pub mod registry;
pub mod store;

pub use client::{StatusView, StepSummary, WorkflowClient};
pub use db::Database;
pub use engine::{SignalRouter, StepExecutor, StepOutcome, Worker};
pub use registry::{ActivityEntry, Registry};
pub use store::{MemoryStore, PgStore};
