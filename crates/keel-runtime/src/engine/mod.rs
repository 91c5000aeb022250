//! Step execution, scheduling and signal delivery.

mod executor;
pub mod progress;
mod scheduler;
mod signal;

pub use executor::{ExecutorConfig, StepExecutor};
pub use progress::{Completion, Plan, StepOutcome};
pub use scheduler::Worker;
pub use signal::SignalRouter;
