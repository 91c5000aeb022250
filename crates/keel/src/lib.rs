//! KEEL - durable workflow execution on PostgreSQL
//!
//! Workflows are linear chains of activities, sleeps, signal waits and awaits
//! on detached activities. Every transition is persisted, so any worker can
//! pick an instance up after a crash.

mod runtime;

#[doc(hidden)]
pub use keel_core;
#[doc(hidden)]
pub use keel_runtime;

pub use runtime::prelude;
pub use runtime::{Keel, KeelBuilder};
