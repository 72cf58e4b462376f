//! Task-execution substrate for Vellum's background engine.
//!
//! The database core never spawns raw threads for one-off work: background
//! units (new-index bootstrap, asynchronous index-data deletion) run on the
//! pools owned by [`Scheduler`], are isolated from panics, and are visible to
//! operators through the [`BackgroundTaskRegistry`].

mod registry;
mod scheduler;
mod task;

use std::fmt;

pub use registry::{BackgroundTaskRegistry, TaskDescriptor, TaskId, TaskStatus};
pub use scheduler::{PoolKind, Scheduler, SchedulerConfig};
pub use task::BlockingTask;

pub use tokio_util::sync::CancellationToken;

/// Marker error returned by cooperative work that observed cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation was cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Terminal outcome of a scheduled task that did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    Cancelled,
    Panicked,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Cancelled => f.write_str("task was cancelled"),
            TaskError::Panicked => f.write_str("task panicked"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}
