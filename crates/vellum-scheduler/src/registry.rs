use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::CancellationToken;

/// Identity of a tracked background task, unique per registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub const fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Faulted(String),
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// Operator-visible snapshot of one tracked task.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub description: String,
    pub status: TaskStatus,
}

struct TaskEntry {
    description: String,
    token: CancellationToken,
    status: TaskStatus,
}

/// Tracker for long-running background units (new-index bootstrap, async
/// index-data deletion) so they stay visible and cancellable from outside the
/// engine after the request that triggered them has already returned.
#[derive(Default)]
pub struct BackgroundTaskRegistry {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<TaskId, TaskEntry>>,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, description: impl Into<String>, token: CancellationToken) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().insert(
            id,
            TaskEntry {
                description: description.into(),
                token,
                status: TaskStatus::Pending,
            },
        );
        id
    }

    pub fn mark_running(&self, id: TaskId) {
        self.set_status(id, TaskStatus::Running);
    }

    pub fn mark_completed(&self, id: TaskId) {
        self.set_status(id, TaskStatus::Completed);
    }

    pub fn mark_faulted(&self, id: TaskId, error: impl Into<String>) {
        self.set_status(id, TaskStatus::Faulted(error.into()));
    }

    pub fn mark_cancelled(&self, id: TaskId) {
        self.set_status(id, TaskStatus::Cancelled);
    }

    fn set_status(&self, id: TaskId, status: TaskStatus) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = status;
        }
    }

    /// Request cooperative cancellation of a tracked task. Returns false for
    /// unknown or already-terminal tasks.
    pub fn cancel(&self, id: TaskId) -> bool {
        let entries = self.entries.lock();
        match entries.get(&id) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.entries.lock().get(&id).map(|entry| entry.status.clone())
    }

    pub fn descriptors(&self) -> Vec<TaskDescriptor> {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| TaskDescriptor {
                id: *id,
                description: entry.description.clone(),
                status: entry.status.clone(),
            })
            .collect()
    }

    /// Drop records of finished tasks, returning how many were removed.
    pub fn prune_terminal(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.status.is_terminal());
        before - entries.len()
    }

    pub fn has_pending(&self) -> bool {
        self.entries
            .lock()
            .values()
            .any(|entry| !entry.status.is_terminal())
    }
}
