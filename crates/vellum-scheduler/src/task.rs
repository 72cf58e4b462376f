use tokio::sync::oneshot;

use crate::{CancellationToken, TaskError};

/// Join handle for work spawned on one of the scheduler's blocking pools.
///
/// The engine's callers are synchronous (the indexing loop runs on a plain
/// dedicated thread), so joining blocks the current thread rather than
/// awaiting. Dropping the handle detaches the task; it keeps running and its
/// result is discarded.
pub struct BlockingTask<T> {
    token: CancellationToken,
    rx: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> BlockingTask<T> {
    pub(crate) fn new(
        token: CancellationToken,
        rx: oneshot::Receiver<Result<T, TaskError>>,
    ) -> Self {
        Self { token, rx }
    }

    /// Request cooperative cancellation. The task observes this through the
    /// token it was spawned with.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Block until the task finishes.
    pub fn wait(self) -> Result<T, TaskError> {
        if self.token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        match self.rx.blocking_recv() {
            Ok(result) => result,
            // Sender dropped without a value: the pool shut down mid-flight.
            Err(_) => Err(TaskError::Cancelled),
        }
    }

    /// Non-blocking poll; `None` while the task is still running.
    pub fn try_wait(&mut self) -> Option<Result<T, TaskError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TaskError::Cancelled)),
        }
    }
}
