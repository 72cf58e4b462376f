use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::storage::TransactionalStorage;
use vellum_scheduler::CancellationToken;

/// Upper bound on the in-memory indexing-error ring.
const MAX_RECENT_ERRORS: usize = 50;

/// How long the oldest ring entry is protected from eviction, so a
/// just-recorded error is not discarded before it is durably persisted.
const ERROR_EVICTION_GRACE: Duration = Duration::from_secs(5);

/// One isolated indexing failure, attributed to an index and (when known) a
/// document. Mirrored to the storage collaborator as it is recorded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexingError {
    pub id: u64,
    pub timestamp: SystemTime,
    pub index: String,
    pub document: Option<String>,
    pub error: String,
}

struct WorkState {
    /// Monotonic work counter. A waiter comparing a previously observed value
    /// against this detects "work happened" even if the wakeup itself was
    /// missed; that is why the counter, not the condvar, is the source of
    /// truth.
    counter: u64,
    /// Stack of diagnostic "reasons for the next notification" buffers. The
    /// outermost scope is always present; nested batches push their own via
    /// [`WorkContext::enter_nested_scope`].
    reasons: Vec<Vec<String>>,
    errors: VecDeque<(Instant, IndexingError)>,
}

/// Per-database coordination state shared between writer threads and the
/// indexing scheduler loop.
///
/// Writers call [`notify_work`](Self::notify_work) after committing; the
/// scheduler blocks in [`wait_for_work`](Self::wait_for_work). All other
/// operations are non-blocking. This is an explicit object owned by the
/// database instance, never a global, so multiple databases in one process
/// stay isolated.
pub struct WorkContext {
    storage: Arc<dyn TransactionalStorage>,
    cancel: CancellationToken,
    state: Mutex<WorkState>,
    work_done: Condvar,
    run: AtomicBool,
    run_indexing: AtomicBool,
    run_reducing: AtomicBool,
    next_error_id: AtomicU64,
    error_grace: Duration,
}

impl WorkContext {
    pub fn new(storage: Arc<dyn TransactionalStorage>) -> Self {
        Self {
            storage,
            cancel: CancellationToken::new(),
            state: Mutex::new(WorkState {
                counter: 0,
                reasons: vec![Vec::new()],
                errors: VecDeque::new(),
            }),
            work_done: Condvar::new(),
            run: AtomicBool::new(false),
            run_indexing: AtomicBool::new(false),
            run_reducing: AtomicBool::new(false),
            next_error_id: AtomicU64::new(0),
            error_grace: ERROR_EVICTION_GRACE,
        }
    }

    #[cfg(test)]
    fn with_error_grace(storage: Arc<dyn TransactionalStorage>, grace: Duration) -> Self {
        let mut ctx = Self::new(storage);
        ctx.error_grace = grace;
        ctx
    }

    /// Mark the context live. Until this is called, `wait_for_work` returns
    /// false immediately so a half-initialized database never idles a worker.
    pub fn start(&self) {
        self.run.store(true, Ordering::SeqCst);
        self.run_indexing.store(true, Ordering::SeqCst);
        self.run_reducing.store(true, Ordering::SeqCst);
    }

    /// Orderly shutdown: clear the run flags and wake every waiter so it
    /// observes shutdown instead of timing out.
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
        self.run_indexing.store(false, Ordering::SeqCst);
        self.run_reducing.store(false, Ordering::SeqCst);
        let _state = self.state.lock();
        self.work_done.notify_all();
    }

    /// Shutdown that additionally trips the shared cancellation signal, which
    /// every suspension point in the engine observes.
    pub fn stop_rude(&self) {
        self.stop();
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    pub fn run_indexing(&self) -> bool {
        self.is_running() && self.run_indexing.load(Ordering::SeqCst)
    }

    pub fn run_reducing(&self) -> bool {
        self.is_running() && self.run_reducing.load(Ordering::SeqCst)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    /// Current value of the work counter. Only increases.
    pub fn work_counter(&self) -> u64 {
        self.state.lock().counter
    }

    /// Record a reason for the *next* notification without waking anyone.
    /// Used inside write batches that will notify once on commit.
    pub fn record_work_reason(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        current_scope(&mut state).push(reason.into());
    }

    /// Signal that work happened: increment the shared counter, log the
    /// accumulated reasons, wake every blocked waiter, then clear the current
    /// scope's reasons buffer.
    pub fn notify_work(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        state.counter += 1;
        let counter = state.counter;
        let scope = current_scope(&mut state);
        scope.push(reason.into());
        tracing::trace!(
            target = "vellum.index",
            counter,
            reasons = ?scope,
            "work notified"
        );
        scope.clear();
        self.work_done.notify_all();
    }

    /// Block until work happens, the context stops, or `timeout` elapses.
    ///
    /// If `local_counter` already differs from the shared counter the call
    /// returns true without blocking: the work in question happened while the
    /// caller was busy, and the notification it missed does not matter.
    /// Otherwise `before_wait` runs (periodic housekeeping belongs there, so
    /// it runs even on an idle database), and the counter is re-checked under
    /// the same lock as the blocking wait, which closes the missed-wakeup
    /// window between the check and the sleep.
    ///
    /// Returns whether work was found; updates `local_counter` when it was.
    pub fn wait_for_work<F>(&self, timeout: Duration, local_counter: &mut u64, before_wait: F) -> bool
    where
        F: FnOnce(),
    {
        if !self.is_running() {
            return false;
        }

        {
            let state = self.state.lock();
            if state.counter != *local_counter {
                *local_counter = state.counter;
                return true;
            }
        }

        before_wait();

        let mut state = self.state.lock();
        let deadline = Instant::now() + timeout;
        while state.counter == *local_counter && self.is_running() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if self.work_done.wait_for(&mut state, remaining).timed_out() {
                break;
            }
        }

        if state.counter != *local_counter {
            *local_counter = state.counter;
            true
        } else {
            false
        }
    }

    /// Push a nested reasons scope mirroring a nested write batch. The scope
    /// pops on drop, merging any reasons that were recorded but not yet
    /// notified into the parent scope.
    pub fn enter_nested_scope(&self) -> NestedReasonsScope<'_> {
        self.state.lock().reasons.push(Vec::new());
        NestedReasonsScope { context: self }
    }

    /// Record an isolated indexing failure. The error is persisted through
    /// the storage collaborator and appended to the bounded in-memory ring;
    /// on overflow the oldest entry is only evicted once it has aged past a
    /// short grace period.
    pub fn add_error(
        &self,
        index: impl Into<String>,
        document: Option<&str>,
        error: impl std::fmt::Display,
    ) -> u64 {
        let id = self.next_error_id.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = IndexingError {
            id,
            timestamp: SystemTime::now(),
            index: index.into(),
            document: document.map(str::to_string),
            error: error.to_string(),
        };

        if let Err(err) = self.storage.batch(&mut |acc| {
            acc.persist_error(&entry);
            Ok(())
        }) {
            tracing::warn!(
                target = "vellum.index",
                error = %err,
                "failed to persist indexing error"
            );
        }

        let mut state = self.state.lock();
        state.errors.push_back((Instant::now(), entry));
        while state.errors.len() > MAX_RECENT_ERRORS {
            let (added, _) = state.errors.front().expect("ring is non-empty");
            if added.elapsed() < self.error_grace {
                break;
            }
            state.errors.pop_front();
        }
        id
    }

    /// Snapshot of the recent-errors ring, oldest first.
    pub fn errors(&self) -> Vec<IndexingError> {
        self.state
            .lock()
            .errors
            .iter()
            .map(|(_, error)| error.clone())
            .collect()
    }

    /// Drop all recorded errors for one index, from the ring and from storage.
    pub fn clear_errors_for(&self, index: &str) {
        {
            let mut state = self.state.lock();
            state.errors.retain(|(_, error)| error.index != index);
        }
        if let Err(err) = self.storage.batch(&mut |acc| {
            acc.clear_errors_for(index);
            Ok(())
        }) {
            tracing::warn!(
                target = "vellum.index",
                index,
                error = %err,
                "failed to clear persisted indexing errors"
            );
        }
    }

    fn exit_nested_scope(&self) {
        let mut state = self.state.lock();
        assert!(
            state.reasons.len() > 1,
            "cannot pop the outermost work-reasons scope"
        );
        let popped = state.reasons.pop().expect("scope stack is non-empty");
        current_scope(&mut state).extend(popped);
    }
}

fn current_scope(state: &mut WorkState) -> &mut Vec<String> {
    state
        .reasons
        .last_mut()
        .expect("outermost reasons scope always present")
}

/// RAII guard for a nested work-reasons scope; see
/// [`WorkContext::enter_nested_scope`].
pub struct NestedReasonsScope<'a> {
    context: &'a WorkContext,
}

impl Drop for NestedReasonsScope<'_> {
    fn drop(&mut self) {
        self.context.exit_nested_scope();
    }
}
