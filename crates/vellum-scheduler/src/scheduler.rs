use std::sync::Arc;

use rayon::ThreadPool;
use tokio::sync::oneshot;

use vellum_core::panic_payload_to_str;

use crate::{BlockingTask, CancellationToken, Cancelled, TaskError};

enum BlockingPool {
    Rayon(ThreadPool),
    Inline,
}

impl BlockingPool {
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            BlockingPool::Rayon(pool) => pool.spawn(job),
            BlockingPool::Inline => job(),
        }
    }
}

fn build_rayon_pool(prefix: &'static str, threads: usize) -> BlockingPool {
    // Thread creation can fail in constrained CI/sandbox environments (e.g. low
    // RLIMIT_NPROC or `EAGAIN`). Vellum should degrade gracefully rather than
    // crashing while a database is being opened.
    let mut threads = threads.max(1);
    loop {
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .build()
        {
            Ok(pool) => return BlockingPool::Rayon(pool),
            // When a host runs many databases, OS thread limits are a real
            // possibility. Fall back to a smaller pool instead of crashing.
            Err(_) if threads > 1 => {
                threads = (threads / 2).max(1);
            }
            Err(_) => {
                // If we can't create *any* worker threads, fall back to inline
                // execution. This preserves functional correctness at the cost
                // of parallelism.
                return BlockingPool::Inline;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// CPU-bound index execution work.
    Compute,
    /// One-off background units: bootstrap scans, async index-data deletion.
    Background,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub compute_threads: usize,
    pub background_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            // In containers, `available_parallelism()` can report the host CPU
            // count even when the process is constrained by cgroups. Keep
            // defaults conservative; embedders that want full-core utilization
            // can provide an explicit `SchedulerConfig`.
            compute_threads: available.saturating_sub(1).clamp(1, 8),
            background_threads: available.clamp(1, 2),
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    compute_pool: BlockingPool,
    background_pool: BlockingPool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                compute_pool: build_rayon_pool("vellum-compute", config.compute_threads),
                background_pool: build_rayon_pool("vellum-background", config.background_threads),
            }),
        }
    }

    pub fn spawn_blocking_on<T, F>(
        &self,
        pool: PoolKind,
        token: CancellationToken,
        f: F,
    ) -> BlockingTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if token.is_cancelled() {
            let _ = tx.send(Err(TaskError::Cancelled));
            return BlockingTask::new(token, rx);
        }

        let token_for_job = token.clone();
        let pool_for_job = pool;
        let job = move || {
            let result =
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(token_for_job))) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => Err(TaskError::from(err)),
                    Err(panic) => {
                        let message = panic_payload_to_str(&*panic);
                        tracing::error!(
                            target = "vellum.scheduler",
                            pool = ?pool_for_job,
                            panic = %message,
                            "task panicked"
                        );
                        Err(TaskError::Panicked)
                    }
                };
            let _ = tx.send(result);
        };

        match pool {
            PoolKind::Compute => self.inner.compute_pool.spawn(job),
            PoolKind::Background => self.inner.background_pool.spawn(job),
        }

        BlockingTask::new(token, rx)
    }

    pub fn spawn_compute<T, F>(&self, f: F) -> BlockingTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
    {
        self.spawn_blocking_on(PoolKind::Compute, CancellationToken::new(), f)
    }

    pub fn spawn_background<T, F>(&self, f: F) -> BlockingTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
    {
        self.spawn_background_with_token(CancellationToken::new(), f)
    }

    pub fn spawn_background_with_token<T, F>(
        &self,
        token: CancellationToken,
        f: F,
    ) -> BlockingTask<T>
    where
        T: Send + 'static,
        F: FnOnce(CancellationToken) -> Result<T, Cancelled> + Send + 'static,
    {
        self.spawn_blocking_on(PoolKind::Background, token, f)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}
