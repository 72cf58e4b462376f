use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::catalog::IndexCatalog;
use crate::config::IndexingConfig;
use crate::context::WorkContext;
use crate::definitions::{Document, IndexEntry, PrecomputedBatch, TransformError};
use crate::enumerator::{FaultTolerantBatch, PassHooks};
use crate::error::{EngineError, Result};
use crate::prefetch::PrefetchCache;
use crate::registry::{IndexHandle, IndexRegistry};
use crate::storage::{MaintenanceTask, StorageAccessor, TransactionalStorage, TransactionalStorageExt};
use crate::tuner::BatchSizeTuner;
use vellum_core::{Etag, IndexId};

/// Consecutive per-document failures tolerated before a single index's pass
/// gives up for this batch.
const MAP_ERROR_BUDGET: usize = 5;

/// Observable state of the scheduler loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Scanning,
    Executing,
    Draining,
    Stopped,
}

/// One stale index picked up by a scanning pass, with the cursor data the
/// execution phase needs.
#[derive(Clone)]
pub struct StaleIndex {
    pub id: IndexId,
    pub handle: Arc<IndexHandle>,
    pub last_indexed_etag: Etag,
    pub touch_count: u64,
}

/// The delegated per-kind execution logic (map vs. map/reduce lives behind
/// this seam). The engine drives it; it never schedules itself.
pub trait BatchExecutor: Send + Sync {
    fn execute(&self, stale: &[StaleIndex], batch_size: usize) -> Result<()>;

    /// Consume a bootstrap batch for one index, advancing its staleness
    /// cursor to the batch's highest etag.
    fn execute_precomputed(&self, batch: PrecomputedBatch) -> Result<()>;
}

/// Reference [`BatchExecutor`] for plain map indexes: loads documents past
/// each index's cursor (through the prefetch cache when possible), applies
/// the compiled transform under the fault-isolating enumerator, and commits
/// entries, cursor and statistics in one storage batch.
pub struct MapExecutor {
    context: Arc<WorkContext>,
    storage: Arc<dyn TransactionalStorage>,
    registry: Arc<IndexRegistry>,
    prefetcher: Arc<PrefetchCache>,
    tuner: Arc<BatchSizeTuner>,
}

impl MapExecutor {
    pub fn new(
        context: Arc<WorkContext>,
        storage: Arc<dyn TransactionalStorage>,
        registry: Arc<IndexRegistry>,
        prefetcher: Arc<PrefetchCache>,
        tuner: Arc<BatchSizeTuner>,
    ) -> Self {
        Self {
            context,
            storage,
            registry,
            prefetcher,
            tuner,
        }
    }

    fn load_documents(&self, cursor: Etag, limit: usize) -> Result<Vec<Document>> {
        if let Some(docs) = self.prefetcher.documents_after(cursor, limit) {
            return Ok(docs);
        }
        let docs = self
            .storage
            .batch_read(|acc| Ok(acc.documents_after(cursor, limit)))?;
        if let Some(last) = docs.last() {
            self.prefetcher.insert_batch(cursor, last.etag, &docs);
        }
        Ok(docs)
    }

    /// Apply `transform` over `docs` with fault isolation, recording each
    /// skipped document in the context's error log.
    fn run_transform(
        &self,
        index_name: &str,
        handle: &IndexHandle,
        docs: Vec<Document>,
    ) -> Result<(Vec<IndexEntry>, Vec<String>, u64)> {
        let Some(transform) = handle.transform() else {
            return Err(EngineError::Transform(TransformError::new(format!(
                "index '{index_name}' has no compiled transform"
            ))));
        };

        let batch = FaultTolerantBatch::new(docs);
        let mut errors = 0u64;
        let entries: Vec<IndexEntry> = {
            let hooks = PassHooks {
                cancel: Some(self.context.cancellation_token()),
                on_error: Some(Box::new(|err: &TransformError, last_ok: Option<&Document>| {
                    errors += 1;
                    self.context
                        .add_error(index_name, last_ok.map(|d| d.key.as_str()), err);
                })),
                ..PassHooks::default()
            };
            batch
                .pass(|doc| transform.apply(doc), MAP_ERROR_BUDGET, hooks)
                .collect()
        };
        self.context.ensure_not_cancelled()?;

        let keys = batch.items().iter().map(|doc| doc.key.clone()).collect();
        Ok((entries, keys, errors))
    }

    fn commit(
        &self,
        id: IndexId,
        handle: &IndexHandle,
        entries: &[IndexEntry],
        processed_keys: &[String],
        highest: Etag,
        attempts: u64,
        errors: u64,
        skip_deletions: bool,
    ) -> Result<()> {
        self.storage.batch(&mut |acc| {
            if !skip_deletions {
                for key in processed_keys {
                    acc.remove_entries_for(id, key);
                }
            }
            acc.store_entries(id, entries);
            acc.update_last_indexed(id, highest, SystemTime::now());
            acc.record_indexing_attempts(id, attempts, errors);
            if let Some(stats) = acc.stats_for(id) {
                handle.set_synced_touch_count(stats.touch_count);
            }
            Ok(())
        })
    }
}

impl BatchExecutor for MapExecutor {
    fn execute(&self, stale: &[StaleIndex], batch_size: usize) -> Result<()> {
        for index in stale {
            self.context.ensure_not_cancelled()?;

            let docs = self.load_documents(index.last_indexed_etag, batch_size)?;
            if docs.is_empty() {
                // Only a touch marked this index dirty; resync the counter so
                // the next scan sees it clean.
                self.storage.batch(&mut |acc| {
                    if let Some(stats) = acc.stats_for(index.id) {
                        index.handle.set_synced_touch_count(stats.touch_count);
                    }
                    Ok(())
                })?;
                continue;
            }

            let was_full = docs.len() == batch_size;
            let highest = docs.last().map(|d| d.etag).unwrap_or(index.last_indexed_etag);
            let attempts = docs.len() as u64;
            let name = index.handle.name();

            let (entries, keys, errors) = self.run_transform(&name, &index.handle, docs)?;
            self.commit(
                index.id,
                &index.handle,
                &entries,
                &keys,
                highest,
                attempts,
                errors,
                false,
            )?;
            self.tuner.record_success(was_full);

            tracing::debug!(
                target = "vellum.index",
                index = %name,
                documents = attempts,
                errors,
                cursor = %highest,
                "indexed batch"
            );
        }
        Ok(())
    }

    fn execute_precomputed(&self, batch: PrecomputedBatch) -> Result<()> {
        let handle = self
            .registry
            .get(batch.index)
            .ok_or_else(|| EngineError::IndexDoesNotExist(batch.index.to_string()))?;
        let name = handle.name();
        let attempts = batch.documents.len() as u64;
        let highest = batch.highest_etag;
        let skip_deletions = batch.skip_deletions;

        let (entries, keys, errors) = self.run_transform(&name, &handle, batch.documents)?;
        self.commit(
            batch.index,
            &handle,
            &entries,
            &keys,
            highest,
            attempts,
            errors,
            skip_deletions,
        )?;

        tracing::info!(
            target = "vellum.index",
            index = %name,
            documents = attempts,
            errors,
            cursor = %highest,
            "applied precomputed batch"
        );
        Ok(())
    }
}

/// The long-running scheduler loop: discovers stale indexes, drives their
/// execution, drains maintenance tasks, and idles with periodic housekeeping.
///
/// One dedicated thread per database calls [`run`](Self::run); it only
/// returns on shutdown.
pub struct IndexingExecutor {
    context: Arc<WorkContext>,
    storage: Arc<dyn TransactionalStorage>,
    registry: Arc<IndexRegistry>,
    catalog: Arc<IndexCatalog>,
    batch_executor: Arc<dyn BatchExecutor>,
    config: IndexingConfig,
    tuner: Arc<BatchSizeTuner>,
    prefetcher: Arc<PrefetchCache>,
    state: Mutex<ExecutorState>,
    dirty_since_flush: AtomicBool,
}

impl IndexingExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<WorkContext>,
        storage: Arc<dyn TransactionalStorage>,
        registry: Arc<IndexRegistry>,
        catalog: Arc<IndexCatalog>,
        batch_executor: Arc<dyn BatchExecutor>,
        config: IndexingConfig,
        tuner: Arc<BatchSizeTuner>,
        prefetcher: Arc<PrefetchCache>,
    ) -> Self {
        Self {
            context,
            storage,
            registry,
            catalog,
            batch_executor,
            config,
            tuner,
            prefetcher,
            state: Mutex::new(ExecutorState::Idle),
            dirty_since_flush: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock()
    }

    fn set_state(&self, state: ExecutorState) {
        *self.state.lock() = state;
    }

    /// Drive the loop until shutdown. Individual iteration failures never
    /// terminate it: resource exhaustion shrinks future batches and retries,
    /// anything else unexpected is logged and retried promptly, so transient
    /// problems self-heal instead of idling into a stale state. Only
    /// cancellation stops the loop.
    pub fn run(&self) {
        tracing::info!(target = "vellum.index", "indexing loop started");
        let mut local_counter = 0u64;

        while self.context.run_indexing() && !self.context.cancellation_token().is_cancelled() {
            let found_work = match self.run_once() {
                Ok(found) => found,
                Err(EngineError::Cancelled) => break,
                Err(EngineError::ResourceExhausted) => {
                    tracing::warn!(
                        target = "vellum.index",
                        batch_size = self.tuner.current(),
                        "resource exhaustion while indexing; reclaiming caches and shrinking batches"
                    );
                    self.reclaim_memory();
                    true
                }
                Err(err) => {
                    tracing::warn!(
                        target = "vellum.index",
                        error = %err,
                        "indexing pass failed; retrying immediately"
                    );
                    true
                }
            };

            if found_work {
                continue;
            }
            if !self.context.run_indexing() {
                break;
            }

            self.set_state(ExecutorState::Idle);
            self.context
                .wait_for_work(self.config.idle_wait, &mut local_counter, || {
                    self.idle_housekeeping()
                });
        }

        self.set_state(ExecutorState::Stopped);
        self.prefetcher.clear();
        tracing::info!(target = "vellum.index", "indexing loop stopped");
    }

    /// One scheduling iteration: scan, execute, drain. Returns whether any
    /// work was found. [`run`](Self::run) drives this in a loop; embedders
    /// that own their scheduling can call it directly.
    pub fn run_once(&self) -> Result<bool> {
        self.context.ensure_not_cancelled()?;

        self.set_state(ExecutorState::Scanning);
        let candidates = self.storage.batch_read(|acc| Ok(self.scan(acc)))?;

        let mut found_work = false;
        if !candidates.is_empty() {
            self.set_state(ExecutorState::Executing);
            {
                // Block concurrent definition changes for the duration of the
                // batch; catalog mutations take the exclusive side.
                let _indexing = self.catalog.begin_indexing();
                self.batch_executor
                    .execute(&candidates, self.tuner.current())?;
            }
            self.dirty_since_flush.store(true, Ordering::SeqCst);
            found_work = true;

            match self.catalog.swap_caught_up_replacements() {
                Ok(promoted) => {
                    for name in promoted {
                        tracing::info!(
                            target = "vellum.index",
                            index = %name,
                            "side-by-side index promoted"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "vellum.index",
                        error = %err,
                        "side-by-side swap check failed"
                    );
                }
            }
        }

        self.set_state(ExecutorState::Draining);
        let drained = self.drain_maintenance()?;

        Ok(found_work || drained > 0)
    }

    /// One atomic look at index stats: returns every index that is stale and
    /// not excluded (invalid, paused, bootstrap in progress, transform not
    /// ready).
    fn scan(&self, acc: &mut dyn StorageAccessor) -> Vec<StaleIndex> {
        let last_doc_etag = acc.last_document_etag();
        let mut candidates = Vec::new();

        for stats in acc.index_stats() {
            if acc.failure_rate(stats.id) > self.config.failure_rate_threshold {
                tracing::trace!(
                    target = "vellum.index",
                    index = %stats.id,
                    failure_rate = stats.failure_rate(),
                    "skipping invalid index"
                );
                continue;
            }
            let Some(handle) = self.registry.get(stats.id) else {
                continue;
            };
            if handle.map_indexing_in_progress() {
                continue;
            }
            if handle.priority().is_paused() {
                continue;
            }
            if !handle.has_transform() {
                continue;
            }

            let cursor_behind = stats.last_indexed_etag < last_doc_etag;
            let touched = stats.touch_count != handle.synced_touch_count();
            if cursor_behind || touched {
                candidates.push(StaleIndex {
                    id: stats.id,
                    last_indexed_etag: stats.last_indexed_etag,
                    touch_count: stats.touch_count,
                    handle,
                });
            }
        }
        candidates
    }

    /// Run a bounded number of storage-backed maintenance tasks so neither
    /// long indexing runs nor a deep task backlog can starve the other.
    ///
    /// Each task is popped and applied inside one batch: if the batch fails,
    /// the task stays queued and the next iteration retries it.
    fn drain_maintenance(&self) -> Result<usize> {
        let mut drained = 0;
        while drained < self.config.max_maintenance_tasks_per_pass {
            self.context.ensure_not_cancelled()?;
            let mut ran = false;
            self.storage.batch(&mut |acc| {
                let Some(task) = acc.next_maintenance_task() else {
                    return Ok(());
                };
                match &task {
                    MaintenanceTask::RemoveFromIndex { index, doc_keys } => {
                        for key in doc_keys {
                            acc.remove_entries_for(*index, key);
                        }
                    }
                    MaintenanceTask::TouchDocument { key } => {
                        acc.touch_document(key);
                    }
                }
                ran = true;
                Ok(())
            })?;
            if !ran {
                break;
            }
            drained += 1;
        }
        Ok(drained)
    }

    /// Housekeeping that runs while idle (and periodically even when no work
    /// arrives): flush dirty index buffers, prune the prefetch cache.
    fn idle_housekeeping(&self) {
        if self.dirty_since_flush.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.storage.batch(&mut |acc| {
                acc.flush_index_buffers();
                Ok(())
            }) {
                tracing::warn!(
                    target = "vellum.index",
                    error = %err,
                    "failed to flush index buffers"
                );
                self.dirty_since_flush.store(true, Ordering::SeqCst);
            }
        }

        if let Some(lowest_cursor) = self.lowest_cursor() {
            self.prefetcher.prune_below(lowest_cursor);
        } else {
            self.prefetcher.clear();
        }
    }

    /// The lowest staleness cursor across live indexes; documents at or below
    /// it can never be asked for again.
    fn lowest_cursor(&self) -> Option<Etag> {
        let stats = self
            .storage
            .batch_read(|acc| Ok(acc.index_stats()))
            .ok()?;
        stats.iter().map(|s| s.last_indexed_etag).min()
    }

    fn reclaim_memory(&self) {
        self.prefetcher.clear();
        self.tuner.shrink();
    }
}
