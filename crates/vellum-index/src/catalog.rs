//! The index catalog: definition lifecycle (put, update, delete, reset),
//! side-by-side replacement, and the new-index bootstrap that seeds a fresh
//! index from the full-collection catalog index instead of replaying the
//! whole document log.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::config::IndexingConfig;
use crate::context::WorkContext;
use crate::definitions::{
    IndexDefinition, IndexEtag, IndexPriority, PrecomputedBatch, TransformCompiler,
};
use crate::error::{EngineError, Result};
use crate::executor::BatchExecutor;
use crate::registry::{IndexHandle, IndexRegistry};
use crate::storage::{TransactionalStorage, TransactionalStorageExt};
use vellum_core::IndexId;
use vellum_scheduler::{BackgroundTaskRegistry, Scheduler, TaskId};

/// Name of the built-in index that maps every document to its collection tag.
/// The new-index bootstrap queries it to seed collection-scoped indexes.
pub const COLLECTION_CATALOG_INDEX: &str = "Catalog/DocumentsByCollection";

/// Name prefix marking a side-by-side replacement index.
pub const SIDE_BY_SIDE_PREFIX: &str = "ReplacementOf/";

/// Name segment reserved for ad-hoc query indexes; user definitions must not
/// shadow it.
const RESERVED_DYNAMIC: &str = "dynamic";

/// How an incoming definition relates to what the catalog already holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexChangeKind {
    /// Identical definition; nothing to do.
    Noop,
    /// Only non-semantic parts (metadata, lock mode) changed: keep the
    /// compiled artifact and the indexed data.
    UpdateWithoutRecompile,
    /// Semantic change: keep the id, drop data and statistics, recompile.
    Update,
    /// No definition under this name yet.
    Create,
}

/// Outcome of one accepted put. `name` is the name the definition actually
/// landed under, which differs from the requested name when a lock redirected
/// it to a side-by-side replacement.
#[derive(Clone, Debug)]
pub struct PutIndexResult {
    pub name: String,
    pub change: IndexChangeKind,
    pub id: IndexId,
}

struct StoredDefinition {
    id: IndexId,
    definition: IndexDefinition,
}

#[derive(Default)]
struct CatalogInner {
    definitions: BTreeMap<String, StoredDefinition>,
}

/// Guard held by the scheduler loop for the duration of one execution batch.
/// Catalog mutations take the exclusive side of the same lock, so a batch
/// never observes a half-applied definition change.
pub struct IndexingGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Owns index definitions and drives their lifecycle.
///
/// All mutations serialize on an internal put lock and exclude concurrent
/// batch execution; reads (definition lookups, fingerprints) are lock-cheap.
pub struct IndexCatalog {
    storage: Arc<dyn TransactionalStorage>,
    registry: Arc<IndexRegistry>,
    context: Arc<WorkContext>,
    scheduler: Scheduler,
    tasks: Arc<BackgroundTaskRegistry>,
    compiler: Arc<dyn TransformCompiler>,
    batch_executor: Arc<dyn BatchExecutor>,
    config: IndexingConfig,
    inner: RwLock<CatalogInner>,
    /// Serializes definition mutations against each other.
    put_lock: Mutex<()>,
    /// Readers: batch execution. Writers: definition mutations. Lock order is
    /// always `put_lock` first, then this.
    indexing_activity: RwLock<()>,
    next_id: AtomicU32,
    /// At most one bootstrap runs per database; a losing racer degrades to
    /// ordinary indexing rather than queueing.
    bootstrap_in_flight: Arc<AtomicBool>,
}

impl IndexCatalog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn TransactionalStorage>,
        registry: Arc<IndexRegistry>,
        context: Arc<WorkContext>,
        scheduler: Scheduler,
        tasks: Arc<BackgroundTaskRegistry>,
        compiler: Arc<dyn TransformCompiler>,
        batch_executor: Arc<dyn BatchExecutor>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            context,
            scheduler,
            tasks,
            compiler,
            batch_executor,
            config,
            inner: RwLock::new(CatalogInner::default()),
            put_lock: Mutex::new(()),
            indexing_activity: RwLock::new(()),
            next_id: AtomicU32::new(1),
            bootstrap_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Taken by the scheduler loop around one execution batch.
    pub fn begin_indexing(&self) -> IndexingGuard<'_> {
        IndexingGuard {
            _guard: self.indexing_activity.read(),
        }
    }

    pub fn tasks(&self) -> &BackgroundTaskRegistry {
        &self.tasks
    }

    pub fn definition(&self, name: &str) -> Option<IndexDefinition> {
        self.inner
            .read()
            .definitions
            .get(name)
            .map(|stored| stored.definition.clone())
    }

    pub fn id_for(&self, name: &str) -> Option<IndexId> {
        self.inner.read().definitions.get(name).map(|stored| stored.id)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.inner.read().definitions.keys().cloned().collect()
    }

    /// Whether `definition` is semantically different from what is stored
    /// under `name` (true for an unknown name).
    pub fn has_changed(&self, name: &str, definition: &IndexDefinition) -> bool {
        match self.inner.read().definitions.get(name) {
            None => true,
            Some(stored) => stored.definition.content_hash() != definition.content_hash(),
        }
    }

    pub fn put_index(&self, name: &str, definition: IndexDefinition) -> Result<Option<PutIndexResult>> {
        let _serialized = self.put_lock.lock();
        let _exclusive = self.indexing_activity.write();
        self.put_index_locked(name, definition, false)
    }

    /// Accept a batch of definitions atomically: if any put fails, every index
    /// *created* by the batch is rolled back (updates to pre-existing indexes
    /// are not undone; their data was already rebuilt in place).
    pub fn put_indexes(
        &self,
        entries: Vec<(String, IndexDefinition)>,
    ) -> Result<Vec<Option<PutIndexResult>>> {
        let _serialized = self.put_lock.lock();
        let _exclusive = self.indexing_activity.write();

        let mut results = Vec::with_capacity(entries.len());
        let mut created: Vec<String> = Vec::new();
        for (name, definition) in entries {
            match self.put_index_locked(&name, definition, false) {
                Ok(result) => {
                    if let Some(res) = &result {
                        if res.change == IndexChangeKind::Create {
                            created.push(res.name.clone());
                        }
                    }
                    results.push(result);
                }
                Err(err) => {
                    for name in created.iter().rev() {
                        if let Err(rollback_err) = self.delete_index_locked(name) {
                            tracing::warn!(
                                target = "vellum.catalog",
                                index = %name,
                                error = %rollback_err,
                                "failed to roll back index created by failed batch"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(results)
    }

    /// Like [`put_indexes`](Self::put_indexes), but a changed definition for an
    /// existing index lands under a side-by-side replacement name instead of
    /// rebuilding in place. The replacement indexes from scratch and is swapped
    /// over the original once caught up.
    pub fn put_side_by_side_indexes(
        &self,
        entries: Vec<(String, IndexDefinition)>,
    ) -> Result<Vec<Option<PutIndexResult>>> {
        let _serialized = self.put_lock.lock();
        let _exclusive = self.indexing_activity.write();

        let mut results = Vec::with_capacity(entries.len());
        let mut created: Vec<String> = Vec::new();
        for (name, definition) in entries {
            match self.put_side_by_side_locked(&name, definition) {
                Ok(result) => {
                    if let Some(res) = &result {
                        if res.change == IndexChangeKind::Create {
                            created.push(res.name.clone());
                        }
                    }
                    results.push(result);
                }
                Err(err) => {
                    for name in created.iter().rev() {
                        if let Err(rollback_err) = self.delete_index_locked(name) {
                            tracing::warn!(
                                target = "vellum.catalog",
                                index = %name,
                                error = %rollback_err,
                                "failed to roll back index created by failed batch"
                            );
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(results)
    }

    pub fn delete_index(&self, name: &str) -> Result<IndexId> {
        let _serialized = self.put_lock.lock();
        let _exclusive = self.indexing_activity.write();
        self.delete_index_locked(name)
    }

    /// Re-spawn data deletion for every index whose deletion marker survived
    /// a restart (the process died between the synchronous half of a delete
    /// and the background cleanup). Called once when the database opens.
    /// Returns how many deletions were resumed.
    pub fn resume_pending_deletions(&self) -> Result<usize> {
        let pending = self
            .storage
            .batch_read(|acc| Ok(acc.pending_index_deletions()))?;
        let count = pending.len();
        for id in pending {
            tracing::info!(
                target = "vellum.catalog",
                index = %id,
                "resuming interrupted index data deletion"
            );
            self.spawn_index_data_deletion(format!("index-{id}"), id);
        }
        Ok(count)
    }

    /// Drop an index's data and statistics and rebuild it from scratch under a
    /// fresh id, keeping the definition.
    pub fn reset_index(&self, name: &str) -> Result<IndexId> {
        let _serialized = self.put_lock.lock();
        let _exclusive = self.indexing_activity.write();

        let definition = self
            .inner
            .read()
            .definitions
            .get(name)
            .map(|stored| stored.definition.clone())
            .ok_or_else(|| EngineError::IndexDoesNotExist(name.to_string()))?;

        self.delete_index_locked(name)?;
        let result = self
            .put_index_locked(name, definition, true)?
            .ok_or_else(|| EngineError::Storage("reset produced no index".to_string()))?;
        Ok(result.id)
    }

    pub fn set_priority(&self, name: &str, priority: IndexPriority) -> Result<()> {
        let id = self
            .id_for(name)
            .ok_or_else(|| EngineError::IndexDoesNotExist(name.to_string()))?;
        if let Some(handle) = self.registry.get(id) {
            handle.set_priority(priority);
        }
        self.storage.batch(&mut |acc| {
            acc.set_priority(&[id], priority);
            Ok(())
        })?;
        self.context
            .notify_work(format!("index priority changed: {name}"));
        Ok(())
    }

    /// Promote every side-by-side replacement whose cursor has caught up with
    /// the document log. Returns the original names that were swapped.
    ///
    /// Called by the scheduler loop after each execution batch, strictly
    /// *outside* its [`IndexingGuard`], since promotion takes the exclusive
    /// side of the same lock.
    pub fn swap_caught_up_replacements(&self) -> Result<Vec<String>> {
        let candidates: Vec<(String, String, IndexId)> = self
            .inner
            .read()
            .definitions
            .iter()
            .filter_map(|(name, stored)| {
                let original = name.strip_prefix(SIDE_BY_SIDE_PREFIX)?;
                Some((name.clone(), original.to_string(), stored.id))
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let _serialized = self.put_lock.lock();
        let _exclusive = self.indexing_activity.write();

        let mut promoted = Vec::new();
        for (replacement_name, original_name, id) in candidates {
            let Some(handle) = self.registry.get(id) else {
                continue;
            };
            if handle.map_indexing_in_progress() {
                continue;
            }
            let caught_up = self.storage.batch_read(|acc| {
                Ok(acc
                    .stats_for(id)
                    .is_some_and(|stats| stats.last_indexed_etag >= acc.last_document_etag()))
            })?;
            if !caught_up {
                continue;
            }

            let displaced = {
                let mut inner = self.inner.write();
                let Some(replacement) = inner.definitions.remove(&replacement_name) else {
                    continue;
                };
                let displaced = inner.definitions.remove(&original_name);
                inner.definitions.insert(
                    original_name.clone(),
                    StoredDefinition {
                        id: replacement.id,
                        definition: replacement.definition,
                    },
                );
                displaced
            };

            if let Some(displaced) = displaced {
                self.storage.batch(&mut |acc| {
                    acc.prepare_index_for_deletion(displaced.id);
                    Ok(())
                })?;
                if let Some(old_handle) = self.registry.remove(displaced.id) {
                    old_handle.clear_transform();
                }
                self.context.clear_errors_for(&original_name);
                self.spawn_index_data_deletion(original_name.clone(), displaced.id);
            }
            handle.rename(&original_name);
            self.storage.batch(&mut |acc| {
                acc.delete_document(&replacement_marker_key(&original_name));
                Ok(())
            })?;
            self.context
                .notify_work(format!("side-by-side index promoted: {original_name}"));
            promoted.push(original_name);
        }
        Ok(promoted)
    }

    /// Content fingerprint of an index for conditional-request caching: it
    /// changes whenever the definition, the index's progress, or the document
    /// log changes. When `previous` is supplied and no longer matches, the
    /// all-ones [`IndexEtag::INVALID`] sentinel is returned so every cache
    /// comparison against it misses.
    pub fn get_index_etag(
        &self,
        name: &str,
        previous: Option<IndexEtag>,
        transformer: Option<&str>,
    ) -> Result<IndexEtag> {
        let (id, definition_hash) = self
            .inner
            .read()
            .definitions
            .get(name)
            .map(|stored| (stored.id, stored.definition.content_hash()))
            .ok_or_else(|| EngineError::IndexDoesNotExist(name.to_string()))?;

        let (stats, last_doc_etag, write_sequence) = self.storage.batch_read(|acc| {
            Ok((acc.stats_for(id), acc.last_document_etag(), acc.write_sequence()))
        })?;

        let mut hasher = blake3::Hasher::new();
        hasher.update(&definition_hash);
        hasher.update(name.as_bytes());
        if let Some(transformer) = transformer {
            hasher.update(transformer.as_bytes());
        }
        hasher.update(&last_doc_etag.raw().to_le_bytes());
        hasher.update(&write_sequence.to_le_bytes());
        if let Some(stats) = &stats {
            hasher.update(&stats.last_indexed_etag.raw().to_le_bytes());
            hasher.update(&stats.touch_count.to_le_bytes());
            let is_stale = stats.last_indexed_etag < last_doc_etag;
            hasher.update(&[u8::from(is_stale)]);
            if let Some(last_reduced) = stats.last_reduced_etag {
                hasher.update(&last_reduced.raw().to_le_bytes());
            }
        }

        let etag = IndexEtag::from_bytes(*hasher.finalize().as_bytes());
        if previous.is_some_and(|prev| prev != etag) {
            return Ok(IndexEtag::INVALID);
        }
        Ok(etag)
    }

    fn put_side_by_side_locked(
        &self,
        name: &str,
        definition: IndexDefinition,
    ) -> Result<Option<PutIndexResult>> {
        let existing_id = self.id_for(name);
        let Some(existing_id) = existing_id else {
            // Nothing to replace; a plain create.
            return self.put_index_locked(name, definition, true);
        };
        if !self.has_changed(name, &definition) {
            return Ok(Some(PutIndexResult {
                name: name.to_string(),
                change: IndexChangeKind::Noop,
                id: existing_id,
            }));
        }
        self.put_index_locked(&side_by_side_name(name), definition, true)
    }

    fn put_index_locked(
        &self,
        name: &str,
        definition: IndexDefinition,
        bypass_lock_redirect: bool,
    ) -> Result<Option<PutIndexResult>> {
        validate_index_name(name)?;

        let existing = self
            .inner
            .read()
            .definitions
            .get(name)
            .map(|stored| (stored.id, stored.definition.clone()));

        if let Some((_, stored)) = &existing {
            if !bypass_lock_redirect {
                use crate::definitions::IndexLockMode;
                match stored.lock_mode {
                    IndexLockMode::LockedIgnore => {
                        tracing::debug!(
                            target = "vellum.catalog",
                            index = %name,
                            "definition change ignored: index is locked"
                        );
                        return Ok(None);
                    }
                    IndexLockMode::LockedError => {
                        return Err(EngineError::IndexLocked(name.to_string()));
                    }
                    IndexLockMode::SideBySide if self.has_changed(name, &definition) => {
                        return self.put_index_locked(
                            &side_by_side_name(name),
                            definition,
                            true,
                        );
                    }
                    _ => {}
                }
            }
        }

        let change = match &existing {
            None => IndexChangeKind::Create,
            Some((_, stored)) if *stored == definition => IndexChangeKind::Noop,
            Some((_, stored)) if stored.content_hash() == definition.content_hash() => {
                IndexChangeKind::UpdateWithoutRecompile
            }
            Some(_) => IndexChangeKind::Update,
        };

        match change {
            IndexChangeKind::Noop => {
                let (id, _) = existing.expect("noop implies an existing definition");
                Ok(Some(PutIndexResult {
                    name: name.to_string(),
                    change,
                    id,
                }))
            }
            IndexChangeKind::UpdateWithoutRecompile => {
                // Same semantics, different dressing: swap the stored
                // definition, bump the fingerprint, keep artifact and data.
                let (id, _) = existing.expect("update implies an existing definition");
                self.inner
                    .write()
                    .definitions
                    .insert(name.to_string(), StoredDefinition { id, definition });
                self.storage.batch(&mut |acc| {
                    acc.touch_index_etag(id);
                    Ok(())
                })?;
                self.context
                    .notify_work(format!("index definition updated: {name}"));
                Ok(Some(PutIndexResult {
                    name: name.to_string(),
                    change,
                    id,
                }))
            }
            IndexChangeKind::Update => {
                // Semantic change in place: the id survives, data and
                // statistics do not. Compile first so a broken definition
                // leaves the old index untouched.
                let (id, _) = existing.expect("semantic update implies an existing definition");
                let transform = self.compiler.compile(name, &definition)?;
                let is_map_reduce = definition.is_map_reduce();

                self.storage.batch(&mut |acc| {
                    acc.delete_index(id);
                    acc.add_index(id, is_map_reduce);
                    Ok(())
                })?;
                self.context.clear_errors_for(name);
                self.inner.write().definitions.insert(
                    name.to_string(),
                    StoredDefinition {
                        id,
                        definition: definition.clone(),
                    },
                );

                let handle = match self.registry.get(id) {
                    Some(handle) => handle,
                    None => {
                        let handle = Arc::new(IndexHandle::new(id, name));
                        self.registry.register(Arc::clone(&handle));
                        handle
                    }
                };
                handle.set_transform(transform);
                handle.set_synced_touch_count(0);

                self.try_bootstrap(Arc::clone(&handle), &definition);
                self.context
                    .notify_work(format!("index rebuilt in place: {name}"));
                Ok(Some(PutIndexResult {
                    name: name.to_string(),
                    change,
                    id,
                }))
            }
            IndexChangeKind::Create => {
                let transform = self.compiler.compile(name, &definition)?;
                let is_map_reduce = definition.is_map_reduce();

                let id = {
                    let mut inner = self.inner.write();
                    let id = self.allocate_id(&inner);
                    inner.definitions.insert(
                        name.to_string(),
                        StoredDefinition {
                            id,
                            definition: definition.clone(),
                        },
                    );
                    id
                };
                self.storage.batch(&mut |acc| {
                    acc.add_index(id, is_map_reduce);
                    Ok(())
                })?;

                let handle = Arc::new(IndexHandle::new(id, name));
                handle.set_transform(transform);
                self.registry.register(Arc::clone(&handle));

                self.try_bootstrap(Arc::clone(&handle), &definition);
                self.context.notify_work(format!("index created: {name}"));
                Ok(Some(PutIndexResult {
                    name: name.to_string(),
                    change,
                    id,
                }))
            }
        }
    }

    fn delete_index_locked(&self, name: &str) -> Result<IndexId> {
        let stored = self
            .inner
            .write()
            .definitions
            .remove(name)
            .ok_or_else(|| EngineError::IndexDoesNotExist(name.to_string()))?;
        let id = stored.id;

        // Synchronous part: make the index invisible and mark its data for
        // deletion. The marker survives a crash, so a restart can resume the
        // cleanup.
        self.storage.batch(&mut |acc| {
            acc.prepare_index_for_deletion(id);
            acc.delete_document(&replacement_marker_key(name));
            Ok(())
        })?;
        self.context.clear_errors_for(name);
        if let Some(handle) = self.registry.remove(id) {
            handle.clear_transform();
        }
        self.context.notify_work(format!("index deleted: {name}"));

        // The bulk data deletion runs as a tracked background task.
        self.spawn_index_data_deletion(name.to_string(), id);
        Ok(id)
    }

    fn spawn_index_data_deletion(&self, name: String, id: IndexId) -> TaskId {
        let token = self.context.cancellation_token().child_token();
        let task_id = self
            .tasks
            .register(format!("delete index data: {name}"), token.clone());

        let storage = Arc::clone(&self.storage);
        let tasks = Arc::clone(&self.tasks);
        let task = self.scheduler.spawn_background_with_token(token, move |token| {
            tasks.mark_running(task_id);
            if token.is_cancelled() {
                tasks.mark_cancelled(task_id);
                return Ok(());
            }
            match storage.batch(&mut |acc| {
                acc.delete_index(id);
                acc.clear_pending_deletion(id);
                Ok(())
            }) {
                Ok(()) => {
                    tracing::debug!(
                        target = "vellum.catalog",
                        index = %name,
                        "index data deleted"
                    );
                    tasks.mark_completed(task_id);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "vellum.catalog",
                        index = %name,
                        error = %err,
                        "failed to delete index data"
                    );
                    tasks.mark_faulted(task_id, err.to_string());
                }
            }
            Ok(())
        });
        // Tracked through the registry; the task handle itself is not awaited.
        drop(task);
        task_id
    }

    /// Attempt the new-index bootstrap: seed the index from the
    /// full-collection catalog index in one precomputed batch instead of
    /// walking the whole document log. Every failure mode degrades to
    /// ordinary indexing; this is an optimization, never a requirement.
    fn try_bootstrap(&self, handle: Arc<IndexHandle>, definition: &IndexDefinition) {
        let name = handle.name();
        if name == COLLECTION_CATALOG_INDEX {
            return;
        }
        if definition.collections.is_empty() || definition.is_map_reduce() {
            return;
        }
        if !handle.has_transform() {
            return;
        }
        if !self
            .inner
            .read()
            .definitions
            .contains_key(COLLECTION_CATALOG_INDEX)
        {
            tracing::debug!(
                target = "vellum.catalog",
                index = %name,
                "bootstrap skipped: no collection catalog index"
            );
            return;
        }
        if self
            .bootstrap_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(
                target = "vellum.catalog",
                index = %name,
                "bootstrap already in flight; falling back to ordinary indexing"
            );
            return;
        }

        let max_docs = if definition.is_test_index {
            self.config.max_test_index_batch_size
        } else {
            self.config.max_precomputed_batch_size
        };
        let collections = definition.collections.clone();
        let id = handle.id();

        // Suppresses normal scheduling until the bootstrap settles, one way
        // or the other.
        handle.set_map_indexing_in_progress(true);

        let token = self.context.cancellation_token().child_token();
        let task_id = self
            .tasks
            .register(format!("bootstrap index: {name}"), token.clone());

        let storage = Arc::clone(&self.storage);
        let batch_executor = Arc::clone(&self.batch_executor);
        let context = Arc::clone(&self.context);
        let tasks = Arc::clone(&self.tasks);
        let in_flight = Arc::clone(&self.bootstrap_in_flight);

        let task = self.scheduler.spawn_background_with_token(token, move |token| {
            tasks.mark_running(task_id);
            let outcome = run_bootstrap(
                &token,
                &storage,
                batch_executor.as_ref(),
                id,
                &collections,
                max_docs,
            );
            handle.set_map_indexing_in_progress(false);
            in_flight.store(false, Ordering::SeqCst);

            match outcome {
                Ok(true) => {
                    tasks.mark_completed(task_id);
                    context.notify_work(format!("index bootstrapped from collection catalog: {name}"));
                }
                Ok(false) => {
                    tasks.mark_completed(task_id);
                    context.notify_work(format!(
                        "bootstrap not applicable, ordinary indexing takes over: {name}"
                    ));
                }
                Err(EngineError::Cancelled) => {
                    tasks.mark_cancelled(task_id);
                }
                Err(err) => {
                    tracing::warn!(
                        target = "vellum.catalog",
                        index = %name,
                        error = %err,
                        "bootstrap failed; ordinary indexing takes over"
                    );
                    tasks.mark_faulted(task_id, err.to_string());
                    context.notify_work(format!("bootstrap failed for index: {name}"));
                }
            }
            Ok(())
        });
        drop(task);
    }

    /// Hand out the next index id. Ids are never reused; the counter should
    /// never collide with a live definition, but ids are forever, so
    /// re-validate before committing to one.
    fn allocate_id(&self, inner: &CatalogInner) -> IndexId {
        loop {
            let candidate = IndexId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
            let in_use = inner
                .definitions
                .values()
                .any(|stored| stored.id == candidate);
            if !in_use {
                return candidate;
            }
            tracing::warn!(
                target = "vellum.catalog",
                id = %candidate,
                "allocated index id already in use; skipping"
            );
        }
    }
}

/// The bootstrap body, separated out so the spawned closure stays readable.
/// Returns whether a batch was applied.
fn run_bootstrap(
    token: &vellum_scheduler::CancellationToken,
    storage: &Arc<dyn TransactionalStorage>,
    batch_executor: &dyn BatchExecutor,
    id: IndexId,
    collections: &std::collections::BTreeSet<String>,
    max_docs: usize,
) -> Result<bool> {
    if token.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    // Ask for one document more than the budget: a full `max_docs + 1` answer
    // means the collections are too large to seed in one batch.
    let documents =
        storage.batch_read(|acc| Ok(acc.documents_by_collection(collections, max_docs + 1)))?;
    if documents.is_empty() || documents.len() > max_docs {
        return Ok(false);
    }
    if token.is_cancelled() {
        return Err(EngineError::Cancelled);
    }

    let highest_etag = documents
        .iter()
        .map(|doc| doc.etag)
        .max()
        .unwrap_or_default();
    let last_modified = documents
        .iter()
        .map(|doc| doc.modified)
        .max()
        .unwrap_or_else(SystemTime::now);

    batch_executor.execute_precomputed(PrecomputedBatch {
        index: id,
        documents,
        highest_etag,
        last_modified,
        // Everything in the batch is a logical insert for this brand-new
        // index; there is nothing to delete.
        skip_deletions: true,
    })?;
    Ok(true)
}

fn side_by_side_name(original: &str) -> String {
    format!("{SIDE_BY_SIDE_PREFIX}{original}")
}

fn replacement_marker_key(original: &str) -> String {
    format!("Catalog/Replace/{original}")
}

fn validate_index_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| EngineError::InvalidIndexName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    let lowered = name.to_ascii_lowercase();
    if lowered == RESERVED_DYNAMIC || lowered.starts_with("dynamic/") {
        return Err(invalid("'dynamic' is reserved for ad-hoc query indexes"));
    }
    if name.contains("//") {
        return Err(invalid("name must not contain double slashes"));
    }
    Ok(())
}
