//! Shared fixture: a fully wired engine over in-memory storage, plus a tiny
//! transform "compiler" driven by the map source text.
//!
//! Compiler conventions used across the suite:
//! - `"field:<name>"` emits one entry per document with that JSON field
//! - `"fail:<doc key>"` fails for exactly that document
//! - `"fail-all"` fails for every document
//! - `"fail-compile"` fails compilation itself

use std::sync::Arc;
use std::time::{Duration, Instant};

use vellum_core::Etag;
use vellum_index::storage::{MemoryStorage, TransactionalStorage, TransactionalStorageExt};
use vellum_index::{
    BatchExecutor, BatchSizeTuner, Document, DocumentTransform, IndexCatalog, IndexDefinition,
    IndexEntry, IndexRegistry, IndexingConfig, IndexingExecutor, MapExecutor, PrefetchCache,
    TransformCompiler, TransformError, WorkContext,
};
use vellum_scheduler::{BackgroundTaskRegistry, Scheduler};

/// The fully wired engine over an arbitrary [`TransactionalStorage`], for
/// tests that inject their own storage (e.g. failure injection).
pub struct EngineParts {
    pub context: Arc<WorkContext>,
    pub registry: Arc<IndexRegistry>,
    pub catalog: Arc<IndexCatalog>,
    pub executor: Arc<IndexingExecutor>,
}

pub fn build_engine(storage: Arc<dyn TransactionalStorage>, config: IndexingConfig) -> EngineParts {
    let context = Arc::new(WorkContext::new(Arc::clone(&storage)));
    context.start();

    let registry = Arc::new(IndexRegistry::new());
    let tuner = Arc::new(BatchSizeTuner::new(&config));
    let prefetcher = Arc::new(PrefetchCache::new(config.max_batch_size));

    let map_executor: Arc<dyn BatchExecutor> = Arc::new(MapExecutor::new(
        Arc::clone(&context),
        Arc::clone(&storage),
        Arc::clone(&registry),
        Arc::clone(&prefetcher),
        Arc::clone(&tuner),
    ));

    let catalog = Arc::new(IndexCatalog::new(
        Arc::clone(&storage),
        Arc::clone(&registry),
        Arc::clone(&context),
        Scheduler::default(),
        Arc::new(BackgroundTaskRegistry::new()),
        test_compiler(),
        Arc::clone(&map_executor),
        config.clone(),
    ));

    let executor = Arc::new(IndexingExecutor::new(
        Arc::clone(&context),
        storage,
        Arc::clone(&registry),
        Arc::clone(&catalog),
        map_executor,
        config,
        tuner,
        prefetcher,
    ));

    EngineParts {
        context,
        registry,
        catalog,
        executor,
    }
}

pub struct EngineHarness {
    pub storage: Arc<MemoryStorage>,
    pub context: Arc<WorkContext>,
    pub registry: Arc<IndexRegistry>,
    pub catalog: Arc<IndexCatalog>,
    pub executor: Arc<IndexingExecutor>,
}

impl EngineHarness {
    pub fn new() -> Self {
        Self::with_config(IndexingConfig::default())
    }

    pub fn with_config(config: IndexingConfig) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let parts = build_engine(Arc::clone(&storage) as _, config);
        Self {
            storage,
            context: parts.context,
            registry: parts.registry,
            catalog: parts.catalog,
            executor: parts.executor,
        }
    }

    pub fn put_doc(&self, key: &str, collection: &str, data: serde_json::Value) -> Etag {
        let etag = self.storage.put_document(key, Some(collection), data);
        self.context.notify_work(format!("document written: {key}"));
        etag
    }

    pub fn entries(&self, id: vellum_core::IndexId) -> Vec<IndexEntry> {
        self.storage
            .batch_read(|acc| Ok(acc.entries_for(id)))
            .expect("in-memory batch never fails")
    }

    pub fn stats(&self, id: vellum_core::IndexId) -> Option<vellum_index::IndexStats> {
        self.storage
            .batch_read(|acc| Ok(acc.stats_for(id)))
            .expect("in-memory batch never fails")
    }
}

pub fn map_def(source: &str, collections: &[&str]) -> IndexDefinition {
    IndexDefinition::map(source).with_collections(collections.iter().copied())
}

fn test_compiler() -> Arc<dyn TransformCompiler> {
    Arc::new(
        |_name: &str, definition: &IndexDefinition| -> Result<Arc<dyn DocumentTransform>, TransformError> {
            let source = definition.maps.first().cloned().unwrap_or_default();
            if source == "fail-compile" {
                return Err(TransformError::new("deliberately broken definition"));
            }
            let transform: Arc<dyn DocumentTransform> = Arc::new(move |doc: &Document| {
                if source == "fail-all" {
                    return Err(TransformError::new("transform rejects every document"));
                }
                if let Some(poisoned) = source.strip_prefix("fail:") {
                    if doc.key == poisoned {
                        return Err(TransformError::new("poisoned document"));
                    }
                }
                let field = source.strip_prefix("field:").unwrap_or("value");
                let value = doc
                    .data
                    .get(field)
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                Ok(vec![IndexEntry {
                    doc_key: doc.key.clone(),
                    field: field.to_string(),
                    value,
                }])
            });
            Ok(transform)
        },
    )
}

/// Poll `cond` until it holds or `timeout` elapses; returns the final answer.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return cond();
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
