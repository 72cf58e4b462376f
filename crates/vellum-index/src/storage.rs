//! Collaborator interfaces between the indexing engine and the storage layer,
//! plus an in-memory reference implementation.
//!
//! The engine never touches pages or B-trees; everything goes through one
//! atomic [`StorageAccessor`] scope per batch, so staleness decisions are
//! always made against a consistent snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::context::IndexingError;
use crate::definitions::{Document, IndexEntry, IndexPriority, IndexStats};
use crate::error::{EngineError, Result};
use vellum_core::{Etag, IndexId};

/// Storage-backed housekeeping work drained by the scheduler loop between
/// indexing passes (at most a bounded number per iteration).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MaintenanceTask {
    /// Finish removing deleted documents' entries from an index.
    RemoveFromIndex { index: IndexId, doc_keys: Vec<String> },
    /// Touch-propagation: bump a referencing document so the indexes covering
    /// it re-process it on the next pass.
    TouchDocument { key: String },
}

/// One atomic view of index metadata and document state.
///
/// Everything read through a single accessor is mutually consistent;
/// everything written commits together when the batch ends.
pub trait StorageAccessor {
    // Index metadata.
    fn index_stats(&self) -> Vec<IndexStats>;
    fn stats_for(&self, id: IndexId) -> Option<IndexStats>;
    fn failure_rate(&self, id: IndexId) -> f32;
    fn set_priority(&mut self, ids: &[IndexId], priority: IndexPriority);
    fn add_index(&mut self, id: IndexId, is_map_reduce: bool);
    fn delete_index(&mut self, id: IndexId);
    fn prepare_index_for_deletion(&mut self, id: IndexId);
    fn clear_pending_deletion(&mut self, id: IndexId);
    fn pending_index_deletions(&self) -> Vec<IndexId>;
    fn touch_index_etag(&mut self, id: IndexId);
    fn update_last_indexed(&mut self, id: IndexId, etag: Etag, at: SystemTime);
    fn record_indexing_attempts(&mut self, id: IndexId, attempts: u64, errors: u64);

    // Documents.
    fn last_document_etag(&self) -> Etag;
    fn write_sequence(&self) -> u64;
    fn documents_after(&self, etag: Etag, limit: usize) -> Vec<Document>;
    /// Query the full-collection catalog index restricted to the given
    /// collection tags, in etag order. Used by the new-index bootstrap.
    fn documents_by_collection(&self, collections: &BTreeSet<String>, limit: usize)
        -> Vec<Document>;
    fn touch_document(&mut self, key: &str);
    fn delete_document(&mut self, key: &str) -> bool;

    // Index data.
    fn store_entries(&mut self, id: IndexId, entries: &[IndexEntry]);
    fn remove_entries_for(&mut self, id: IndexId, doc_key: &str);
    fn entries_for(&self, id: IndexId) -> Vec<IndexEntry>;

    // Indexing-error mirror.
    fn persist_error(&mut self, error: &IndexingError);
    fn clear_errors_for(&mut self, index: &str);

    // Maintenance queue.
    fn enqueue_maintenance(&mut self, task: MaintenanceTask);
    fn next_maintenance_task(&mut self) -> Option<MaintenanceTask>;

    /// Flush any dirty in-memory index buffers to durable storage.
    fn flush_index_buffers(&mut self);
}

/// The transactional storage collaborator. One batch, one snapshot.
pub trait TransactionalStorage: Send + Sync {
    fn batch(&self, work: &mut dyn FnMut(&mut dyn StorageAccessor) -> Result<()>) -> Result<()>;
}

/// Convenience over the dyn-safe [`TransactionalStorage::batch`] for callers
/// that want a value out of the batch.
pub trait TransactionalStorageExt: TransactionalStorage {
    fn batch_read<R>(
        &self,
        f: impl FnOnce(&mut dyn StorageAccessor) -> Result<R>,
    ) -> Result<R> {
        let mut f = Some(f);
        let mut out = None;
        self.batch(&mut |acc| {
            let f = f.take().expect("batch closure runs once");
            out = Some(f(acc)?);
            Ok(())
        })?;
        out.ok_or_else(|| EngineError::Storage("batch did not run".to_string()))
    }
}

impl<T: TransactionalStorage + ?Sized> TransactionalStorageExt for T {}

#[derive(Default)]
struct World {
    docs_by_etag: BTreeMap<u64, Document>,
    etag_by_key: HashMap<String, u64>,
    next_etag: u64,
    write_sequence: u64,
    stats: BTreeMap<IndexId, IndexStats>,
    entries: HashMap<IndexId, Vec<IndexEntry>>,
    pending_deletions: BTreeSet<IndexId>,
    errors: Vec<IndexingError>,
    tasks: VecDeque<MaintenanceTask>,
    flushes: u64,
}

impl World {
    fn assign_etag(&mut self) -> u64 {
        self.next_etag += 1;
        self.write_sequence += 1;
        self.next_etag
    }
}

/// In-memory [`TransactionalStorage`]: a single mutex-guarded world. Used by
/// the engine's tests and by embedders that do not persist.
#[derive(Default)]
pub struct MemoryStorage {
    world: Mutex<World>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document, assigning it the next etag. Returns the etag so the
    /// caller can notify the work context with it.
    pub fn put_document(
        &self,
        key: impl Into<String>,
        collection: Option<&str>,
        data: serde_json::Value,
    ) -> Etag {
        let key = key.into();
        let mut world = self.world.lock();
        if let Some(old) = world.etag_by_key.remove(&key) {
            world.docs_by_etag.remove(&old);
        }
        let etag = world.assign_etag();
        world.etag_by_key.insert(key.clone(), etag);
        world.docs_by_etag.insert(
            etag,
            Document {
                key,
                etag: Etag::new(etag),
                collection: collection.map(str::to_string),
                modified: SystemTime::now(),
                data,
            },
        );
        Etag::new(etag)
    }

    pub fn document(&self, key: &str) -> Option<Document> {
        let world = self.world.lock();
        let etag = *world.etag_by_key.get(key)?;
        world.docs_by_etag.get(&etag).cloned()
    }

    /// Test observability: how often the engine asked for a buffer flush.
    pub fn flush_count(&self) -> u64 {
        self.world.lock().flushes
    }

    pub fn persisted_error_count(&self) -> usize {
        self.world.lock().errors.len()
    }

    pub fn enqueue_task(&self, task: MaintenanceTask) {
        self.world.lock().tasks.push_back(task);
    }
}

impl TransactionalStorage for MemoryStorage {
    fn batch(&self, work: &mut dyn FnMut(&mut dyn StorageAccessor) -> Result<()>) -> Result<()> {
        let mut world = self.world.lock();
        work(&mut *world)
    }
}

impl StorageAccessor for World {
    fn index_stats(&self) -> Vec<IndexStats> {
        self.stats.values().cloned().collect()
    }

    fn stats_for(&self, id: IndexId) -> Option<IndexStats> {
        self.stats.get(&id).cloned()
    }

    fn failure_rate(&self, id: IndexId) -> f32 {
        self.stats.get(&id).map_or(0.0, IndexStats::failure_rate)
    }

    fn set_priority(&mut self, ids: &[IndexId], priority: IndexPriority) {
        for id in ids {
            if let Some(stats) = self.stats.get_mut(id) {
                stats.priority = priority;
            }
        }
    }

    fn add_index(&mut self, id: IndexId, is_map_reduce: bool) {
        self.stats.insert(id, IndexStats::new(id, is_map_reduce));
        self.entries.insert(id, Vec::new());
    }

    fn delete_index(&mut self, id: IndexId) {
        self.stats.remove(&id);
        self.entries.remove(&id);
    }

    fn prepare_index_for_deletion(&mut self, id: IndexId) {
        self.pending_deletions.insert(id);
    }

    fn clear_pending_deletion(&mut self, id: IndexId) {
        self.pending_deletions.remove(&id);
    }

    fn pending_index_deletions(&self) -> Vec<IndexId> {
        self.pending_deletions.iter().copied().collect()
    }

    fn touch_index_etag(&mut self, id: IndexId) {
        if let Some(stats) = self.stats.get_mut(&id) {
            stats.touch_count += 1;
        }
    }

    fn update_last_indexed(&mut self, id: IndexId, etag: Etag, _at: SystemTime) {
        if let Some(stats) = self.stats.get_mut(&id) {
            // Cursors only move forward.
            if etag > stats.last_indexed_etag {
                stats.last_indexed_etag = etag;
            }
        }
    }

    fn record_indexing_attempts(&mut self, id: IndexId, attempts: u64, errors: u64) {
        if let Some(stats) = self.stats.get_mut(&id) {
            stats.indexing_attempts += attempts;
            stats.indexing_errors += errors;
        }
    }

    fn last_document_etag(&self) -> Etag {
        Etag::new(self.next_etag)
    }

    fn write_sequence(&self) -> u64 {
        self.write_sequence
    }

    fn documents_after(&self, etag: Etag, limit: usize) -> Vec<Document> {
        self.docs_by_etag
            .range(etag.raw() + 1..)
            .take(limit)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    fn documents_by_collection(
        &self,
        collections: &BTreeSet<String>,
        limit: usize,
    ) -> Vec<Document> {
        self.docs_by_etag
            .values()
            .filter(|doc| {
                doc.collection
                    .as_ref()
                    .is_some_and(|c| collections.contains(c))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    fn touch_document(&mut self, key: &str) {
        let Some(old_etag) = self.etag_by_key.get(key).copied() else {
            return;
        };
        let Some(mut doc) = self.docs_by_etag.remove(&old_etag) else {
            return;
        };
        let etag = self.assign_etag();
        doc.etag = Etag::new(etag);
        self.etag_by_key.insert(doc.key.clone(), etag);
        self.docs_by_etag.insert(etag, doc);
    }

    fn delete_document(&mut self, key: &str) -> bool {
        let Some(etag) = self.etag_by_key.remove(key) else {
            return false;
        };
        self.docs_by_etag.remove(&etag);
        self.write_sequence += 1;
        true
    }

    fn store_entries(&mut self, id: IndexId, entries: &[IndexEntry]) {
        self.entries
            .entry(id)
            .or_default()
            .extend_from_slice(entries);
    }

    fn remove_entries_for(&mut self, id: IndexId, doc_key: &str) {
        if let Some(entries) = self.entries.get_mut(&id) {
            entries.retain(|entry| entry.doc_key != doc_key);
        }
    }

    fn entries_for(&self, id: IndexId) -> Vec<IndexEntry> {
        self.entries.get(&id).cloned().unwrap_or_default()
    }

    fn persist_error(&mut self, error: &IndexingError) {
        self.errors.push(error.clone());
    }

    fn clear_errors_for(&mut self, index: &str) {
        self.errors.retain(|error| error.index != index);
    }

    fn enqueue_maintenance(&mut self, task: MaintenanceTask) {
        self.tasks.push_back(task);
    }

    fn next_maintenance_task(&mut self) -> Option<MaintenanceTask> {
        self.tasks.pop_front()
    }

    fn flush_index_buffers(&mut self) {
        self.flushes += 1;
    }
}
