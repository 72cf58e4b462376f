use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::definitions::{DocumentTransform, IndexPriority};
use vellum_core::IndexId;

/// Live, mutable handle for one index instance.
///
/// The catalog owns definitions; this is the runtime side: the compiled
/// transform, the live priority, and the flag that suppresses normal
/// scheduling while a bootstrap is feeding the index.
pub struct IndexHandle {
    id: IndexId,
    name: RwLock<String>,
    priority: Mutex<IndexPriority>,
    map_indexing_in_progress: AtomicBool,
    transform: RwLock<Option<Arc<dyn DocumentTransform>>>,
    /// Touch count last observed by a completed indexing pass; a storage-side
    /// touch count above this is a dirty signal.
    synced_touch_count: AtomicU64,
}

impl IndexHandle {
    pub fn new(id: IndexId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: RwLock::new(name.into()),
            priority: Mutex::new(IndexPriority::Normal),
            map_indexing_in_progress: AtomicBool::new(false),
            transform: RwLock::new(None),
            synced_touch_count: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn rename(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn priority(&self) -> IndexPriority {
        *self.priority.lock()
    }

    pub fn set_priority(&self, priority: IndexPriority) {
        *self.priority.lock() = priority;
    }

    /// Automatic priority change; refuses to override an operator pin.
    pub fn demote_unless_forced(&self, priority: IndexPriority) -> bool {
        let mut current = self.priority.lock();
        if current.is_forced() {
            return false;
        }
        *current = priority;
        true
    }

    pub fn map_indexing_in_progress(&self) -> bool {
        self.map_indexing_in_progress.load(Ordering::SeqCst)
    }

    pub fn set_map_indexing_in_progress(&self, value: bool) {
        self.map_indexing_in_progress.store(value, Ordering::SeqCst);
    }

    pub fn transform(&self) -> Option<Arc<dyn DocumentTransform>> {
        self.transform.read().clone()
    }

    pub fn has_transform(&self) -> bool {
        self.transform.read().is_some()
    }

    pub fn set_transform(&self, transform: Arc<dyn DocumentTransform>) {
        *self.transform.write() = Some(transform);
    }

    pub fn clear_transform(&self) {
        *self.transform.write() = None;
    }

    pub fn synced_touch_count(&self) -> u64 {
        self.synced_touch_count.load(Ordering::SeqCst)
    }

    pub fn set_synced_touch_count(&self, value: u64) {
        self.synced_touch_count.store(value, Ordering::SeqCst);
    }
}

/// Resolves numeric index ids to live handles.
#[derive(Default)]
pub struct IndexRegistry {
    inner: RwLock<BTreeMap<IndexId, Arc<IndexHandle>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<IndexHandle>) {
        self.inner.write().insert(handle.id(), handle);
    }

    pub fn get(&self, id: IndexId) -> Option<Arc<IndexHandle>> {
        self.inner.read().get(&id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<IndexHandle>> {
        self.inner
            .read()
            .values()
            .find(|handle| handle.name() == name)
            .cloned()
    }

    pub fn remove(&self, id: IndexId) -> Option<Arc<IndexHandle>> {
        self.inner.write().remove(&id)
    }

    pub fn ids(&self) -> Vec<IndexId> {
        self.inner.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
