use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::definitions::Document;
use vellum_core::Etag;

/// Cache of documents loaded by one indexing pass so that other indexes whose
/// cursors trail inside the same etag range can reuse the scan instead of
/// hitting storage again.
///
/// The cache tracks one contiguous coverage window `(from, to]`: a lookup is
/// only answered when the window provably contains *every* document in the
/// requested range, otherwise a stale answer could silently skip documents.
pub struct PrefetchCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<u64, Document>,
    /// Exclusive lower bound of the coverage window.
    from: u64,
    /// Inclusive upper bound of the coverage window.
    to: u64,
}

impl PrefetchCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record documents covering the contiguous etag range `(after, upto]`.
    /// A batch that does not extend the current window replaces it.
    pub fn insert_batch(&self, after: Etag, upto: Etag, docs: &[Document]) {
        let mut inner = self.inner.lock();
        if inner.docs.is_empty() || after.raw() != inner.to {
            inner.docs.clear();
            inner.from = after.raw();
        }
        for doc in docs {
            inner.docs.insert(doc.etag.raw(), doc.clone());
        }
        inner.to = upto.raw().max(inner.from);
        self.trim(&mut inner);
    }

    /// Documents with etag in `(cursor, ..]`, at most `limit`, but only when
    /// the coverage window starts at or before `cursor`. `None` means "go to
    /// storage".
    pub fn documents_after(&self, cursor: Etag, limit: usize) -> Option<Vec<Document>> {
        let inner = self.inner.lock();
        if inner.docs.is_empty() || cursor.raw() < inner.from || cursor.raw() >= inner.to {
            return None;
        }
        Some(
            inner
                .docs
                .range(cursor.raw() + 1..)
                .take(limit)
                .map(|(_, doc)| doc.clone())
                .collect(),
        )
    }

    /// Drop everything at or below `cursor`; those documents are behind every
    /// remaining consumer.
    pub fn prune_below(&self, cursor: Etag) {
        let mut inner = self.inner.lock();
        inner.docs = inner.docs.split_off(&(cursor.raw() + 1));
        inner.from = inner.from.max(cursor.raw());
        if inner.docs.is_empty() {
            inner.to = inner.from;
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.docs.clear();
        inner.from = 0;
        inner.to = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().docs.is_empty()
    }

    fn trim(&self, inner: &mut Inner) {
        while inner.docs.len() > self.capacity {
            let Some((&lowest, _)) = inner.docs.iter().next() else {
                break;
            };
            inner.docs.remove(&lowest);
            // The window shrinks from the bottom as entries fall out.
            inner.from = lowest;
        }
    }
}
