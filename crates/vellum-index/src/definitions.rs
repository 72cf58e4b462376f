use std::collections::BTreeSet;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use vellum_core::{Etag, IndexId};

/// A stored document as the indexing engine sees it: identity, version stamp,
/// collection tag and raw body. The body stays opaque JSON; only transforms
/// interpret it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub etag: Etag,
    /// Collection ("entity name") tag, `None` for untagged system documents.
    pub collection: Option<String>,
    pub modified: SystemTime,
    pub data: serde_json::Value,
}

/// One field emitted into an index for one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub doc_key: String,
    pub field: String,
    pub value: String,
}

/// Failure of a per-document transform. These are isolated by the
/// fault-tolerant enumerator and never abort a batch on their own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transform failed: {message}")]
pub struct TransformError {
    pub message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The executable produced by compiling an index definition.
///
/// Compilation itself is an external collaborator; the engine only ever calls
/// the compiled artifact through this capability interface.
pub trait DocumentTransform: Send + Sync {
    fn apply(&self, doc: &Document) -> std::result::Result<Vec<IndexEntry>, TransformError>;
}

impl<F> DocumentTransform for F
where
    F: Fn(&Document) -> std::result::Result<Vec<IndexEntry>, TransformError> + Send + Sync,
{
    fn apply(&self, doc: &Document) -> std::result::Result<Vec<IndexEntry>, TransformError> {
        self(doc)
    }
}

/// External compiler turning definition source text into an executable
/// transform. Compilation failures surface synchronously from the catalog's
/// put operations, before anything is registered.
pub trait TransformCompiler: Send + Sync {
    fn compile(
        &self,
        name: &str,
        definition: &IndexDefinition,
    ) -> std::result::Result<std::sync::Arc<dyn DocumentTransform>, TransformError>;
}

impl<F> TransformCompiler for F
where
    F: Fn(
            &str,
            &IndexDefinition,
        ) -> std::result::Result<std::sync::Arc<dyn DocumentTransform>, TransformError>
        + Send
        + Sync,
{
    fn compile(
        &self,
        name: &str,
        definition: &IndexDefinition,
    ) -> std::result::Result<std::sync::Arc<dyn DocumentTransform>, TransformError> {
        self(name, definition)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexPriority {
    #[default]
    Normal,
    /// Only processed during idle sweeps.
    Idle,
    /// Paused; skipped by the scheduler until re-enabled.
    Disabled,
    /// Chronically broken or unused; skipped and eligible for cleanup.
    Abandoned,
    /// Operator pin: like `Idle`, but automatic promotion must not override it.
    ForcedIdle,
    /// Operator pin: like `Normal`, but automatic demotion must not override it.
    ForcedNormal,
}

impl IndexPriority {
    /// Whether the scheduler should skip this index entirely.
    pub fn is_paused(self) -> bool {
        matches!(self, IndexPriority::Disabled | IndexPriority::Abandoned)
    }

    /// Whether an operator pinned this priority against automatic changes.
    pub fn is_forced(self) -> bool {
        matches!(self, IndexPriority::ForcedIdle | IndexPriority::ForcedNormal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndexLockMode {
    #[default]
    Unlocked,
    /// Definition changes are redirected to a side-by-side replacement index.
    SideBySide,
    /// Definition changes are silently ignored.
    LockedIgnore,
    /// Definition changes fail loudly.
    LockedError,
}

/// A secondary-index definition as accepted by the catalog.
///
/// `maps` and `reduce` carry the opaque source text the external compiler
/// turns into a [`DocumentTransform`]; the engine only hashes them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub maps: Vec<String>,
    #[serde(default)]
    pub reduce: Option<String>,
    /// Document collections the maps read from. Drives both staleness scoping
    /// and the new-index bootstrap; empty means "all documents".
    #[serde(default)]
    pub collections: BTreeSet<String>,
    #[serde(default)]
    pub lock_mode: IndexLockMode,
    /// Non-semantic configuration (stored-field options etc.). Changing only
    /// this does not require recompiling or rebuilding the index.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Test indexes get a much smaller bootstrap budget.
    #[serde(default)]
    pub is_test_index: bool,
}

impl IndexDefinition {
    pub fn map(source: impl Into<String>) -> Self {
        Self {
            maps: vec![source.into()],
            reduce: None,
            collections: BTreeSet::new(),
            lock_mode: IndexLockMode::Unlocked,
            metadata: serde_json::Value::Null,
            is_test_index: false,
        }
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_reduce(mut self, reduce: impl Into<String>) -> Self {
        self.reduce = Some(reduce.into());
        self
    }

    pub fn is_map_reduce(&self) -> bool {
        self.reduce.is_some()
    }

    /// Content hash of the semantic parts of the definition (maps, reduce,
    /// collections). Metadata and lock mode are deliberately excluded: they
    /// can change without invalidating compiled artifacts or indexed data.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for map in &self.maps {
            hasher.update(map.as_bytes());
            hasher.update(&[0]);
        }
        if let Some(reduce) = &self.reduce {
            hasher.update(b"reduce:");
            hasher.update(reduce.as_bytes());
        }
        for collection in &self.collections {
            hasher.update(b"from:");
            hasher.update(collection.as_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

/// Per-index bookkeeping owned by the storage collaborator and read on every
/// scheduling pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexStats {
    pub id: IndexId,
    pub last_indexed_etag: Etag,
    pub last_reduced_etag: Option<Etag>,
    /// Bumped whenever a document an index depends on is touched without its
    /// content changing (reference propagation). A changed touch count is an
    /// explicit dirty signal even when the etag cursor looks caught up.
    pub touch_count: u64,
    pub indexing_attempts: u64,
    pub indexing_errors: u64,
    pub is_map_reduce: bool,
    pub priority: IndexPriority,
}

impl IndexStats {
    pub fn new(id: IndexId, is_map_reduce: bool) -> Self {
        Self {
            id,
            last_indexed_etag: Etag::ZERO,
            last_reduced_etag: if is_map_reduce { Some(Etag::ZERO) } else { None },
            touch_count: 0,
            indexing_attempts: 0,
            indexing_errors: 0,
            is_map_reduce,
            priority: IndexPriority::Normal,
        }
    }

    /// Rolling failure ratio; 0.0 for an index that never attempted anything.
    pub fn failure_rate(&self) -> f32 {
        if self.indexing_attempts == 0 {
            return 0.0;
        }
        self.indexing_errors as f32 / self.indexing_attempts as f32
    }
}

/// One-shot batch produced by the new-index bootstrap: documents already known
/// to cover the index's collections up to `highest_etag`. Consumed exactly
/// once by the executor, then discarded.
#[derive(Clone, Debug)]
pub struct PrecomputedBatch {
    pub index: IndexId,
    pub documents: Vec<Document>,
    pub highest_etag: Etag,
    pub last_modified: SystemTime,
    /// All documents in the batch are logical inserts, so delete-from-index
    /// bookkeeping can be skipped wholesale.
    pub skip_deletions: bool,
}

/// Content fingerprint of an index, used for conditional-request caching.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexEtag([u8; 32]);

impl IndexEtag {
    /// Sentinel returned when a supplied previous etag no longer matches: any
    /// conditional cache comparing against it must miss.
    pub const INVALID: IndexEtag = IndexEtag([0xFF; 32]);

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::INVALID
    }
}

impl fmt::Debug for IndexEtag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexEtag({self})")
    }
}

impl fmt::Display for IndexEtag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
