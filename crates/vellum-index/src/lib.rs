//! Background index-maintenance engine for Vellum databases.
//!
//! The engine keeps secondary indexes consistent with an ever-changing
//! document store without blocking writers and without rescanning everything
//! on every change. It is built from four pieces:
//!
//! - [`WorkContext`]: per-database coordination state writers use to wake the
//!   sleeping indexing loop without missed-wakeup races.
//! - [`IndexingExecutor`]: the long-running loop that discovers stale indexes
//!   and drives their execution.
//! - [`IndexCatalog`]: index definition lifecycle, including the new-index
//!   bootstrap that seeds a fresh index from the collection catalog index
//!   instead of a linear document scan.
//! - [`FaultTolerantBatch`]: the enumeration primitive that skips individual
//!   failing documents instead of aborting a whole batch.
//!
//! The HTTP surface, on-disk formats, query evaluation and the map/reduce
//! compiler are external collaborators reached through the traits in
//! [`storage`] and [`DocumentTransform`].

mod catalog;
mod config;
mod context;
mod definitions;
mod enumerator;
mod error;
mod executor;
mod prefetch;
mod registry;
pub mod storage;
mod tuner;

pub use catalog::{
    IndexCatalog, IndexChangeKind, IndexingGuard, PutIndexResult, COLLECTION_CATALOG_INDEX,
    SIDE_BY_SIDE_PREFIX,
};
pub use config::IndexingConfig;
pub use context::{IndexingError, NestedReasonsScope, WorkContext};
pub use definitions::{
    Document, DocumentTransform, IndexDefinition, IndexEntry, IndexEtag, IndexLockMode,
    IndexPriority, IndexStats, PrecomputedBatch, TransformCompiler, TransformError,
};
pub use enumerator::{FaultTolerantBatch, PassHooks};
pub use error::{EngineError, Result};
pub use executor::{BatchExecutor, ExecutorState, IndexingExecutor, MapExecutor, StaleIndex};
pub use prefetch::PrefetchCache;
pub use registry::{IndexHandle, IndexRegistry};
pub use tuner::BatchSizeTuner;
