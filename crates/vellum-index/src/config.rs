use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Externally supplied tuning knobs for the indexing engine.
///
/// Embedders usually deserialize this from the database settings document;
/// every field has a serving default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct IndexingConfig {
    /// Ceiling for the auto-tuned per-pass batch size.
    pub max_batch_size: usize,
    /// Batch size the tuner starts from.
    pub initial_batch_size: usize,
    /// Floor the tuner shrinks towards under memory pressure.
    pub min_batch_size: usize,
    /// Largest result set the new-index bootstrap will precompute; above this
    /// the optimization aborts and ordinary incremental indexing takes over.
    pub max_precomputed_batch_size: usize,
    /// Bootstrap budget for test indexes, which are meant to be cheap.
    pub max_test_index_batch_size: usize,
    /// How long the scheduler loop sleeps in `wait_for_work` before running
    /// periodic housekeeping anyway.
    pub idle_wait: Duration,
    /// An index whose rolling failure rate crosses this is marked invalid and
    /// skipped until an operator resets it.
    pub failure_rate_threshold: f32,
    /// Consecutive full successful batches before the tuner grows the batch
    /// size again.
    pub tuner_growth_batches: u32,
    /// Upper bound on maintenance tasks drained per loop iteration so long
    /// indexing runs cannot starve housekeeping, and vice versa.
    pub max_maintenance_tasks_per_pass: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 4096,
            initial_batch_size: 512,
            min_batch_size: 64,
            max_precomputed_batch_size: 16384,
            max_test_index_batch_size: 512,
            idle_wait: Duration::from_secs(10),
            failure_rate_threshold: 0.15,
            tuner_growth_batches: 4,
            max_maintenance_tasks_per_pass: 32,
        }
    }
}

impl IndexingConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}
