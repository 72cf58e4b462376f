use thiserror::Error;

use crate::definitions::TransformError;
use vellum_scheduler::Cancelled;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine-level failure taxonomy.
///
/// The scheduler loop treats these very differently: `Cancelled` terminates
/// the loop, `ResourceExhausted` shrinks future batches and retries, anything
/// else is logged and retried promptly.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("indexing was cancelled")]
    Cancelled,

    #[error("resource exhaustion while indexing")]
    ResourceExhausted,

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("invalid index name '{name}': {reason}")]
    InvalidIndexName { name: String, reason: String },

    #[error("index '{0}' is locked and cannot be modified")]
    IndexLocked(String),

    #[error("index '{0}' does not exist")]
    IndexDoesNotExist(String),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl From<Cancelled> for EngineError {
    fn from(_: Cancelled) -> Self {
        EngineError::Cancelled
    }
}
