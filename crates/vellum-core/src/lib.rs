//! Core shared types for Vellum.
//!
//! This crate is intentionally small.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque, monotonically comparable version stamp attached to documents and
/// indexes.
///
/// Etags are totally ordered per database: every committed write receives an
/// etag strictly greater than any previously assigned one. An index whose
/// last-indexed etag trails the most recent document etag is *stale*.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Etag(u64);

impl Etag {
    /// Sentinel for "nothing indexed yet" / "no writes yet".
    pub const ZERO: Etag = Etag(0);

    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The next etag in sequence. Only the storage layer should mint etags;
    /// this exists for allocators, not for consumers.
    #[inline]
    #[must_use]
    pub const fn incremented(self) -> Self {
        Self(self.0 + 1)
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Numeric identity of an index.
///
/// Assigned once, monotonically, by the index catalog; never reused, even
/// after the index is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId(u32);

impl IndexId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Best-effort stringification of a panic payload for logging.
pub fn panic_payload_to_str(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
