use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::config::IndexingConfig;

/// Feedback controller for the per-pass batch size.
///
/// Shrinks aggressively (halving) when the loop hits resource exhaustion and
/// grows back cautiously (one additive step after a run of full, successful
/// batches). Never leaves the configured [min, max] band.
pub struct BatchSizeTuner {
    current: AtomicUsize,
    min: usize,
    max: usize,
    growth_step: usize,
    growth_after: u32,
    full_streak: AtomicU32,
}

impl BatchSizeTuner {
    pub fn new(config: &IndexingConfig) -> Self {
        let min = config.min_batch_size.max(1);
        let max = config.max_batch_size.max(min);
        Self {
            current: AtomicUsize::new(config.initial_batch_size.clamp(min, max)),
            min,
            max,
            growth_step: min,
            growth_after: config.tuner_growth_batches.max(1),
            full_streak: AtomicU32::new(0),
        }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Record a completed batch. Only full batches count towards growth: a
    /// partial batch means the backlog is small and growing would be noise.
    pub fn record_success(&self, batch_was_full: bool) {
        if !batch_was_full {
            self.full_streak.store(0, Ordering::SeqCst);
            return;
        }
        let streak = self.full_streak.fetch_add(1, Ordering::SeqCst) + 1;
        if streak < self.growth_after {
            return;
        }
        self.full_streak.store(0, Ordering::SeqCst);
        let grown = (self.current() + self.growth_step).min(self.max);
        self.current.store(grown, Ordering::SeqCst);
    }

    /// Back off after resource exhaustion: halve, floored at the minimum.
    pub fn shrink(&self) {
        self.full_streak.store(0, Ordering::SeqCst);
        let shrunk = (self.current() / 2).max(self.min);
        self.current.store(shrunk, Ordering::SeqCst);
    }
}
