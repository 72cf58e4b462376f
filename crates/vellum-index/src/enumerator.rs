//! Fault-isolating enumeration: run a per-document transform over a batch so
//! that one failing document drops out of the batch instead of aborting it.

use vellum_scheduler::CancellationToken;

use crate::definitions::TransformError;

/// Hooks threaded through one enumeration pass.
///
/// All hooks are optional; `cancel` is checked before every advance and never
/// counts against the error budget.
pub struct PassHooks<'a, D> {
    pub cancel: Option<&'a CancellationToken>,
    /// Runs before each input advance; used for batch pacing.
    pub before_advance: Option<Box<dyn FnMut() + 'a>>,
    /// Receives the error and the last *successfully* transformed document,
    /// for attribution in the error log.
    pub on_error: Option<Box<dyn FnMut(&TransformError, Option<&D>) + 'a>>,
    /// Runs once when the input is exhausted. End-of-input is not an error.
    pub on_complete: Option<Box<dyn FnMut() + 'a>>,
}

impl<D> Default for PassHooks<'_, D> {
    fn default() -> Self {
        Self {
            cancel: None,
            before_advance: None,
            on_error: None,
            on_complete: None,
        }
    }
}

/// A batch of input documents materialized once so that several transforms
/// (indexes sharing one scan) can each run an independent pass over the same
/// input with a fresh error budget.
pub struct FaultTolerantBatch<D> {
    items: Vec<D>,
}

impl<D> FaultTolerantBatch<D> {
    pub fn new(items: Vec<D>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[D] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run one transform over the batch as a lazy iterator.
    ///
    /// `budget` is the consecutive-failure allowance `k`: each failing
    /// document is reported, dropped, and the transform restarts against the
    /// remaining input; a success resets the allowance. Once `k` consecutive
    /// documents have failed the pass stops even if input remains, so a
    /// systematically broken transform cannot spin forever.
    pub fn pass<'a, O, F>(&'a self, transform: F, budget: usize, hooks: PassHooks<'a, D>) -> Pass<'a, D, O, F>
    where
        F: FnMut(&D) -> Result<Vec<O>, TransformError>,
    {
        Pass {
            items: self.items.iter(),
            transform,
            budget,
            remaining: budget,
            last_ok: None,
            pending: Vec::new().into_iter(),
            hooks,
            done: false,
        }
    }
}

pub struct Pass<'a, D, O, F> {
    items: std::slice::Iter<'a, D>,
    transform: F,
    budget: usize,
    remaining: usize,
    last_ok: Option<&'a D>,
    pending: std::vec::IntoIter<O>,
    hooks: PassHooks<'a, D>,
    done: bool,
}

impl<'a, D, O, F> Iterator for Pass<'a, D, O, F>
where
    F: FnMut(&D) -> Result<Vec<O>, TransformError>,
{
    type Item = O;

    fn next(&mut self) -> Option<O> {
        loop {
            if let Some(out) = self.pending.next() {
                return Some(out);
            }
            if self.done {
                return None;
            }
            if self
                .hooks
                .cancel
                .is_some_and(CancellationToken::is_cancelled)
            {
                self.done = true;
                return None;
            }
            if self.remaining == 0 {
                // Budget already exhausted (or zero to begin with).
                self.done = true;
                return None;
            }

            if let Some(before) = self.hooks.before_advance.as_mut() {
                before();
            }

            match self.items.next() {
                None => {
                    self.done = true;
                    if let Some(complete) = self.hooks.on_complete.as_mut() {
                        complete();
                    }
                    return None;
                }
                Some(item) => match (self.transform)(item) {
                    Ok(outputs) => {
                        self.remaining = self.budget;
                        self.last_ok = Some(item);
                        self.pending = outputs.into_iter();
                    }
                    Err(err) => {
                        if let Some(on_error) = self.hooks.on_error.as_mut() {
                            on_error(&err, self.last_ok);
                        }
                        // The failed item is dropped; the pass restarts
                        // against the remaining input.
                        self.remaining -= 1;
                        if self.remaining == 0 {
                            self.done = true;
                            return None;
                        }
                    }
                },
            }
        }
    }
}
