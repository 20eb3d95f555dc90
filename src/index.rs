//! Deadline Index Module
//!
//! Ordered view of cached entries keyed by `(deadline, key)`, where the
//! deadline is the earlier of an entry's sync and lifetime deadlines. The
//! lifecycle worker scans it from the front; mutations keep it in step with
//! the entry's current deadline by removing the old composite key and
//! inserting the new one.

use std::collections::BTreeSet;
use tokio::time::Instant;

use crate::key::CacheKey;

/// Ordered multi-view over `(deadline, key)` pairs. An entry appears here
/// iff it has a finite deadline.
#[derive(Debug, Default)]
pub(crate) struct DeadlineIndex {
    set: BTreeSet<(Instant, CacheKey)>,
}

impl DeadlineIndex {
    pub fn new() -> Self {
        Self {
            set: BTreeSet::new(),
        }
    }

    pub fn insert(&mut self, deadline: Instant, key: CacheKey) {
        self.set.insert((deadline, key));
    }

    pub fn remove(&mut self, deadline: Instant, key: &CacheKey) {
        self.set.remove(&(deadline, *key));
    }

    /// Earliest `(deadline, key)` pair without removing it.
    pub fn peek_min(&self) -> Option<(Instant, CacheKey)> {
        self.set.iter().next().copied()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    #[cfg(test)]
    pub fn contains(&self, deadline: Instant, key: &CacheKey) -> bool {
        self.set.contains(&(deadline, *key))
    }
}
