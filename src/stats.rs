//! Statistics Module
//!
//! Operation counters for the cache, incremented while the lock is held or
//! from the lifecycle worker, and exposed to hosts as an atomic snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running counters. Increment-only; sizes are sampled from the page set
/// at snapshot time.
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub removes: AtomicU64,
    pub evictions: AtomicU64,
    pub promotions: AtomicU64,
    pub syncs_completed: AtomicU64,
    pub syncs_failed: AtomicU64,
}

/// Point-in-time view of cache activity and occupancy.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub reads: u64,
    pub writes: u64,
    pub removes: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub syncs_completed: u64,
    pub syncs_failed: u64,
    /// In-flight populate-from-disk fetches.
    pub pending_populate_depth: u64,
    /// Cached entry count.
    pub entries: u64,
    /// Accounted bytes per page, coldest first.
    pub page_bytes: Vec<u64>,
    /// Accounted bytes across all pages.
    pub total_bytes: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold the counters into a snapshot; occupancy figures are supplied
    /// by the caller, which samples them under the cache lock.
    pub fn snapshot(
        &self,
        pending_populate_depth: u64,
        entries: u64,
        page_bytes: Vec<u64>,
    ) -> CacheStatsSnapshot {
        let total_bytes = page_bytes.iter().sum();
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            syncs_completed: self.syncs_completed.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            pending_populate_depth,
            entries,
            page_bytes,
            total_bytes,
        }
    }
}
