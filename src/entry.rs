//! Cache Entry Module
//!
//! The in-memory record held for each cached key: the payload buffer,
//! writer-supplied metadata, write-back state, and the bookkeeping fields
//! the page lists and deadline index operate through.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use crate::key::CacheKey;

/// Logical content time supplied by the writer (seconds + nanoseconds).
///
/// Compared for compare-and-swap writes and for staleness against the
/// backend; the cache itself never advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordTimestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl RecordTimestamp {
    pub fn new(secs: u64, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Current wall time as a record timestamp.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }
}

/// Metadata returned by [`crate::cache::SlruCache::lookup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub size: u64,
    pub user_flags: u64,
    pub timestamp: RecordTimestamp,
}

/// A cached record.
///
/// Owned by the cache core; the page lists and deadline index hold the key
/// and reach the entry through the key map, so an entry is destroyed only
/// once it is unlinked from every structure.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry {
    pub key: CacheKey,
    /// Immutable refcounted payload. Writes and appends swap in a fresh
    /// buffer; readers clone the handle and consume bytes outside the lock.
    pub payload: Bytes,
    pub user_flags: u64,
    pub timestamp: RecordTimestamp,
    /// Absolute expiry time, `None` = no TTL.
    pub lifetime_deadline: Option<Instant>,
    /// Absolute write-back time, `None` = nothing to write back.
    pub sync_deadline: Option<Instant>,
    /// Payload differs from the backing store.
    pub dirty: bool,
    /// Entry shadows a delete to apply on eviction.
    pub remove_from_disk: bool,
    /// Pending changes are byte-appends rather than full replacements.
    pub append_mode: bool,
    /// Bytes below this offset are already on the backend; the sync path
    /// writes `payload[append_base..]` with the append opcode.
    pub append_base: usize,
    /// Set while a worker writes this entry back outside the lock. While
    /// set, no path may unlink the entry.
    pub sync_in_progress: bool,
    /// SLRU segment currently holding the entry (0 = coldest).
    pub page_level: usize,
    /// Incremented on every mutation; sync completions apply their side
    /// effects only if the version they snapshotted is still current.
    pub version: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Bytes, user_flags: u64, timestamp: RecordTimestamp) -> Self {
        Self {
            key,
            payload,
            user_flags,
            timestamp,
            lifetime_deadline: None,
            sync_deadline: None,
            dirty: false,
            remove_from_disk: false,
            append_mode: false,
            append_base: 0,
            sync_in_progress: false,
            page_level: 0,
            version: 0,
        }
    }

    /// Byte size accounted against the page budget.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Earliest wall time at which the lifecycle worker must act on this
    /// entry, `None` when neither deadline is armed.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.sync_deadline, self.lifetime_deadline) {
            (Some(s), Some(l)) => Some(s.min(l)),
            (Some(s), None) => Some(s),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        }
    }

    /// True once the lifetime deadline has passed.
    pub fn lifetime_due(&self, now: Instant) -> bool {
        self.lifetime_deadline.map_or(false, |d| d <= now)
    }

    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            size: self.size(),
            user_flags: self.user_flags,
            timestamp: self.timestamp,
        }
    }
}
