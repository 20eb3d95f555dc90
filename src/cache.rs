//! Cache Module
//!
//! The segmented-LRU write-back cache. All index, page, and entry mutations
//! are serialized on a single cache-wide mutex; backend I/O always runs
//! with the mutex released. Work that needs I/O is snapshotted into a
//! `SyncJob` under the lock, performed outside it, and committed on
//! re-acquisition only if the entry's version counter is unchanged.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, StorageBackend};
use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryInfo, RecordTimestamp};
use crate::index::DeadlineIndex;
use crate::key::CacheKey;
use crate::pages::PageSet;
use crate::populate::{PopulateRole, PopulateTracker};
use crate::stats::{CacheStats, CacheStatsSnapshot};
use crate::{lifecycle, CacheError, Result};

/// Options for [`SlruCache::write`].
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Opaque tag stored with the record.
    pub user_flags: u64,
    /// Logical content time; defaults to the current wall time.
    pub timestamp: Option<RecordTimestamp>,
    /// Touch only the cache: no dirtying, no backend consultation.
    pub cache_only: bool,
    /// Concatenate onto the existing payload instead of replacing it.
    pub append: bool,
    /// Accept the write even when the backend holds a newer timestamp.
    pub overwrite: bool,
    /// Expire the entry this long from now; absent = no TTL.
    pub lifetime_ttl: Option<Duration>,
    /// Write back this long from now; absent = the configured sync
    /// interval, zero = immediately.
    pub sync_ttl: Option<Duration>,
    /// Fail with CasMismatch unless the cached timestamp equals this.
    pub compare_and_swap: Option<RecordTimestamp>,
}

/// Options for [`SlruCache::read`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    pub offset: u64,
    /// Bytes to return; absent = everything from `offset`.
    pub size: Option<u64>,
    /// Do not consult the backend on a miss.
    pub cache_only: bool,
}

/// Backend effect captured under the lock and performed outside it.
#[derive(Debug, Clone)]
pub(crate) enum JobOp {
    Write {
        payload: Bytes,
        append: bool,
        user_flags: u64,
        timestamp: RecordTimestamp,
    },
    Remove,
}

/// A write-back (or tombstone) snapshot for one entry. The entry's
/// `sync_in_progress` flag is set for as long as the job is outstanding.
#[derive(Debug, Clone)]
pub(crate) struct SyncJob {
    pub key: CacheKey,
    pub version: u64,
    pub op: JobOp,
    /// Unlink and drop the entry once the job succeeds (eviction,
    /// expiration, tombstone) instead of merely marking it clean.
    pub drop_after: bool,
}

/// Snapshot a sync job from an entry and mark it in flight.
pub(crate) fn make_sync_job(entry: &mut CacheEntry, drop_after: bool) -> SyncJob {
    entry.sync_in_progress = true;
    let op = if entry.remove_from_disk {
        JobOp::Remove
    } else if entry.append_mode {
        JobOp::Write {
            payload: entry.payload.slice(entry.append_base..),
            append: true,
            user_flags: entry.user_flags,
            timestamp: entry.timestamp,
        }
    } else {
        JobOp::Write {
            payload: entry.payload.clone(),
            append: false,
            user_flags: entry.user_flags,
            timestamp: entry.timestamp,
        }
    };
    SyncJob {
        key: entry.key,
        version: entry.version,
        op,
        drop_after,
    }
}

/// Mutable cache state guarded by the cache-wide mutex.
pub(crate) struct CacheCore {
    pub entries: HashMap<CacheKey, CacheEntry>,
    pub pages: PageSet,
    pub index: DeadlineIndex,
}

/// Outcome of one budget-enforcement pass under the lock.
pub(crate) enum BudgetOutcome {
    /// Every page fits.
    Satisfied,
    /// The eviction candidate is mid-sync on another task; defer.
    Busy,
    /// A dirty or tombstoned victim needs backend I/O before it can go.
    NeedsIo(SyncJob),
}

impl CacheCore {
    fn new(page_sizes: &[u64]) -> Self {
        Self {
            entries: HashMap::new(),
            pages: PageSet::new(page_sizes),
            index: DeadlineIndex::new(),
        }
    }

    /// Swap an entry's index position after its deadline changed.
    pub(crate) fn reindex(
        &mut self,
        key: CacheKey,
        old: Option<Instant>,
        new: Option<Instant>,
    ) {
        if old == new {
            return;
        }
        if let Some(deadline) = old {
            self.index.remove(deadline, &key);
        }
        if let Some(deadline) = new {
            self.index.insert(deadline, key);
        }
    }

    /// Detach an entry from the page list, the index, and the key map.
    /// Callers must have checked `sync_in_progress` is clear (or own it).
    pub(crate) fn unlink_entry(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.pages.unlink(entry.page_level, key, entry.size());
        if let Some(deadline) = entry.deadline() {
            self.index.remove(deadline, key);
        }
        Some(entry)
    }

    /// Demote and drop entries until every page fits its budget, stopping
    /// when a victim needs backend I/O. Runs entirely under the lock.
    fn enforce_step(&mut self, stats: &CacheStats) -> BudgetOutcome {
        loop {
            let over = (0..self.pages.level_count())
                .rev()
                .find(|&level| self.pages.over_budget(level, 0));
            let Some(level) = over else {
                return BudgetOutcome::Satisfied;
            };
            let Some(&victim) = self.pages.peek_back(level) else {
                return BudgetOutcome::Satisfied;
            };

            let entry = self
                .entries
                .get(&victim)
                .expect("page lists a key absent from the entry map");
            if entry.sync_in_progress {
                return BudgetOutcome::Busy;
            }
            let size = entry.size();
            let needs_io = entry.dirty || entry.remove_from_disk;

            if level > 0 {
                self.pages.unlink(level, &victim, size);
                self.pages.push_front(level - 1, victim, size);
                self.entries
                    .get_mut(&victim)
                    .expect("demotion victim vanished")
                    .page_level = level - 1;
                continue;
            }

            if needs_io {
                let entry = self
                    .entries
                    .get_mut(&victim)
                    .expect("eviction victim vanished");
                return BudgetOutcome::NeedsIo(make_sync_job(entry, true));
            }

            self.unlink_entry(&victim);
            CacheStats::incr(&stats.evictions);
            debug!("evicted clean entry {} from page 0", victim);
        }
    }
}

/// Per-iteration decision of the write loop.
enum WriteStep {
    Done,
    /// Failed; budgets are still enforced before the error surfaces, since
    /// a populate may have installed an entry on the way here.
    Fail(CacheError),
    Flush(SyncJob),
    Populate,
    /// A flush is required but the entry is mid-sync on another task.
    Retry,
}

/// Per-iteration decision of the read loop.
enum ReadStep {
    Serve(Bytes),
    Fail(CacheError),
    Flush(SyncJob),
    Populate,
    Absent,
    /// A flush is required but the entry is mid-sync on another task.
    Retry,
}

/// Back-off before re-examining an entry whose sync is in flight.
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Segmented-LRU write-back cache in front of a [`StorageBackend`].
///
/// Constructed with [`SlruCache::new`], which also spawns the lifecycle
/// worker. Hosts must call [`SlruCache::stop`] before dropping the last
/// handle so dirty entries are drained to the backend.
pub struct SlruCache {
    pub(crate) core: Mutex<CacheCore>,
    pub(crate) backend: Arc<dyn StorageBackend>,
    pub(crate) populate: PopulateTracker,
    pub(crate) stats: CacheStats,
    pub(crate) config: CacheConfig,
    pub(crate) stopped: AtomicBool,
    /// Wakes the lifecycle worker when a mutation arms a deadline that may
    /// be earlier than the one it sleeps toward.
    pub(crate) deadline_changed: Notify,
    shutdown_tx: broadcast::Sender<()>,
    lifecheck: StdMutex<Option<JoinHandle<()>>>,
}

impl SlruCache {
    /// Build the cache and spawn its lifecycle worker. Must be called from
    /// within a tokio runtime.
    pub fn new(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Result<Arc<Self>> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let cache = Arc::new(Self {
            core: Mutex::new(CacheCore::new(&config.page_sizes)),
            backend,
            populate: PopulateTracker::new(),
            stats: CacheStats::new(),
            config,
            stopped: AtomicBool::new(false),
            deadline_changed: Notify::new(),
            shutdown_tx,
            lifecheck: StdMutex::new(None),
        });

        let worker = tokio::spawn(lifecycle::run(Arc::clone(&cache), shutdown_rx));
        *cache.lifecheck.lock().unwrap() = Some(worker);

        info!(
            pages = cache.config.page_sizes.len(),
            total_budget = cache.config.page_sizes.iter().sum::<u64>(),
            "cache started"
        );
        Ok(cache)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CacheError::Stopped);
        }
        Ok(())
    }

    /// Store a record. Returns the timestamp now carried by the entry.
    pub async fn write(
        &self,
        key: CacheKey,
        payload: &[u8],
        opts: WriteOptions,
    ) -> Result<RecordTimestamp> {
        self.ensure_running()?;
        let timestamp = opts.timestamp.unwrap_or_else(RecordTimestamp::now);
        // Some(disk_timestamp) once a populate attempt resolved.
        let mut populated: Option<Option<RecordTimestamp>> = None;

        loop {
            let step = {
                let mut core = self.core.lock().await;
                let existing = core
                    .entries
                    .get(&key)
                    .map(|e| (e.timestamp, e.dirty, e.append_mode, e.sync_in_progress));
                match existing {
                    Some((cached_ts, dirty, append_mode, in_sync)) => {
                        if opts
                            .compare_and_swap
                            .is_some_and(|cas| cas != cached_ts)
                        {
                            WriteStep::Fail(CacheError::CasMismatch)
                        } else if matches!(populated, Some(Some(disk_ts))
                            if disk_ts > timestamp && !opts.overwrite)
                        {
                            WriteStep::Fail(CacheError::Stale)
                        } else {
                            let needs_flush = (append_mode && dirty && !opts.append)
                                || (opts.append && dirty && !append_mode);
                            if needs_flush && in_sync {
                                WriteStep::Retry
                            } else if needs_flush {
                                // A replacement over queued appends (or
                                // appends over unsynced replacement data)
                                // must reach the backend first so it
                                // observes effects in order.
                                let entry =
                                    core.entries.get_mut(&key).expect("entry vanished");
                                WriteStep::Flush(make_sync_job(entry, false))
                            } else {
                                match self
                                    .commit_update(&mut core, key, payload, &opts, timestamp)
                                {
                                    Ok(()) => WriteStep::Done,
                                    Err(e) => WriteStep::Fail(e),
                                }
                            }
                        }
                    }
                    None => {
                        if populated.is_none()
                            && !opts.cache_only
                            && self.config.populate_on_miss
                        {
                            WriteStep::Populate
                        } else {
                            match self.commit_create(&mut core, key, payload, &opts, timestamp)
                            {
                                Ok(()) => WriteStep::Done,
                                Err(e) => WriteStep::Fail(e),
                            }
                        }
                    }
                }
            };

            match step {
                WriteStep::Done => break,
                WriteStep::Fail(e) => {
                    self.enforce_budget().await;
                    return Err(e);
                }
                WriteStep::Flush(job) => self.run_sync_job(job).await,
                WriteStep::Populate => {
                    populated = Some(self.populate_from_disk(key).await?);
                }
                WriteStep::Retry => tokio::time::sleep(SYNC_RETRY_DELAY).await,
            }
        }

        self.enforce_budget().await;
        Ok(timestamp)
    }

    /// Read a range of a record. The returned view is a refcounted slice
    /// that remains valid after the lock is released.
    pub async fn read(&self, key: CacheKey, opts: ReadOptions) -> Result<Bytes> {
        self.ensure_running()?;
        let mut attempted_populate = false;
        let mut counted_miss = false;

        let view = loop {
            let step = {
                let mut core = self.core.lock().await;
                let existing = core
                    .entries
                    .get(&key)
                    .map(|e| (e.remove_from_disk, e.append_mode && e.dirty, e.sync_in_progress));
                match existing {
                    Some((true, _, _)) => ReadStep::Absent,
                    Some((_, true, true)) => ReadStep::Retry,
                    Some((_, true, false)) => {
                        // Pending appends must reach the backend before the
                        // read observes the combined payload.
                        let entry = core.entries.get_mut(&key).expect("entry vanished");
                        ReadStep::Flush(make_sync_job(entry, false))
                    }
                    Some(_) => {
                        let entry = core.entries.get(&key).expect("entry vanished");
                        let len = entry.payload.len() as u64;
                        let offset = opts.offset;
                        let size = opts.size.unwrap_or_else(|| len.saturating_sub(offset));
                        if offset + size > len {
                            ReadStep::Fail(CacheError::BadRange(format!(
                                "offset {} + size {} exceeds payload length {}",
                                offset, size, len
                            )))
                        } else {
                            let view = entry
                                .payload
                                .slice(offset as usize..(offset + size) as usize);
                            self.touch(&mut core, key);
                            CacheStats::incr(&self.stats.hits);
                            ReadStep::Serve(view)
                        }
                    }
                    None => {
                        if !counted_miss {
                            CacheStats::incr(&self.stats.misses);
                            counted_miss = true;
                        }
                        if opts.cache_only || !self.config.populate_on_miss || attempted_populate
                        {
                            ReadStep::Absent
                        } else {
                            ReadStep::Populate
                        }
                    }
                }
            };

            match step {
                ReadStep::Serve(view) => break view,
                ReadStep::Fail(e) => {
                    self.enforce_budget().await;
                    return Err(e);
                }
                ReadStep::Flush(job) => self.run_sync_job(job).await,
                ReadStep::Populate => {
                    attempted_populate = true;
                    self.populate_from_disk(key).await?;
                }
                ReadStep::Absent => {
                    if !counted_miss {
                        CacheStats::incr(&self.stats.misses);
                    }
                    return Err(CacheError::NotFound);
                }
                ReadStep::Retry => tokio::time::sleep(SYNC_RETRY_DELAY).await,
            }
        };

        CacheStats::incr(&self.stats.reads);
        self.enforce_budget().await;
        Ok(view)
    }

    /// Delete a record. With `cache_only`, only the cached copy is
    /// discarded; otherwise a tombstone is scheduled (or the delete is
    /// forwarded straight to the backend on a miss). Succeeds even when
    /// the key is absent everywhere.
    pub async fn remove(&self, key: CacheKey, cache_only: bool) -> Result<()> {
        self.ensure_running()?;
        {
            let mut core = self.core.lock().await;
            if core.entries.contains_key(&key) {
                CacheStats::incr(&self.stats.removes);
                if cache_only {
                    self.discard_cached(&mut core, key);
                } else {
                    self.tombstone(&mut core, key);
                }
                return Ok(());
            }
        }

        if !cache_only {
            CacheStats::incr(&self.stats.removes);
            match self.backend.remove(&key).await {
                Ok(()) | Err(BackendError::NotFound) => {}
                Err(BackendError::Io(msg)) => return Err(CacheError::Io(msg)),
            }
        }
        Ok(())
    }

    /// Record metadata without touching the LRU position. Falls back to
    /// the backend on a miss unless `cache_only`.
    pub async fn lookup(&self, key: CacheKey, cache_only: bool) -> Result<EntryInfo> {
        self.ensure_running()?;
        {
            let core = self.core.lock().await;
            if let Some(entry) = core.entries.get(&key) {
                if entry.remove_from_disk {
                    // A pending delete shadows the backend record.
                    return Err(CacheError::NotFound);
                }
                return Ok(entry.info());
            }
        }

        if cache_only || !self.config.populate_on_miss {
            return Err(CacheError::NotFound);
        }
        let meta = self.backend.lookup(&key).await?;
        Ok(EntryInfo {
            size: meta.size,
            user_flags: meta.user_flags,
            timestamp: meta.timestamp,
        })
    }

    /// Point-in-time statistics snapshot.
    pub async fn stats(&self) -> CacheStatsSnapshot {
        let core = self.core.lock().await;
        self.stats.snapshot(
            self.populate.depth() as u64,
            core.entries.len() as u64,
            core.pages.page_byte_totals(),
        )
    }

    /// Stop the cache: join the lifecycle worker, then write back every
    /// dirty or tombstoned entry. Idempotent; operations issued after the
    /// first call fail with [`CacheError::Stopped`].
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping cache");
        let _ = self.shutdown_tx.send(());
        self.deadline_changed.notify_one();

        let worker = self.lifecheck.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("lifecycle worker join failed: {}", e);
            }
        }

        let jobs: Vec<SyncJob> = {
            let mut core = self.core.lock().await;
            let keys: Vec<CacheKey> = core
                .entries
                .values()
                .filter(|e| (e.dirty || e.remove_from_disk) && !e.sync_in_progress)
                .map(|e| e.key)
                .collect();
            keys.iter()
                .map(|k| {
                    let entry = core.entries.get_mut(k).expect("drain entry vanished");
                    let drop_after = entry.remove_from_disk;
                    make_sync_job(entry, drop_after)
                })
                .collect()
        };
        let drained = jobs.len();
        for job in jobs {
            self.run_sync_job(job).await;
        }
        info!(drained, "cache stopped");
        Ok(())
    }

    /// Check the structural invariants (for testing): each entry linked in
    /// exactly one page with sizes accounted, index membership matching
    /// finite deadlines, and every dirty entry carrying a sync deadline.
    pub async fn validate_consistency(&self) -> std::result::Result<(), String> {
        let core = self.core.lock().await;

        let mut seen: HashMap<CacheKey, usize> = HashMap::new();
        for level in 0..core.pages.level_count() {
            let mut linked = 0u64;
            for key in core.pages.level_keys(level) {
                *seen.entry(*key).or_insert(0) += 1;
                let entry = core
                    .entries
                    .get(key)
                    .ok_or_else(|| format!("page {} links unknown key {}", level, key))?;
                if entry.page_level != level {
                    return Err(format!(
                        "entry {} thinks it is in page {} but is linked in page {}",
                        key, entry.page_level, level
                    ));
                }
                linked += entry.size();
            }
            if linked != core.pages.current_size(level) {
                return Err(format!(
                    "page {} size mismatch: tracked {} vs linked {}",
                    level,
                    core.pages.current_size(level),
                    linked
                ));
            }
        }
        for (key, count) in &seen {
            if *count != 1 {
                return Err(format!("key {} linked in {} pages", key, count));
            }
        }

        let mut indexed = 0usize;
        for entry in core.entries.values() {
            if !seen.contains_key(&entry.key) {
                return Err(format!("entry {} not linked in any page", entry.key));
            }
            if entry.dirty && entry.sync_deadline.is_none() {
                return Err(format!("dirty entry {} has no sync deadline", entry.key));
            }
            if entry.deadline().is_some() {
                indexed += 1;
            }
        }
        if indexed != core.index.len() {
            return Err(format!(
                "index holds {} nodes but {} entries have finite deadlines",
                core.index.len(),
                indexed
            ));
        }
        Ok(())
    }

    // ---- internal helpers ----------------------------------------------

    /// Mutate an existing entry under the lock and move it to the front of
    /// the hottest page.
    fn commit_update(
        &self,
        core: &mut CacheCore,
        key: CacheKey,
        payload: &[u8],
        opts: &WriteOptions,
        timestamp: RecordTimestamp,
    ) -> Result<()> {
        let top = core.pages.top_level();
        let top_max = core.pages.max_size(top);
        let now = Instant::now();

        let entry = core.entries.get_mut(&key).expect("commit_update on absent entry");
        let old_deadline = entry.deadline();
        let old_size = entry.size();
        let old_level = entry.page_level;
        let resurrecting = entry.remove_from_disk;

        let new_payload = if opts.append && !resurrecting {
            let mut buf = BytesMut::with_capacity(entry.payload.len() + payload.len());
            buf.extend_from_slice(&entry.payload);
            buf.extend_from_slice(payload);
            buf.freeze()
        } else {
            Bytes::copy_from_slice(payload)
        };
        let new_size = new_payload.len() as u64;
        if new_size > top_max {
            return Err(CacheError::Budget(format!(
                "{} bytes exceed page {} budget of {}",
                new_size, top, top_max
            )));
        }

        entry.payload = new_payload;
        entry.user_flags = opts.user_flags;
        entry.timestamp = timestamp;
        entry.version += 1;
        if resurrecting {
            // A write lands on a pending delete: the delete is cancelled
            // and the next sync must fully replace the stale record.
            entry.remove_from_disk = false;
            entry.append_mode = false;
            entry.append_base = 0;
        } else if opts.append {
            if !entry.append_mode {
                entry.append_mode = true;
                entry.append_base = old_size as usize;
            }
        } else {
            entry.append_mode = false;
            entry.append_base = 0;
        }
        if !opts.cache_only {
            entry.dirty = true;
            let sync_ttl = opts.sync_ttl.unwrap_or_else(|| self.config.sync_interval());
            entry.sync_deadline = Some(now + sync_ttl);
        } else if !entry.dirty {
            entry.sync_deadline = None;
        }
        entry.lifetime_deadline = opts.lifetime_ttl.map(|ttl| now + ttl);
        entry.page_level = top;
        let new_deadline = entry.deadline();

        core.pages.unlink(old_level, &key, old_size);
        core.pages.push_front(top, key, new_size);
        core.reindex(key, old_deadline, new_deadline);

        if old_level < top {
            CacheStats::incr(&self.stats.promotions);
        }
        CacheStats::incr(&self.stats.writes);
        if new_deadline.is_some() {
            self.deadline_changed.notify_one();
        }
        debug!("updated entry {} ({} bytes)", key, new_size);
        Ok(())
    }

    /// Install a fresh entry in the coldest page under the lock.
    fn commit_create(
        &self,
        core: &mut CacheCore,
        key: CacheKey,
        payload: &[u8],
        opts: &WriteOptions,
        timestamp: RecordTimestamp,
    ) -> Result<()> {
        let size = payload.len() as u64;
        if size > core.pages.max_size(0) {
            return Err(CacheError::Budget(format!(
                "{} bytes exceed page 0 budget of {}",
                size,
                core.pages.max_size(0)
            )));
        }
        let now = Instant::now();

        let mut entry = CacheEntry::new(
            key,
            Bytes::copy_from_slice(payload),
            opts.user_flags,
            timestamp,
        );
        if opts.append {
            entry.append_mode = true;
            entry.append_base = 0;
        }
        if !opts.cache_only {
            entry.dirty = true;
            let sync_ttl = opts.sync_ttl.unwrap_or_else(|| self.config.sync_interval());
            entry.sync_deadline = Some(now + sync_ttl);
        }
        entry.lifetime_deadline = opts.lifetime_ttl.map(|ttl| now + ttl);
        let deadline = entry.deadline();

        core.entries.insert(key, entry);
        core.pages.push_front(0, key, size);
        if let Some(d) = deadline {
            core.index.insert(d, key);
            self.deadline_changed.notify_one();
        }
        CacheStats::incr(&self.stats.writes);
        debug!("created entry {} ({} bytes)", key, size);
        Ok(())
    }

    /// LRU touch on a read hit: move one page hotter (front of the next
    /// level), or refresh the MRU position when already at the top.
    fn touch(&self, core: &mut CacheCore, key: CacheKey) {
        let top = core.pages.top_level();
        let entry = core.entries.get_mut(&key).expect("touch on absent entry");
        let old_level = entry.page_level;
        let new_level = (old_level + 1).min(top);
        let size = entry.size();
        entry.page_level = new_level;

        core.pages.unlink(old_level, &key, size);
        core.pages.push_front(new_level, key, size);
        if new_level > old_level {
            CacheStats::incr(&self.stats.promotions);
        }
    }

    /// Drop the cached copy without touching the backend. An entry mid-sync
    /// cannot be unlinked; it is given an immediate lifetime deadline and
    /// the lifecycle worker drops it once the sync completes.
    fn discard_cached(&self, core: &mut CacheCore, key: CacheKey) {
        let in_sync = core
            .entries
            .get(&key)
            .map(|e| e.sync_in_progress)
            .unwrap_or(false);
        if !in_sync {
            core.unlink_entry(&key);
            return;
        }
        let entry = core.entries.get_mut(&key).expect("discard on absent entry");
        let old_deadline = entry.deadline();
        entry.dirty = false;
        entry.remove_from_disk = false;
        entry.append_mode = false;
        entry.version += 1;
        entry.sync_deadline = None;
        entry.lifetime_deadline = Some(Instant::now());
        let new_deadline = entry.deadline();
        core.reindex(key, old_deadline, new_deadline);
        self.deadline_changed.notify_one();
    }

    /// Turn a cached entry into a tombstone scheduled for an immediate
    /// backend delete.
    fn tombstone(&self, core: &mut CacheCore, key: CacheKey) {
        let entry = core.entries.get_mut(&key).expect("tombstone on absent entry");
        let old_deadline = entry.deadline();
        let old_size = entry.size();
        let level = entry.page_level;

        entry.payload = Bytes::new();
        entry.dirty = false;
        entry.append_mode = false;
        entry.append_base = 0;
        entry.remove_from_disk = true;
        entry.version += 1;
        entry.sync_deadline = Some(Instant::now());
        let new_deadline = entry.deadline();

        core.pages.resize(level, old_size, 0);
        core.reindex(key, old_deadline, new_deadline);
        self.deadline_changed.notify_one();
        debug!("tombstoned entry {}", key);
    }

    /// Populate a missing key from the backend, coalescing concurrent
    /// attempts into a single fetch. Returns the timestamp of the record
    /// found on disk, or `None` when the backend had nothing. Waiters must
    /// re-lookup the cache rather than trust this value.
    async fn populate_from_disk(&self, key: CacheKey) -> Result<Option<RecordTimestamp>> {
        loop {
            match self.populate.register(key) {
                PopulateRole::Fetcher(guard) => {
                    let fetched = self.backend.read(&key).await;
                    return match fetched {
                        Ok(record) => {
                            let timestamp = record.timestamp;
                            {
                                let mut core = self.core.lock().await;
                                if !core.entries.contains_key(&key) {
                                    let mut entry = CacheEntry::new(
                                        key,
                                        record.payload,
                                        record.user_flags,
                                        timestamp,
                                    );
                                    entry.append_base = entry.payload.len();
                                    let size = entry.size();
                                    core.entries.insert(key, entry);
                                    core.pages.push_front(0, key, size);
                                }
                            }
                            debug!("populated entry {} from backend", key);
                            guard.resolve(Ok(Some(timestamp)));
                            Ok(Some(timestamp))
                        }
                        Err(BackendError::NotFound) => {
                            guard.resolve(Ok(None));
                            Ok(None)
                        }
                        Err(BackendError::Io(msg)) => {
                            guard.resolve(Err(msg.clone()));
                            Err(CacheError::Io(msg))
                        }
                    };
                }
                PopulateRole::Waiter(mut rx) => match rx.recv().await {
                    Ok(Ok(timestamp)) => return Ok(timestamp),
                    Ok(Err(msg)) => return Err(CacheError::Io(msg)),
                    // Fetcher abandoned (panic or cancellation): retry as
                    // the fetcher ourselves.
                    Err(_) => continue,
                },
            }
        }
    }

    /// Perform a sync job's backend I/O with the lock released, then
    /// commit its outcome.
    pub(crate) async fn run_sync_job(&self, job: SyncJob) {
        let io_result = match &job.op {
            JobOp::Write {
                payload,
                append,
                user_flags,
                timestamp,
            } => self
                .backend
                .write(&job.key, payload, *user_flags, *timestamp, *append)
                .await
                .map_err(|e| e.to_string()),
            JobOp::Remove => match self.backend.remove(&job.key).await {
                // The record being gone already is what a tombstone wants.
                Ok(()) | Err(BackendError::NotFound) => Ok(()),
                Err(BackendError::Io(msg)) => Err(msg),
            },
        };

        let mut core = self.core.lock().await;
        self.finish_sync_job(&mut core, job, io_result);
    }

    /// Commit a completed sync job under the lock, honoring the version
    /// counter: side effects are discarded if a write superseded the
    /// snapshot while the I/O was in flight.
    fn finish_sync_job(
        &self,
        core: &mut CacheCore,
        job: SyncJob,
        io_result: std::result::Result<(), String>,
    ) {
        let Some(entry) = core.entries.get_mut(&job.key) else {
            return;
        };
        entry.sync_in_progress = false;

        match io_result {
            Err(msg) => {
                // Keep the entry dirty and retry at the next deadline; the
                // cache never silently drops unsynced data.
                warn!("write-back failed for {}: {}", job.key, msg);
                CacheStats::incr(&self.stats.syncs_failed);
                let old_deadline = entry.deadline();
                entry.sync_deadline = Some(Instant::now() + self.config.sync_interval());
                let new_deadline = entry.deadline();
                core.reindex(job.key, old_deadline, new_deadline);
            }
            Ok(()) => {
                if entry.version != job.version {
                    debug!("sync for {} superseded by a concurrent write", job.key);
                    return;
                }
                CacheStats::incr(&self.stats.syncs_completed);
                if job.drop_after {
                    core.unlink_entry(&job.key);
                    CacheStats::incr(&self.stats.evictions);
                    debug!("dropped entry {} after write-back", job.key);
                } else {
                    let old_deadline = entry.deadline();
                    entry.dirty = false;
                    entry.sync_deadline = None;
                    if matches!(job.op, JobOp::Write { append: true, .. }) {
                        entry.append_mode = false;
                        entry.append_base = entry.payload.len();
                    }
                    let new_deadline = entry.deadline();
                    core.reindex(job.key, old_deadline, new_deadline);
                }
            }
        }
    }

    /// Evict until every page fits its budget, writing back dirty victims
    /// with the lock released. I/O failures leave the victim dirty for the
    /// lifecycle worker to retry rather than looping here.
    pub(crate) async fn enforce_budget(&self) {
        let mut attempted: Vec<CacheKey> = Vec::new();
        loop {
            let job = {
                let mut core = self.core.lock().await;
                match core.enforce_step(&self.stats) {
                    BudgetOutcome::Satisfied => break,
                    BudgetOutcome::Busy => {
                        // The victim's write-back is in flight on another
                        // task; once it commits the entry is clean (or
                        // gone) and this pass can finish.
                        drop(core);
                        tokio::time::sleep(SYNC_RETRY_DELAY).await;
                        continue;
                    }
                    BudgetOutcome::NeedsIo(job) => {
                        if attempted.contains(&job.key) {
                            // Second round for the same victim this pass:
                            // its write-back failed or raced. Leave it to
                            // the lifecycle retry.
                            if let Some(entry) = core.entries.get_mut(&job.key) {
                                entry.sync_in_progress = false;
                            }
                            break;
                        }
                        attempted.push(job.key);
                        job
                    }
                }
            };
            self.run_sync_job(job).await;
        }
    }
}
