//! Lifecycle Module
//!
//! The background worker that drives time-based behavior: writing back
//! dirty entries past their sync deadline, dropping entries past their
//! lifetime deadline, and applying pending tombstones. The worker sleeps
//! until the earliest deadline in the index (bounded by the lifecheck
//! period), wakes early when a mutation arms a sooner deadline, and exits
//! on the shutdown signal.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{make_sync_job, CacheCore, SlruCache, SyncJob};
use crate::stats::CacheStats;

/// One decision of the deadline scan.
enum LifeAction {
    /// Nothing due; sleep until the hinted deadline (or the poll bound).
    Idle(Option<Instant>),
    /// A due entry needs backend I/O outside the lock.
    Io(SyncJob),
}

/// Worker loop. Runs until the shutdown channel fires.
pub(crate) async fn run(cache: Arc<SlruCache>, mut shutdown: broadcast::Receiver<()>) {
    info!("lifecycle worker started");
    loop {
        // Drain everything due before going back to sleep.
        let next_hint = loop {
            let action = {
                let mut core = cache.core.lock().await;
                next_action(&cache, &mut core)
            };
            match action {
                LifeAction::Idle(hint) => break hint,
                LifeAction::Io(job) => cache.run_sync_job(job).await,
            }
        };

        let poll_at = Instant::now() + cache.config.lifecheck_period();
        let wake_at = next_hint.map_or(poll_at, |deadline| deadline.min(poll_at));
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = cache.deadline_changed.notified() => {}
            _ = tokio::time::sleep_until(wake_at) => {}
        }
    }
    info!("lifecycle worker stopped");
}

/// Handle due entries under the lock until one needs I/O or none is due.
/// Inline work (dropping clean expired entries, disarming stale sync
/// deadlines) is batched into a single lock hold.
fn next_action(cache: &SlruCache, core: &mut CacheCore) -> LifeAction {
    loop {
        let Some((deadline, key)) = core.index.peek_min() else {
            return LifeAction::Idle(None);
        };
        let now = Instant::now();
        if deadline > now {
            return LifeAction::Idle(Some(deadline));
        }

        let state = core.entries.get(&key).map(|e| {
            (
                e.deadline(),
                e.sync_in_progress,
                e.lifetime_due(now),
                e.dirty,
                e.remove_from_disk,
            )
        });
        let Some((entry_deadline, in_sync, lifetime_due, dirty, tombstone)) = state else {
            // Index node without an entry: stale, discard it.
            core.index.remove(deadline, &key);
            continue;
        };
        if entry_deadline != Some(deadline) {
            // Node left behind by an out-of-step reindex; the entry's real
            // deadline has its own node.
            core.index.remove(deadline, &key);
            continue;
        }
        if in_sync {
            // Another task owns the write-back; check again on the next poll.
            return LifeAction::Idle(Some(now + cache.config.lifecheck_period()));
        }

        if !dirty && !tombstone {
            if lifetime_due {
                core.unlink_entry(&key);
                CacheStats::incr(&cache.stats.evictions);
                debug!("expired entry {}", key);
            } else {
                // Clean entry with a stale sync deadline: disarm it.
                let entry = core.entries.get_mut(&key).expect("due entry vanished");
                let old_deadline = entry.deadline();
                entry.sync_deadline = None;
                let new_deadline = entry.deadline();
                core.reindex(key, old_deadline, new_deadline);
            }
            continue;
        }

        // Dirty data past its sync deadline is written back in place;
        // expired or tombstoned entries are dropped once the backend call
        // succeeds.
        let drop_after = lifetime_due || tombstone;
        let entry = core.entries.get_mut(&key).expect("due entry vanished");
        return LifeAction::Io(make_sync_job(entry, drop_after));
    }
}
