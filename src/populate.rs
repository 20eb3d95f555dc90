//! Single-Flight Populate Module
//!
//! Coordinates concurrent populate-from-disk attempts so that at most one
//! backend read per key is ever in flight. The first caller for a key
//! becomes the fetcher; later callers subscribe to a broadcast channel,
//! wait with the cache lock released, and re-check the cache once woken.
//! A positive or negative outcome is only a wake-up signal; waiters must
//! re-lookup rather than trust a captured payload.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::entry::RecordTimestamp;
use crate::key::CacheKey;

/// Outcome broadcast to waiters: the timestamp of the installed record,
/// `None` when the backend had nothing, or the I/O error message.
pub(crate) type PopulateResult = std::result::Result<Option<RecordTimestamp>, String>;

/// Only the completion notification ever travels on a channel.
const CHANNEL_CAPACITY: usize = 1;

/// Tracks pending populate-from-disk fetches per key.
#[derive(Default)]
pub(crate) struct PopulateTracker {
    pending: Arc<DashMap<CacheKey, broadcast::Sender<PopulateResult>>>,
}

/// Role assigned to a populate attempt.
pub(crate) enum PopulateRole {
    /// First attempt for this key; the holder performs the backend read and
    /// must resolve the guard.
    Fetcher(PopulateGuard),
    /// Another attempt is already fetching; wait on the receiver, then
    /// re-lookup the cache.
    Waiter(broadcast::Receiver<PopulateResult>),
}

/// RAII guard owned by the fetching task. Dropping it without resolving
/// (panic, cancellation) clears the pending slot; waiters observe the
/// closed channel and retry as fetchers themselves.
pub(crate) struct PopulateGuard {
    key: CacheKey,
    sender: broadcast::Sender<PopulateResult>,
    pending: Arc<DashMap<CacheKey, broadcast::Sender<PopulateResult>>>,
    resolved: bool,
}

impl PopulateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attempt to populate `key`.
    pub fn register(&self, key: CacheKey) -> PopulateRole {
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
                vacant.insert(tx.clone());
                PopulateRole::Fetcher(PopulateGuard {
                    key,
                    sender: tx,
                    pending: Arc::clone(&self.pending),
                    resolved: false,
                })
            }
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                PopulateRole::Waiter(occupied.get().subscribe())
            }
        }
    }

    /// Number of fetches currently in flight.
    pub fn depth(&self) -> usize {
        self.pending.len()
    }
}

impl PopulateGuard {
    /// Publish the outcome and wake all waiters.
    pub fn resolve(mut self, result: PopulateResult) {
        self.resolved = true;
        // No receivers is fine; the send result is irrelevant.
        let _ = self.sender.send(result);
        self.pending.remove(&self.key);
    }
}

impl Drop for PopulateGuard {
    fn drop(&mut self) {
        if !self.resolved {
            self.pending.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &[u8]) -> CacheKey {
        CacheKey::from_name(name).unwrap()
    }

    #[test]
    fn test_first_register_is_fetcher() {
        let tracker = PopulateTracker::new();

        let _guard = match tracker.register(key(b"k")) {
            PopulateRole::Fetcher(guard) => guard,
            PopulateRole::Waiter(_) => panic!("expected fetcher"),
        };
        assert_eq!(tracker.depth(), 1);
    }

    #[test]
    fn test_second_register_is_waiter() {
        let tracker = PopulateTracker::new();

        let _guard = match tracker.register(key(b"k")) {
            PopulateRole::Fetcher(guard) => guard,
            PopulateRole::Waiter(_) => panic!("expected fetcher"),
        };
        assert!(matches!(
            tracker.register(key(b"k")),
            PopulateRole::Waiter(_)
        ));
        assert_eq!(tracker.depth(), 1);
    }

    #[test]
    fn test_resolve_clears_slot() {
        let tracker = PopulateTracker::new();

        let guard = match tracker.register(key(b"k")) {
            PopulateRole::Fetcher(guard) => guard,
            PopulateRole::Waiter(_) => panic!("expected fetcher"),
        };
        guard.resolve(Ok(None));

        assert_eq!(tracker.depth(), 0);
        assert!(matches!(
            tracker.register(key(b"k")),
            PopulateRole::Fetcher(_)
        ));
    }

    #[test]
    fn test_drop_without_resolve_clears_slot() {
        let tracker = PopulateTracker::new();
        {
            let _guard = match tracker.register(key(b"k")) {
                PopulateRole::Fetcher(guard) => guard,
                PopulateRole::Waiter(_) => panic!("expected fetcher"),
            };
        }
        assert_eq!(tracker.depth(), 0);
    }

    #[tokio::test]
    async fn test_waiter_receives_resolution() {
        let tracker = PopulateTracker::new();

        let guard = match tracker.register(key(b"k")) {
            PopulateRole::Fetcher(guard) => guard,
            PopulateRole::Waiter(_) => panic!("expected fetcher"),
        };
        let mut rx = match tracker.register(key(b"k")) {
            PopulateRole::Waiter(rx) => rx,
            PopulateRole::Fetcher(_) => panic!("expected waiter"),
        };

        let ts = RecordTimestamp::new(5, 0);
        tokio::spawn(async move {
            guard.resolve(Ok(Some(ts)));
        });

        assert_eq!(rx.recv().await.unwrap(), Ok(Some(ts)));
    }

    #[tokio::test]
    async fn test_waiter_detects_abandoned_fetch() {
        let tracker = PopulateTracker::new();

        let guard = match tracker.register(key(b"k")) {
            PopulateRole::Fetcher(guard) => guard,
            PopulateRole::Waiter(_) => panic!("expected fetcher"),
        };
        let mut rx = match tracker.register(key(b"k")) {
            PopulateRole::Waiter(rx) => rx,
            PopulateRole::Fetcher(_) => panic!("expected waiter"),
        };

        drop(guard);
        assert!(rx.recv().await.is_err());
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let tracker = PopulateTracker::new();

        let _a = match tracker.register(key(b"a")) {
            PopulateRole::Fetcher(guard) => guard,
            PopulateRole::Waiter(_) => panic!("expected fetcher for a"),
        };
        let _b = match tracker.register(key(b"b")) {
            PopulateRole::Fetcher(guard) => guard,
            PopulateRole::Waiter(_) => panic!("expected fetcher for b"),
        };
        assert_eq!(tracker.depth(), 2);
    }
}
