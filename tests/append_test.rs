//! Integration tests for append coalescing: accumulated tails, the append
//! opcode on sync, and the ordering flushes forced by reads and
//! replacement writes.

use slru_cache::{
    CacheConfig, CacheKey, MemoryBackend, ReadOptions, RecordTimestamp, RecordedOp, SlruCache,
    WriteOptions,
};
use std::sync::Arc;
use std::time::Duration;

fn key(name: &[u8]) -> CacheKey {
    CacheKey::from_name(name).unwrap()
}

fn ts(secs: u64) -> RecordTimestamp {
    RecordTimestamp::new(secs, 0)
}

fn config(sync_interval_ms: u64) -> CacheConfig {
    CacheConfig {
        page_sizes: vec![1024, 1024],
        sync_interval_ms,
        lifecheck_period_ms: 50,
        populate_on_miss: true,
    }
}

fn append_write(secs: u64) -> WriteOptions {
    WriteOptions {
        append: true,
        timestamp: Some(ts(secs)),
        ..WriteOptions::default()
    }
}

#[tokio::test]
async fn test_appends_coalesce_in_memory_and_on_sync() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = SlruCache::new(config(60_000), Arc::clone(&backend) as _).unwrap();

    cache.write(key(b"k"), b"ab", append_write(1)).await.unwrap();
    cache.write(key(b"k"), b"cd", append_write(2)).await.unwrap();

    // The read forces the accumulated tail out first, then serves the
    // combined payload.
    let view = cache.read(key(b"k"), ReadOptions::default()).await.unwrap();
    assert_eq!(&view[..], b"abcd");

    // The backend saw the tail exactly once, as a single append.
    let appends: Vec<_> = backend
        .recorded_ops()
        .into_iter()
        .filter_map(|op| match op {
            RecordedOp::Write {
                key: k,
                payload,
                append: true,
            } if k == key(b"k") => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(appends.len(), 1);
    assert_eq!(&appends[0][..], b"abcd");
    assert_eq!(backend.stored_payload(&key(b"k")).unwrap(), &b"abcd"[..]);

    cache.stop().await.unwrap();
    // Nothing further to sync: the flush left the entry clean.
    assert_eq!(backend.write_count(&key(b"k")), 1);
}

#[tokio::test]
async fn test_append_to_populated_entry_writes_only_the_tail() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(key(b"k"), b"base", 0, ts(1));
    let cache = SlruCache::new(config(60_000), Arc::clone(&backend) as _).unwrap();

    cache.write(key(b"k"), b"tail", append_write(2)).await.unwrap();

    let view = cache.read(key(b"k"), ReadOptions::default()).await.unwrap();
    assert_eq!(&view[..], b"basetail");

    // Only the bytes the backend has not seen travel with the append.
    let appends: Vec<_> = backend
        .recorded_ops()
        .into_iter()
        .filter_map(|op| match op {
            RecordedOp::Write {
                payload,
                append: true,
                ..
            } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(appends.len(), 1);
    assert_eq!(&appends[0][..], b"tail");
    assert_eq!(backend.stored_payload(&key(b"k")).unwrap(), &b"basetail"[..]);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_replacement_write_flushes_pending_appends_first() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = SlruCache::new(config(60_000), Arc::clone(&backend) as _).unwrap();

    cache.write(key(b"k"), b"ab", append_write(1)).await.unwrap();
    cache
        .write(
            key(b"k"),
            b"xy",
            WriteOptions {
                timestamp: Some(ts(2)),
                ..WriteOptions::default()
            },
        )
        .await
        .unwrap();

    let view = cache.read(key(b"k"), ReadOptions::default()).await.unwrap();
    assert_eq!(&view[..], b"xy");

    cache.stop().await.unwrap();

    // Backend effect order: the queued append first, then the replacement.
    let writes: Vec<_> = backend
        .recorded_ops()
        .into_iter()
        .filter_map(|op| match op {
            RecordedOp::Write {
                payload, append, ..
            } => Some((payload, append)),
            _ => None,
        })
        .collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(&writes[0].0[..], b"ab");
    assert!(writes[0].1);
    assert_eq!(&writes[1].0[..], b"xy");
    assert!(!writes[1].1);
    assert_eq!(backend.stored_payload(&key(b"k")).unwrap(), &b"xy"[..]);
}

#[tokio::test]
async fn test_append_over_dirty_replacement_syncs_base_first() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = SlruCache::new(config(60_000), Arc::clone(&backend) as _).unwrap();

    cache
        .write(
            key(b"k"),
            b"base",
            WriteOptions {
                timestamp: Some(ts(1)),
                ..WriteOptions::default()
            },
        )
        .await
        .unwrap();
    cache.write(key(b"k"), b"tail", append_write(2)).await.unwrap();

    let view = cache.read(key(b"k"), ReadOptions::default()).await.unwrap();
    assert_eq!(&view[..], b"basetail");

    // The dirty replacement reached the backend before the append began
    // accumulating, so the append lands on synced bytes.
    let writes: Vec<_> = backend
        .recorded_ops()
        .into_iter()
        .filter_map(|op| match op {
            RecordedOp::Write {
                payload, append, ..
            } => Some((payload, append)),
            _ => None,
        })
        .collect();
    assert_eq!(writes.len(), 2);
    assert_eq!(&writes[0].0[..], b"base");
    assert!(!writes[0].1);
    assert_eq!(&writes[1].0[..], b"tail");
    assert!(writes[1].1);
    assert_eq!(backend.stored_payload(&key(b"k")).unwrap(), &b"basetail"[..]);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_syncs_append_tail() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = SlruCache::new(config(50), Arc::clone(&backend) as _).unwrap();

    cache.write(key(b"k"), b"ab", append_write(1)).await.unwrap();
    cache.write(key(b"k"), b"cd", append_write(2)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(backend.stored_payload(&key(b"k")).unwrap(), &b"abcd"[..]);
    // After the sync the entry is clean; further appends start a new tail.
    cache.write(key(b"k"), b"ef", append_write(3)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.stored_payload(&key(b"k")).unwrap(), &b"abcdef"[..]);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_interleaved_appends_to_different_keys_stay_ordered() {
    let backend = Arc::new(MemoryBackend::new());
    let cache = SlruCache::new(config(60_000), Arc::clone(&backend) as _).unwrap();

    cache.write(key(b"a"), b"a1", append_write(1)).await.unwrap();
    cache.write(key(b"b"), b"b1", append_write(1)).await.unwrap();
    cache.write(key(b"a"), b"a2", append_write(2)).await.unwrap();
    cache.write(key(b"b"), b"b2", append_write(2)).await.unwrap();

    cache.stop().await.unwrap();

    assert_eq!(backend.stored_payload(&key(b"a")).unwrap(), &b"a1a2"[..]);
    assert_eq!(backend.stored_payload(&key(b"b")).unwrap(), &b"b1b2"[..]);
}
