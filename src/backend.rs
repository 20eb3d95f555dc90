//! Storage Backend Module
//!
//! The seam between the cache and the node's on-disk store. The cache
//! invokes these four operations with its lock released; implementations
//! are free to block on real I/O.
//!
//! `MemoryBackend` is the in-process reference implementation. It keeps
//! records in a map, honors the append opcode, and records every call it
//! receives, which is what the write-back and single-flight tests observe.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::entry::RecordTimestamp;
use crate::key::CacheKey;

/// Backend operation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("record not found")]
    NotFound,

    #[error("backend I/O error: {0}")]
    Io(String),
}

/// Result type for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A full record as returned by [`StorageBackend::read`].
#[derive(Debug, Clone)]
pub struct BackendRecord {
    pub payload: Bytes,
    pub user_flags: u64,
    pub timestamp: RecordTimestamp,
}

/// Record metadata as returned by [`StorageBackend::lookup`].
#[derive(Debug, Clone)]
pub struct BackendMeta {
    pub size: u64,
    pub user_flags: u64,
    pub timestamp: RecordTimestamp,
}

/// The four operations the cache requires of the backing store.
///
/// Never called while the cache lock is held.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch a whole record.
    async fn read(&self, key: &CacheKey) -> BackendResult<BackendRecord>;

    /// Store a record. With `append` set, `payload` is concatenated onto
    /// whatever the store already holds (creating the record if absent);
    /// otherwise it replaces the record.
    async fn write(
        &self,
        key: &CacheKey,
        payload: &[u8],
        user_flags: u64,
        timestamp: RecordTimestamp,
        append: bool,
    ) -> BackendResult<()>;

    /// Delete a record.
    async fn remove(&self, key: &CacheKey) -> BackendResult<()>;

    /// Fetch record metadata without the payload.
    async fn lookup(&self, key: &CacheKey) -> BackendResult<BackendMeta>;
}

/// One call observed by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    Read(CacheKey),
    Write {
        key: CacheKey,
        payload: Bytes,
        append: bool,
    },
    Remove(CacheKey),
    Lookup(CacheKey),
}

#[derive(Debug, Clone)]
struct StoredRecord {
    payload: Bytes,
    user_flags: u64,
    timestamp: RecordTimestamp,
}

/// In-memory [`StorageBackend`] that records the calls it receives.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<CacheKey, StoredRecord>>,
    ops: Mutex<Vec<RecordedOp>>,
    read_delay: Option<Duration>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `read` before touching the store.
    /// Lets tests hold a populate in flight while issuing more requests.
    pub fn with_read_delay(read_delay: Duration) -> Self {
        Self {
            read_delay: Some(read_delay),
            ..Self::default()
        }
    }

    /// Seed a record directly, without going through `write`.
    pub fn seed(&self, key: CacheKey, payload: &[u8], user_flags: u64, timestamp: RecordTimestamp) {
        self.records.lock().unwrap().insert(
            key,
            StoredRecord {
                payload: Bytes::copy_from_slice(payload),
                user_flags,
                timestamp,
            },
        );
    }

    /// When set, every `write` and `remove` fails with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Payload currently stored for a key, if any.
    pub fn stored_payload(&self, key: &CacheKey) -> Option<Bytes> {
        self.records
            .lock()
            .unwrap()
            .get(key)
            .map(|r| r.payload.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.records.lock().unwrap().contains_key(key)
    }

    /// Every call observed so far, in arrival order.
    pub fn recorded_ops(&self) -> Vec<RecordedOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Number of `read` calls observed for a key.
    pub fn read_count(&self, key: &CacheKey) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, RecordedOp::Read(k) if k == key))
            .count()
    }

    /// Number of `write` calls observed for a key.
    pub fn write_count(&self, key: &CacheKey) -> usize {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter(|op| matches!(op, RecordedOp::Write { key: k, .. } if k == key))
            .count()
    }

    fn record_op(&self, op: RecordedOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, key: &CacheKey) -> BackendResult<BackendRecord> {
        self.record_op(RecordedOp::Read(*key));
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }

        let records = self.records.lock().unwrap();
        let record = records.get(key).ok_or(BackendError::NotFound)?;
        Ok(BackendRecord {
            payload: record.payload.clone(),
            user_flags: record.user_flags,
            timestamp: record.timestamp,
        })
    }

    async fn write(
        &self,
        key: &CacheKey,
        payload: &[u8],
        user_flags: u64,
        timestamp: RecordTimestamp,
        append: bool,
    ) -> BackendResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Io("injected write failure".to_string()));
        }
        self.record_op(RecordedOp::Write {
            key: *key,
            payload: Bytes::copy_from_slice(payload),
            append,
        });

        let mut records = self.records.lock().unwrap();
        match records.get_mut(key) {
            Some(record) if append => {
                let mut combined = BytesMut::with_capacity(record.payload.len() + payload.len());
                combined.extend_from_slice(&record.payload);
                combined.extend_from_slice(payload);
                record.payload = combined.freeze();
                record.user_flags = user_flags;
                record.timestamp = timestamp;
            }
            _ => {
                records.insert(
                    *key,
                    StoredRecord {
                        payload: Bytes::copy_from_slice(payload),
                        user_flags,
                        timestamp,
                    },
                );
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> BackendResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::Io("injected remove failure".to_string()));
        }
        self.record_op(RecordedOp::Remove(*key));

        match self.records.lock().unwrap().remove(key) {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound),
        }
    }

    async fn lookup(&self, key: &CacheKey) -> BackendResult<BackendMeta> {
        self.record_op(RecordedOp::Lookup(*key));

        let records = self.records.lock().unwrap();
        let record = records.get(key).ok_or(BackendError::NotFound)?;
        Ok(BackendMeta {
            size: record.payload.len() as u64,
            user_flags: record.user_flags,
            timestamp: record.timestamp,
        })
    }
}
