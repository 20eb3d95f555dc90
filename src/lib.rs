//! Segmented-LRU write-back cache for a distributed-storage node.
//!
//! This library sits in front of a node's on-disk backend: reads, writes,
//! lookups, and removes land in memory first, cold entries are evicted
//! under page budgets, and a background lifecycle worker writes dirty or
//! expired entries back to the [`backend::StorageBackend`] collaborator.

pub mod backend;
pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
mod index;
pub mod key;
mod lifecycle;
mod pages;
mod populate;
pub mod stats;

pub use backend::{
    BackendError, BackendMeta, BackendRecord, MemoryBackend, RecordedOp, StorageBackend,
};
pub use cache::{ReadOptions, SlruCache, WriteOptions};
pub use config::CacheConfig;
pub use entry::{EntryInfo, RecordTimestamp};
pub use error::{CacheError, Result};
pub use key::{CacheKey, KEY_SIZE};
pub use stats::CacheStatsSnapshot;
