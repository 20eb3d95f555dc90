//! Error Module
//!
//! Defines the error and result types used throughout the cache.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,

    #[error("read range out of bounds: {0}")]
    BadRange(String),

    #[error("compare-and-swap timestamp mismatch")]
    CasMismatch,

    #[error("write rejected: backend holds newer data")]
    Stale,

    #[error("backend I/O error: {0}")]
    Io(String),

    #[error("cache is stopped")]
    Stopped,

    #[error("entry exceeds page budget: {0}")]
    Budget(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<crate::backend::BackendError> for CacheError {
    fn from(err: crate::backend::BackendError) -> Self {
        match err {
            crate::backend::BackendError::NotFound => CacheError::NotFound,
            crate::backend::BackendError::Io(msg) => CacheError::Io(msg),
        }
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;
