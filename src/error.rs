//! Cache Error Types
//!
//! Structured errors for the cache engine and its collaborators.
//! Most failures never reach callers: they are logged and folded into a miss.

use crate::store::StoreError;

/// Cache error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cold tier error: {0}")]
    Store(#[from] StoreError),

    #[error("Malformed cache record: {0}")]
    Codec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Broadcast failed: {0}")]
    Broadcast(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// Whether the failure should be treated as a plain cache miss
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            CacheError::Store(_) | CacheError::Codec(_) | CacheError::Io(_)
        )
    }

    /// Whether the failing record should be deleted from the cold tier
    pub fn is_corrupt_record(&self) -> bool {
        matches!(self, CacheError::Codec(_))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Codec(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, CacheError>;
