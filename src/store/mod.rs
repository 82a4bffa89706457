//! Cold tier storage
//!
//! The cache engine keeps overflow and long-lived entries in a pluggable
//! key-value byte store. The engine never assumes exclusive access to it.

pub mod disk;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Cold tier error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store unavailable")]
    Unavailable,

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Key-value byte store used as the cold tier
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read the bytes stored under `key`, `None` if absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store bytes under `key` for at most `ttl`
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Remove `key` if present
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Remove every key
    async fn clear(&self) -> Result<(), StoreError>;

    /// Every live key, including keys written by other processes
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}
