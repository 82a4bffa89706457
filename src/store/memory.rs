//! In-process cold tier
//!
//! Bounded byte store backed by Moka. Each record expires after the TTL it
//! was written with; total size is bounded by a byte weigher.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;
use tracing::{debug, trace};

use super::{PersistentStore, StoreError};

/// Default byte budget: 256 MB
const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;

/// A stored record and the lifetime it was written with
#[derive(Clone, Debug)]
struct StoredBlob {
    bytes: Vec<u8>,
    ttl: Duration,
}

/// Expires each record after its own TTL
struct PerRecordTtl;

impl Expiry<String, StoredBlob> for PerRecordTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredBlob,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredBlob,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Moka-backed in-memory implementation of [`PersistentStore`]
pub struct MemoryStore {
    blobs: Cache<String, StoredBlob>,
}

impl MemoryStore {
    /// Create a store with the default byte budget
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_BYTES)
    }

    /// Create a store bounded to `max_bytes` of stored values
    pub fn with_capacity(max_bytes: u64) -> Self {
        let blobs = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, blob: &StoredBlob| -> u32 {
                (key.len() + blob.bytes.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(PerRecordTtl)
            .name("cold_tier_memory_store")
            .build();

        Self { blobs }
    }

    /// Number of records currently held (approximate, as reported by Moka)
    pub fn entry_count(&self) -> u64 {
        self.blobs.run_pending_tasks();
        self.blobs.entry_count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let found = self.blobs.get(key).map(|blob| blob.bytes);
        trace!(key = key, hit = found.is_some(), "Memory store lookup");
        Ok(found)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        debug!(key = key, size = value.len(), ttl_ms = ttl.as_millis() as u64, "Memory store write");
        self.blobs
            .insert(key.to_string(), StoredBlob { bytes: value, ttl });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.invalidate(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.blobs.invalidate_all();
        debug!("Cleared memory store");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.blobs.iter().map(|(key, _)| key.as_ref().clone()).collect())
    }
}
