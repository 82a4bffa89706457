//! On-disk cold tier
//!
//! Keeps cold-tier records as individual files under the platform cache
//! directory. Each file starts with an 8-byte big-endian expiry timestamp
//! (milliseconds since the Unix epoch) and a 4-byte big-endian key length,
//! followed by the key and then the raw value.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::{PersistentStore, StoreError};

/// Size of the fixed header (expiry + key length) in bytes
const HEADER_LEN: usize = 12;

/// Extension used for in-flight writes
const TEMP_SUFFIX: &str = ".tmp";

/// Disk-backed implementation of [`PersistentStore`]
#[derive(Clone)]
pub struct DiskStore {
    /// Root directory for stored records
    root: Arc<PathBuf>,
}

impl DiskStore {
    /// Open the store for a namespace under the user's cache directory
    ///
    /// # Arguments
    /// * `namespace` - Subdirectory name, typically one per workspace
    pub fn open(namespace: &str) -> Result<Self> {
        let root = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("remote-fs-cache")
            .join(namespace);

        Self::with_dir(root)
    }

    /// Open the store rooted at an explicit directory
    pub fn with_dir(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cold tier directory: {:?}", root))?;

        let store = Self {
            root: Arc::new(root),
        };

        // Clean up any stale temp files from previous runs
        store.cleanup();

        info!(root = %store.root.display(), "Disk store initialized");
        Ok(store)
    }

    /// Directory holding the records
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove temp files left behind by interrupted writes
    pub fn cleanup(&self) {
        if let Ok(read_dir) = fs::read_dir(self.root.as_path()) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                let is_temp = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.ends_with(TEMP_SUFFIX))
                    .unwrap_or(false);
                if is_temp {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    /// File holding the record for `key`
    fn record_path(root: &Path, key: &str) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(key.as_bytes());
        root.join(format!("{:x}", hasher.finalize()))
    }

    /// Split a record into expiry, key and value, `None` if truncated
    fn parse_record(data: &[u8]) -> Option<(u64, &str, &[u8])> {
        let (expiry, rest) = data.split_first_chunk::<8>()?;
        let (key_len, rest) = rest.split_first_chunk::<4>()?;
        let key_len = u32::from_be_bytes(*key_len) as usize;
        if rest.len() < key_len {
            return None;
        }
        let (key, value) = rest.split_at(key_len);
        let key = std::str::from_utf8(key).ok()?;
        Some((u64::from_be_bytes(*expiry), key, value))
    }

    fn read_record(root: &Path, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = Self::record_path(root, key);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let Some((expires_at, stored_key, value)) = Self::parse_record(&data) else {
            warn!(key = key, "Truncated cold tier record, removing");
            let _ = fs::remove_file(&path);
            return Ok(None);
        };

        if stored_key != key {
            warn!(key = key, stored = stored_key, "Cold tier record under foreign key, removing");
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        if now_millis() >= expires_at {
            debug!(key = key, "Cold tier record expired");
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        Ok(Some(value.to_vec()))
    }

    /// Read only the header and key of a record file
    fn read_key(path: &Path) -> std::io::Result<Option<(u64, String)>> {
        let mut file = fs::File::open(path)?;
        let mut header = [0u8; HEADER_LEN];
        if file.read_exact(&mut header).is_err() {
            return Ok(None);
        }
        let expires_at = u64::from_be_bytes([
            header[0], header[1], header[2], header[3], header[4], header[5], header[6], header[7],
        ]);
        let key_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;

        let mut key = vec![0u8; key_len];
        if file.read_exact(&mut key).is_err() {
            return Ok(None);
        }
        Ok(String::from_utf8(key).ok().map(|key| (expires_at, key)))
    }

    fn list_keys(root: &Path) -> Result<Vec<String>, StoreError> {
        let now = now_millis();
        let mut keys = Vec::new();

        for entry in fs::read_dir(root)?.flatten() {
            let path = entry.path();
            let is_record = path.is_file()
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.ends_with(TEMP_SUFFIX))
                    .unwrap_or(true);
            if !is_record {
                continue;
            }

            match Self::read_key(&path) {
                Ok(Some((expires_at, key))) if now < expires_at => keys.push(key),
                Ok(_) => {
                    let _ = fs::remove_file(&path);
                }
                // Removed by a concurrent delete
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(keys)
    }

    fn write_record(root: &Path, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let path = Self::record_path(root, key);
        let expires_at = now_millis().saturating_add(ttl.as_millis() as u64);

        // Write atomically using tempfile
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(TEMP_SUFFIX)
            .tempfile_in(root)?;
        let key_len = u32::try_from(key.len())
            .map_err(|_| StoreError::Backend(format!("key too long: {} bytes", key.len())))?;
        tmp.write_all(&expires_at.to_be_bytes())?;
        tmp.write_all(&key_len.to_be_bytes())?;
        tmp.write_all(key.as_bytes())?;
        tmp.write_all(value)?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;

        debug!(key = key, size = value.len(), "Stored record on disk");
        Ok(())
    }

    fn remove_record(root: &Path, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(Self::record_path(root, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn remove_all(root: &Path) -> Result<(), StoreError> {
        for entry in fs::read_dir(root)?.flatten() {
            let path = entry.path();
            if path.is_file() {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove cold tier record");
                }
            }
        }
        info!(root = %root.display(), "Cleared disk store");
        Ok(())
    }

    /// Run blocking file work off the async executor
    async fn blocking<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let root = Arc::clone(&self.root);
        tokio::task::spawn_blocking(move || work(root.as_path()))
            .await
            .map_err(|e| StoreError::Backend(format!("disk task failed: {}", e)))?
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl PersistentStore for DiskStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.blocking(move |root| Self::read_record(root, &key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |root| Self::write_record(root, &key, &value, ttl))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.blocking(move |root| Self::remove_record(root, &key)).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.blocking(Self::remove_all).await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.blocking(Self::list_keys).await
    }
}
