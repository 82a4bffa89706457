//! Cache data model
//!
//! Keys, payloads and entries held by the cache engine. Callers always
//! receive clones of entries, never handles into the engine's table.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::path;

/// Fixed per-node overhead used when sizing directory listings
const NODE_OVERHEAD: u64 = 48;

/// Whether a key refers to file content or a directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    fn prefix(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "file" => Some(EntryKind::File),
            "dir" => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

/// Identity of a cached entry: kind plus canonical remote path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: EntryKind,
    path: String,
}

impl CacheKey {
    /// Build a key, normalizing `path`
    pub fn new(kind: EntryKind, path: &str) -> Self {
        Self {
            kind,
            path: path::normalize(path),
        }
    }

    pub fn file(path: &str) -> Self {
        Self::new(EntryKind::File, path)
    }

    pub fn directory(path: &str) -> Self {
        Self::new(EntryKind::Directory, path)
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Opaque string form, used as the cold tier key
    pub fn storage_key(&self) -> String {
        self.to_string()
    }

    /// Parse a cold tier key; `None` for keys this crate did not write
    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (prefix, path) = key.split_once(':')?;
        let kind = EntryKind::from_prefix(prefix)?;
        if !path.starts_with('/') {
            return None;
        }
        Some(Self::new(kind, path))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.prefix(), self.path)
    }
}

/// Content of a remote file (possibly only a prefix of it)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub path: String,
    pub content: String,
    /// Size of the remote file in bytes
    pub size_bytes: u64,
    /// `content` is a prefix of a larger remote file
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

impl FileContent {
    /// Complete, untruncated content
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            size_bytes: content.len() as u64,
            content,
            truncated: false,
            mime_type: None,
            encoding: None,
        }
    }

    /// Only a prefix of a remote file of `remote_size` bytes
    pub fn truncated(path: impl Into<String>, prefix: impl Into<String>, remote_size: u64) -> Self {
        Self {
            truncated: true,
            size_bytes: remote_size,
            ..Self::new(path, prefix)
        }
    }

    /// Whether this payload can answer size or full-content questions
    pub fn is_complete(&self) -> bool {
        !self.truncated
    }
}

/// A child listed in a directory snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    pub name: String,
    pub path: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

/// A (possibly paginated) directory listing snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryContent {
    pub path: String,
    pub children: Vec<FileNode>,
    pub total_count: u64,
    /// More children exist beyond this page
    pub has_more: bool,
}

impl DirectoryContent {
    /// A complete listing of `children`
    pub fn new(path: impl Into<String>, children: Vec<FileNode>) -> Self {
        Self {
            path: path.into(),
            total_count: children.len() as u64,
            children,
            has_more: false,
        }
    }

    /// Whether this listing holds every child of the directory
    pub fn is_complete_listing(&self) -> bool {
        !self.has_more
    }
}

/// Cached payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Payload {
    File(FileContent),
    Directory(DirectoryContent),
}

impl Payload {
    pub fn kind(&self) -> EntryKind {
        match self {
            Payload::File(_) => EntryKind::File,
            Payload::Directory(_) => EntryKind::Directory,
        }
    }

    /// Approximate memory footprint of the payload in bytes
    pub fn size_bytes(&self) -> u64 {
        fn opt_len(s: &Option<String>) -> u64 {
            s.as_ref().map(|s| s.len() as u64).unwrap_or(0)
        }

        match self {
            Payload::File(file) => {
                file.content.len() as u64
                    + file.path.len() as u64
                    + opt_len(&file.mime_type)
                    + opt_len(&file.encoding)
            }
            Payload::Directory(dir) => {
                dir.path.len() as u64
                    + dir
                        .children
                        .iter()
                        .map(|node| node.name.len() as u64 + node.path.len() as u64 + NODE_OVERHEAD)
                        .sum::<u64>()
            }
        }
    }

    pub fn as_file(&self) -> Option<&FileContent> {
        match self {
            Payload::File(file) => Some(file),
            Payload::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<&DirectoryContent> {
        match self {
            Payload::Directory(dir) => Some(dir),
            Payload::File(_) => None,
        }
    }
}

impl From<FileContent> for Payload {
    fn from(file: FileContent) -> Self {
        Payload::File(file)
    }
}

impl From<DirectoryContent> for Payload {
    fn from(dir: DirectoryContent) -> Self {
        Payload::Directory(dir)
    }
}

/// A cached entry with its freshness and access bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Payload,
    /// Reset on every write
    pub created_at: Instant,
    /// Updated on every hit
    pub last_accessed_at: Instant,
    pub access_count: u64,
    pub ttl: Duration,
    pub size_bytes: u64,
    /// Opaque etag/mtime token from the remote, compared only for equality
    pub remote_version_hint: Option<String>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, payload: Payload, ttl: Duration, now: Instant) -> Self {
        let size_bytes = payload.size_bytes();
        Self {
            key,
            payload,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            ttl,
            size_bytes,
            remote_version_hint: None,
        }
    }

    /// Whether the TTL has elapsed at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    /// Remaining lifetime at `now`, zero once expired
    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.created_at))
    }

    /// Record a hit
    pub fn mark_accessed(&mut self, now: Instant) {
        self.last_accessed_at = now;
        self.access_count += 1;
    }

    pub fn as_file(&self) -> Option<&FileContent> {
        self.payload.as_file()
    }

    pub fn as_directory(&self) -> Option<&DirectoryContent> {
        self.payload.as_directory()
    }

    pub fn into_file(self) -> Option<FileContent> {
        match self.payload {
            Payload::File(file) => Some(file),
            Payload::Directory(_) => None,
        }
    }

    pub fn into_directory(self) -> Option<DirectoryContent> {
        match self.payload {
            Payload::Directory(dir) => Some(dir),
            Payload::File(_) => None,
        }
    }
}

/// Aggregate cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries resident in the memory tier
    pub memory_entries: usize,
    /// Entries this engine placed in the cold tier
    pub cold_entries: usize,
    /// Bytes held by the memory tier
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0.0 before any lookup
    pub hit_rate: f64,
    pub evictions: u64,
    pub demotions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

impl CacheStats {
    /// Live entries across both tiers
    pub fn total_entries(&self) -> usize {
        self.memory_entries + self.cold_entries
    }
}
