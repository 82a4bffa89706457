//! Content caching layer
//!
//! Tiered cache for remote file contents and directory listings: a bounded
//! in-memory tier with TTL and LRU eviction, backed by an optional cold tier.
//! Keeps round trips to the remote file system off the interactive path.

pub mod codec;
pub mod config;
pub mod engine;
pub mod path;
pub mod types;

pub use config::{CacheConfig, CacheConfigUpdate};
pub use engine::{CacheEngine, SetOptions, WriteIntent};
pub use types::{
    CacheEntry, CacheKey, CacheStats, DirectoryContent, EntryKind, FileContent, FileNode, Payload,
};
