//! Client-side content cache for a remote file system
//!
//! - [`cache`]: tiered TTL/LRU engine for file contents and directory listings
//! - [`store`]: cold tier backends
//! - [`sync`]: invalidation fan-out between sibling cache contexts
//! - [`watcher`]: turns remote change notifications into invalidations
//! - [`facade`]: typed application API

pub mod cache;
pub mod error;
pub mod facade;
pub mod logging;
pub mod store;
pub mod sync;
pub mod watcher;

pub use cache::{
    CacheConfig, CacheConfigUpdate, CacheEngine, CacheEntry, CacheKey, CacheStats,
    DirectoryContent, EntryKind, FileContent, FileNode, Payload, SetOptions, WriteIntent,
};
pub use error::{CacheError, Result};
pub use facade::CacheFacade;
pub use store::{DiskStore, MemoryStore, PersistentStore, StoreError};
pub use sync::{Broadcaster, LocalBroadcaster, NoopBroadcaster, SyncMessage, SyncOp};
pub use watcher::{ChangeEvent, ChangeKind, ChangeWatcher, RemoteEvent, WatcherConfig, WatcherHandle};
