//! Cache Facade
//!
//! Typed entry point for applications. The engine is built on first use, so
//! configuration supplied through [`CacheFacade::configure`] before then is
//! honoured; afterwards `configure` behaves like `update_config`.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{
    CacheConfig, CacheConfigUpdate, CacheEngine, CacheEntry, CacheKey, CacheStats,
    DirectoryContent, FileContent, SetOptions,
};
use crate::error::Result;
use crate::store::PersistentStore;
use crate::sync::Broadcaster;
use crate::watcher::{ChangeWatcher, WatcherConfig, WatcherHandle};

/// Application-facing cache API
pub struct CacheFacade {
    /// Configuration used when the engine is first built
    pending: Mutex<CacheConfig>,
    cold_tier: Option<Arc<dyn PersistentStore>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    engine: OnceCell<Arc<CacheEngine>>,
    /// Sweeper and sync listener, aborted on drop
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheFacade {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(CacheConfig::default()),
            cold_tier: None,
            broadcaster: None,
            engine: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start from an explicit configuration
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let facade = Self::new();
        *facade.pending.lock().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(facade)
    }

    pub fn with_cold_tier(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.cold_tier = Some(store);
        self
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// The engine, built on first call
    pub async fn engine(&self) -> Result<Arc<CacheEngine>> {
        let engine = self
            .engine
            .get_or_try_init(|| async { self.build_engine() })
            .await?;
        Ok(Arc::clone(engine))
    }

    fn build_engine(&self) -> Result<Arc<CacheEngine>> {
        let config = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut engine = CacheEngine::new(config)?;
        if let Some(store) = &self.cold_tier {
            engine = engine.with_cold_tier(Arc::clone(store));
        }
        if let Some(broadcaster) = &self.broadcaster {
            engine = engine.with_broadcaster(Arc::clone(broadcaster));
        }
        let engine = Arc::new(engine);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(engine.spawn_sweeper());
        if let Some(listener) = engine.spawn_sync_listener() {
            tasks.push(listener);
        }

        info!(context = %engine.context_id(), "Cache facade ready");
        Ok(engine)
    }

    /// Supply configuration; applied live once the engine exists
    pub async fn configure(&self, update: &CacheConfigUpdate) -> Result<()> {
        if let Some(engine) = self.engine.get() {
            return engine.update_config(update).await;
        }

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let next = pending.merged(update);
        next.validate()?;
        *pending = next;
        debug!("Stored configuration for deferred engine start");
        Ok(())
    }

    pub async fn update_config(&self, update: &CacheConfigUpdate) -> Result<()> {
        self.engine().await?.update_config(update).await
    }

    /// Start a change watcher bound to this cache
    pub async fn start_watcher(&self, config: WatcherConfig) -> Result<WatcherHandle> {
        Ok(ChangeWatcher::spawn(self.engine().await?, config))
    }

    /// Report whether the remote is reachable; see [`CacheEngine::set_offline`]
    pub async fn set_offline(&self, offline: bool) -> Result<()> {
        self.engine().await?.set_offline(offline);
        Ok(())
    }

    /// Fresh lookup; while offline (with offline mode on) an expired entry
    /// is served and kept
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let engine = self.engine().await?;

        if engine.serves_stale() {
            if let Some(entry) = engine.peek(key, true).await {
                if entry.is_expired_at(Instant::now()) {
                    debug!(key = %key, "Serving stale entry (offline)");
                    return Ok(Some(entry));
                }
            }
        }
        Ok(engine.get(key).await)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub async fn get_file(&self, path: &str) -> Result<Option<FileContent>> {
        let entry = self.lookup(&CacheKey::file(path)).await?;
        Ok(entry.and_then(CacheEntry::into_file))
    }

    /// Like [`get_file`](Self::get_file) but never returns a truncated prefix
    pub async fn get_complete_file(&self, path: &str) -> Result<Option<FileContent>> {
        let file = self.get_file(path).await?;
        Ok(file.filter(FileContent::is_complete))
    }

    pub async fn peek_file(&self, path: &str, allow_stale: bool) -> Result<Option<FileContent>> {
        let engine = self.engine().await?;
        let entry = engine.peek(&CacheKey::file(path), allow_stale).await;
        Ok(entry.and_then(CacheEntry::into_file))
    }

    /// Cache content the user is looking at now
    pub async fn set_file(&self, file: FileContent, version_hint: Option<String>) -> Result<()> {
        let options = SetOptions {
            remote_version_hint: version_hint,
            ..SetOptions::default()
        };
        let engine = self.engine().await?;
        engine
            .set(CacheKey::file(&file.path), file.into(), options)
            .await;
        Ok(())
    }

    /// Cache content fetched ahead of need; returns whether it was accepted
    pub async fn prefetch_file(&self, file: FileContent, version_hint: Option<String>) -> Result<bool> {
        let engine = self.engine().await?;
        if !engine.config().enable_prefetch {
            debug!(path = %file.path, "Prefetch disabled, skipping");
            return Ok(false);
        }
        let options = SetOptions {
            remote_version_hint: version_hint,
            ..SetOptions::prefetch()
        };
        engine
            .set(CacheKey::file(&file.path), file.into(), options)
            .await;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    pub async fn get_directory(&self, path: &str) -> Result<Option<DirectoryContent>> {
        let entry = self.lookup(&CacheKey::directory(path)).await?;
        Ok(entry.and_then(CacheEntry::into_directory))
    }

    /// Like [`get_directory`](Self::get_directory) but never returns a partial page
    pub async fn get_complete_directory(&self, path: &str) -> Result<Option<DirectoryContent>> {
        let dir = self.get_directory(path).await?;
        Ok(dir.filter(DirectoryContent::is_complete_listing))
    }

    pub async fn peek_directory(
        &self,
        path: &str,
        allow_stale: bool,
    ) -> Result<Option<DirectoryContent>> {
        let engine = self.engine().await?;
        let entry = engine.peek(&CacheKey::directory(path), allow_stale).await;
        Ok(entry.and_then(CacheEntry::into_directory))
    }

    pub async fn set_directory(
        &self,
        dir: DirectoryContent,
        version_hint: Option<String>,
    ) -> Result<()> {
        let options = SetOptions {
            remote_version_hint: version_hint,
            ..SetOptions::default()
        };
        let engine = self.engine().await?;
        engine
            .set(CacheKey::directory(&dir.path), dir.into(), options)
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invalidation and stats
    // ------------------------------------------------------------------

    pub async fn invalidate_path(&self, path: &str) -> Result<()> {
        self.engine().await?.invalidate(path).await;
        Ok(())
    }

    pub async fn invalidate_hierarchy(&self, path: &str) -> Result<()> {
        self.engine().await?.invalidate_hierarchy(path).await;
        Ok(())
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.engine().await?.clear().await;
        Ok(())
    }

    pub async fn get_cache_stats(&self) -> Result<CacheStats> {
        Ok(self.engine().await?.get_cache_stats())
    }
}

impl Default for CacheFacade {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CacheFacade {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
