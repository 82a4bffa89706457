//! Cache Engine
//!
//! Owns the memory tier, TTL policy, size/LRU eviction and the read, write
//! and invalidation paths. Oversized and evicted entries go to an optional
//! cold tier ([`PersistentStore`]); invalidations are replicated to sibling
//! contexts through a [`Broadcaster`].
//!
//! The memory tier lock is only ever held for synchronous table work and is
//! released before any cold tier or broadcast round trip.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::codec;
use super::config::{CacheConfig, CacheConfigUpdate};
use super::path;
use super::types::{CacheEntry, CacheKey, CacheStats, EntryKind, Payload};
use crate::error::Result;
use crate::store::PersistentStore;
use crate::sync::{Broadcaster, NoopBroadcaster, SyncMessage, SyncOp};

/// Source of per-engine context ids
static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Why an entry is being written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteIntent {
    /// The user is looking at this data now
    #[default]
    Interactive,
    /// Speculative fetch ahead of the user
    Prefetch,
}

/// Options for [`CacheEngine::set`]
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub intent: WriteIntent,
    /// Opaque etag/mtime token reported by the remote
    pub remote_version_hint: Option<String>,
}

impl SetOptions {
    pub fn prefetch() -> Self {
        Self {
            intent: WriteIntent::Prefetch,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, hint: impl Into<String>) -> Self {
        self.remote_version_hint = Some(hint.into());
        self
    }
}

/// A memory tier slot
#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    /// Logical clock of the last write or hit, breaks timestamp ties
    touched: u64,
}

/// The in-memory entry table and its size accounting
#[derive(Debug, Default)]
struct MemoryTier {
    slots: HashMap<CacheKey, Slot>,
    total_bytes: u64,
    /// Keys this engine wrote to the cold tier
    cold_keys: HashSet<CacheKey>,
    clock: u64,
    /// Bumped by every invalidation and clear; cold tier round trips that
    /// straddle a bump are discarded
    generation: u64,
}

impl MemoryTier {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        let touched = self.tick();
        self.total_bytes += entry.size_bytes;
        let old = self
            .slots
            .insert(entry.key.clone(), Slot { entry, touched })
            .map(|slot| slot.entry);
        if let Some(old) = &old {
            self.total_bytes = self.total_bytes.saturating_sub(old.size_bytes);
        }
        old
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot.entry)
    }

    fn hit(&mut self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        let touched = self.tick();
        let slot = self.slots.get_mut(key)?;
        slot.entry.mark_accessed(now);
        slot.touched = touched;
        Some(slot.entry.clone())
    }

    fn within(&self, config: &CacheConfig) -> bool {
        self.total_bytes <= config.max_cache_size && self.slots.len() <= config.max_files
    }

    fn invalidated(&mut self) {
        self.generation += 1;
    }

    fn clear(&mut self) -> usize {
        self.invalidated();
        let count = self.slots.len();
        self.slots.clear();
        self.cold_keys.clear();
        self.total_bytes = 0;
        count
    }
}

/// Outcome of an eviction pass
#[derive(Debug, Default)]
struct EvictionPass {
    expired: u64,
    victims: Vec<CacheEntry>,
    /// Generation the victims were removed under
    generation: u64,
}

/// Tiered TTL/LRU cache for remote file and directory content
pub struct CacheEngine {
    /// Identifies this engine in broadcast messages
    context_id: String,
    config: RwLock<CacheConfig>,
    memory: Mutex<MemoryTier>,
    cold_tier: Option<Arc<dyn PersistentStore>>,
    broadcaster: Arc<dyn Broadcaster>,
    /// Remote link reported down by the host
    offline: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    demotions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheEngine {
    /// Create an engine with no cold tier and no sibling contexts
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let context_id = format!(
            "{}-{}",
            std::process::id(),
            NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)
        );

        info!(
            context = %context_id,
            max_cache_mb = config.max_cache_size / (1024 * 1024),
            max_files = config.max_files,
            "Cache engine initialized"
        );

        Ok(Self {
            context_id,
            config: RwLock::new(config),
            memory: Mutex::new(MemoryTier::default()),
            cold_tier: None,
            broadcaster: Arc::new(NoopBroadcaster),
            offline: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            demotions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Attach a cold tier store
    pub fn with_cold_tier(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.cold_tier = Some(store);
        self
    }

    /// Attach a cross-context broadcaster
    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn context_id(&self) -> &str {
        &self.context_id
    }

    /// Snapshot of the live configuration
    pub fn config(&self) -> CacheConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Report whether the remote is reachable
    ///
    /// With `enable_offline_mode`, expired entries are kept while offline so
    /// they can still be served stale.
    pub fn set_offline(&self, offline: bool) {
        if self.offline.swap(offline, Ordering::Relaxed) != offline {
            info!(offline = offline, "Remote link state changed");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    /// Whether expired entries should be served instead of dropped
    pub fn serves_stale(&self) -> bool {
        self.is_offline() && self.config().enable_offline_mode
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The cold tier, if attached and enabled
    fn cold(&self, config: &CacheConfig) -> Option<&Arc<dyn PersistentStore>> {
        self.cold_tier.as_ref().filter(|_| config.enable_cold_tier)
    }

    fn ttl_for(config: &CacheConfig, kind: EntryKind, intent: WriteIntent) -> Duration {
        match (kind, intent) {
            (EntryKind::Directory, _) => config.directory_ttl,
            (EntryKind::File, WriteIntent::Interactive) => config.active_file_ttl,
            (EntryKind::File, WriteIntent::Prefetch) => config.inactive_file_ttl,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Look up a fresh entry
    ///
    /// An expired memory entry is removed as a side effect, unless stale
    /// entries are being served (see [`serves_stale`](Self::serves_stale)). A memory miss
    /// falls through to the cold tier; cold hits that fit the memory tier
    /// are promoted back into it.
    pub async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let now = Instant::now();
        let keep_stale = self.serves_stale();

        {
            let mut memory = self.memory();
            let expired = match memory.slots.get(key) {
                Some(slot) => slot.entry.is_expired_at(now),
                None => false,
            };

            if expired && keep_stale {
                self.misses.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Cache MISS (stale entry kept while offline)");
                return None;
            } else if expired {
                memory.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "Dropped expired entry");
            } else if let Some(entry) = memory.hit(key, now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = %key, "Cache HIT (memory)");
                return Some(entry);
            }
        }

        if let Some(entry) = self.get_cold(key, now).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Cache HIT (cold tier)");
            return Some(entry);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key = %key, "Cache MISS");
        None
    }

    /// Look up an entry without side effects
    ///
    /// Never removes, never touches access bookkeeping. With `allow_stale`
    /// an expired entry is returned as-is (stale-while-revalidate);
    /// otherwise it is hidden but left in place.
    pub async fn peek(&self, key: &CacheKey, allow_stale: bool) -> Option<CacheEntry> {
        let now = Instant::now();

        {
            let memory = self.memory();
            if let Some(slot) = memory.slots.get(key) {
                if allow_stale || !slot.entry.is_expired_at(now) {
                    return Some(slot.entry.clone());
                }
                return None;
            }
        }

        let config = self.config();
        let store = self.cold(&config)?;
        match store.get(&key.storage_key()).await {
            Ok(Some(bytes)) => codec::decode(key, &bytes, now)
                .ok()
                .filter(|entry| allow_stale || !entry.is_expired_at(now)),
            Ok(None) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "Cold tier peek failed");
                None
            }
        }
    }

    /// Whether the cached entry for `key` is fresh and carries `version_hint`
    pub fn is_current(&self, key: &CacheKey, version_hint: &str) -> bool {
        let now = Instant::now();
        let memory = self.memory();
        memory
            .slots
            .get(key)
            .map(|slot| {
                !slot.entry.is_expired_at(now)
                    && slot.entry.remote_version_hint.as_deref() == Some(version_hint)
            })
            .unwrap_or(false)
    }

    /// Fetch, validate and possibly promote a cold tier record
    async fn get_cold(&self, key: &CacheKey, now: Instant) -> Option<CacheEntry> {
        let config = self.config();
        let store = Arc::clone(self.cold(&config)?);
        let storage_key = key.storage_key();
        let generation = self.memory().generation;

        let bytes = match store.get(&storage_key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                self.memory().cold_keys.remove(key);
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cold tier read failed, treating as miss");
                return None;
            }
        };

        let mut entry = match codec::decode(key, &bytes, now) {
            Ok(entry) => entry,
            Err(e) if e.is_corrupt_record() => {
                warn!(key = %key, error = %e, "Malformed cold tier record, deleting");
                self.delete_cold(&store, key).await;
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cold tier record unreadable, treating as miss");
                return None;
            }
        };

        if entry.is_expired_at(now) {
            self.delete_cold(&store, key).await;
            self.expirations.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.mark_accessed(now);

        // Promote; a write that raced us in wins over the cold copy
        let pass = {
            let mut memory = self.memory();
            if memory.generation != generation {
                debug!(key = %key, "Invalidated during cold tier read, discarding");
                return None;
            }
            if let Some(current) = memory.hit(key, now) {
                return Some(current);
            }
            if entry.size_bytes > config.max_file_size {
                return Some(entry);
            }
            memory.insert(entry.clone());
            self.enforce_limits(&mut memory, &config, now, Some(key))
        };
        debug!(key = %key, "Promoted cold tier entry");
        self.delete_cold(&store, key).await;
        self.finish_pass(pass, &config, now).await;

        Some(entry)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Insert or overwrite an entry
    ///
    /// Entries larger than `max_file_size` bypass the memory tier: they go to
    /// the cold tier when it is enabled and accepts them, otherwise they are
    /// dropped. Never fails; capacity problems only reduce what is cached.
    pub async fn set(&self, key: CacheKey, payload: Payload, options: SetOptions) {
        if payload.kind() != key.kind() {
            warn!(key = %key, "Refusing payload of the wrong kind");
            return;
        }

        let config = self.config();
        let now = Instant::now();
        let ttl = Self::ttl_for(&config, key.kind(), options.intent);
        let mut entry = CacheEntry::new(key.clone(), payload, ttl, now);
        entry.remote_version_hint = options.remote_version_hint;

        if entry.size_bytes > config.max_file_size {
            self.memory().remove(&key);
            if !self.set_cold_only(entry, &config, now).await {
                // An older cold copy must not outlive the rejected overwrite
                if let Some(store) = self.cold_tier.clone() {
                    self.delete_cold(&store, &key).await;
                }
            }
            return;
        }

        let (pass, had_cold_copy) = {
            let mut memory = self.memory();
            if let Some(previous) = memory.slots.get(&key) {
                entry.access_count = previous.entry.access_count;
            }
            memory.insert(entry);
            let had_cold_copy = memory.cold_keys.remove(&key);
            (self.enforce_limits(&mut memory, &config, now, Some(&key)), had_cold_copy)
        };

        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Cached entry");

        if had_cold_copy {
            if let Some(store) = self.cold(&config) {
                let store = Arc::clone(store);
                self.delete_cold(&store, &key).await;
            }
        }
        self.finish_pass(pass, &config, now).await;
    }

    /// Write an oversized entry straight to the cold tier; `false` if it was dropped
    async fn set_cold_only(&self, entry: CacheEntry, config: &CacheConfig, now: Instant) -> bool {
        let store = match self.cold(config) {
            Some(store) if entry.size_bytes <= config.cold_tier_max_entry_size => Arc::clone(store),
            _ => {
                warn!(
                    key = %entry.key,
                    size = entry.size_bytes,
                    max = config.max_file_size,
                    "Entry too large to cache, dropped"
                );
                return false;
            }
        };

        debug!(key = %entry.key, size = entry.size_bytes, "Entry exceeds memory ceiling, writing to cold tier");
        if !self.write_cold(&store, &entry, config, now).await {
            return false;
        }
        self.memory().cold_keys.insert(entry.key.clone());
        true
    }

    async fn write_cold(
        &self,
        store: &Arc<dyn PersistentStore>,
        entry: &CacheEntry,
        config: &CacheConfig,
        now: Instant,
    ) -> bool {
        let remaining = entry.remaining_ttl(now);
        if remaining.is_zero() {
            return false;
        }

        let bytes = match codec::encode(entry, now, config.enable_compression) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Failed to encode cold tier record");
                return false;
            }
        };

        match store.set(&entry.key.storage_key(), bytes, remaining).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "Cold tier write failed");
                false
            }
        }
    }

    async fn delete_cold(&self, store: &Arc<dyn PersistentStore>, key: &CacheKey) {
        self.memory().cold_keys.remove(key);
        if let Err(e) = store.delete(&key.storage_key()).await {
            warn!(key = %key, error = %e, "Cold tier delete failed");
        }
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Drop expired entries, then evict until both ceilings hold
    ///
    /// Victims are ordered by ascending `(access_count, last_accessed_at)`.
    /// `protect` (the entry just written) is only evicted when nothing else
    /// is left. While stale entries are being served, expiry alone removes
    /// nothing; only the ceilings do.
    fn enforce_limits(
        &self,
        memory: &mut MemoryTier,
        config: &CacheConfig,
        now: Instant,
        protect: Option<&CacheKey>,
    ) -> EvictionPass {
        let mut pass = EvictionPass {
            generation: memory.generation,
            ..EvictionPass::default()
        };

        if !(self.is_offline() && config.enable_offline_mode) {
            let expired: Vec<CacheKey> = memory
                .slots
                .iter()
                .filter(|(_, slot)| slot.entry.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                memory.remove(&key);
                pass.expired += 1;
            }
        }

        if memory.within(config) {
            return pass;
        }

        let mut candidates: Vec<(CacheKey, (bool, u64, Instant, u64))> = memory
            .slots
            .iter()
            .map(|(key, slot)| {
                let rank = (
                    Some(key) == protect,
                    slot.entry.access_count,
                    slot.entry.last_accessed_at,
                    slot.touched,
                );
                (key.clone(), rank)
            })
            .collect();
        candidates.sort_by_key(|(_, rank)| *rank);

        for (key, _) in candidates {
            if memory.within(config) {
                break;
            }
            if let Some(entry) = memory.remove(&key) {
                debug!(key = %key, size = entry.size_bytes, "Evicted entry");
                pass.victims.push(entry);
            }
        }

        info!(
            evicted = pass.victims.len(),
            total_bytes = memory.total_bytes,
            entries = memory.slots.len(),
            "Memory tier over ceiling, evicted LRU entries"
        );

        pass
    }

    /// Record an eviction pass and demote its victims
    async fn finish_pass(&self, pass: EvictionPass, config: &CacheConfig, now: Instant) {
        self.expirations.fetch_add(pass.expired, Ordering::Relaxed);
        if pass.victims.is_empty() {
            return;
        }
        self.evictions
            .fetch_add(pass.victims.len() as u64, Ordering::Relaxed);

        let Some(store) = self.cold(config).map(Arc::clone) else {
            return;
        };

        for victim in pass.victims {
            if victim.size_bytes > config.cold_tier_max_entry_size {
                continue;
            }
            if self.memory().generation != pass.generation {
                debug!("Invalidated during demotion, dropping remaining victims");
                return;
            }
            if !self.write_cold(&store, &victim, config, now).await {
                continue;
            }

            let kept = {
                let mut memory = self.memory();
                let kept = memory.generation == pass.generation;
                if kept {
                    memory.cold_keys.insert(victim.key.clone());
                }
                kept
            };
            if !kept {
                // The invalidation may have run before our write landed
                self.delete_cold(&store, &victim.key).await;
                return;
            }
            self.demotions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %victim.key, "Demoted entry to cold tier");
        }
    }

    /// Drop expired entries and enforce ceilings
    pub async fn sweep(&self) {
        let config = self.config();
        let now = Instant::now();
        let pass = {
            let mut memory = self.memory();
            self.enforce_limits(&mut memory, &config, now, None)
        };
        if pass.expired > 0 || !pass.victims.is_empty() {
            debug!(expired = pass.expired, evicted = pass.victims.len(), "Sweep finished");
        }
        self.finish_pass(pass, &config, now).await;
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the engine is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let interval = match engine.upgrade() {
                    Some(engine) => engine.config().sweep_interval,
                    None => break,
                };
                tokio::time::sleep(interval).await;
                match engine.upgrade() {
                    Some(engine) => engine.sweep().await,
                    None => break,
                }
            }
            debug!("Sweeper stopped");
        })
    }

    // ------------------------------------------------------------------
    // Invalidation
    // ------------------------------------------------------------------

    /// Remove the file and directory entries for exactly `path`
    pub async fn invalidate(&self, path: &str) {
        let path = path::normalize(path);
        self.invalidate_local(&path).await;
        self.publish(SyncMessage::invalidate(&self.context_id, &path))
            .await;
    }

    /// Remove `path` and every entry below it
    pub async fn invalidate_hierarchy(&self, path: &str) {
        let path = path::normalize(path);
        self.invalidate_hierarchy_local(&path).await;
        self.publish(SyncMessage::invalidate_hierarchy(&self.context_id, &path))
            .await;
    }

    /// Drop every entry in both tiers
    pub async fn clear(&self) {
        self.clear_local().await;
        self.publish(SyncMessage::clear(&self.context_id)).await;
    }

    /// Apply an invalidation received from a sibling context
    ///
    /// Messages that originated here are ignored; nothing is re-broadcast.
    pub async fn apply_remote(&self, message: &SyncMessage) {
        if message.origin == self.context_id {
            return;
        }
        debug!(op = ?message.op, path = ?message.path, origin = %message.origin, "Applying remote invalidation");

        match (message.op, message.path.as_deref()) {
            (SyncOp::Invalidate, Some(p)) => self.invalidate_local(&path::normalize(p)).await,
            (SyncOp::InvalidateHierarchy, Some(p)) => {
                self.invalidate_hierarchy_local(&path::normalize(p)).await
            }
            (SyncOp::Clear, _) => self.clear_local().await,
            (op, None) => warn!(op = ?op, "Remote invalidation without a path, ignoring"),
        }
    }

    async fn invalidate_local(&self, path: &str) {
        let keys = [CacheKey::file(path), CacheKey::directory(path)];

        let removed = {
            let mut memory = self.memory();
            memory.invalidated();
            keys.iter().filter(|key| memory.remove(key).is_some()).count()
        };
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(path = %path, removed = removed, "Invalidated path");

        if let Some(store) = self.cold_tier.clone() {
            // Siblings may have written these keys, so delete unconditionally
            for key in &keys {
                self.delete_cold(&store, key).await;
            }
        }
    }

    async fn invalidate_hierarchy_local(&self, root: &str) {
        let (removed, mut cold_victims) = {
            let mut memory = self.memory();
            memory.invalidated();
            let doomed: Vec<CacheKey> = memory
                .slots
                .keys()
                .filter(|key| path::is_same_or_descendant(key.path(), root))
                .cloned()
                .collect();
            for key in &doomed {
                memory.remove(key);
            }

            let mut cold_victims: Vec<CacheKey> = memory
                .cold_keys
                .iter()
                .filter(|key| path::is_same_or_descendant(key.path(), root))
                .cloned()
                .collect();
            for kind in [EntryKind::File, EntryKind::Directory] {
                let exact = CacheKey::new(kind, root);
                if !cold_victims.contains(&exact) {
                    cold_victims.push(exact);
                }
            }
            (doomed.len(), cold_victims)
        };

        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        debug!(path = %root, removed = removed, "Invalidated hierarchy");

        let Some(store) = self.cold_tier.clone() else {
            return;
        };

        // Records from earlier runs and departed siblings are only
        // discoverable through the store itself
        match store.keys().await {
            Ok(keys) => {
                for key in keys.iter().filter_map(|k| CacheKey::from_storage_key(k)) {
                    if path::is_same_or_descendant(key.path(), root) && !cold_victims.contains(&key) {
                        cold_victims.push(key);
                    }
                }
            }
            Err(e) => warn!(path = %root, error = %e, "Cold tier key scan failed, using known keys"),
        }

        for key in &cold_victims {
            self.delete_cold(&store, key).await;
        }
    }

    async fn clear_local(&self) {
        let removed = self.memory().clear();
        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);

        // The store is cleared even when disabled so re-enabling it
        // cannot resurrect stale records
        if let Some(store) = &self.cold_tier {
            if let Err(e) = store.clear().await {
                warn!(error = %e, "Failed to clear cold tier");
            }
        }
        info!(removed = removed, "Cleared cache");
    }

    async fn publish(&self, message: SyncMessage) {
        if !self.config().enable_cross_context_sync {
            return;
        }
        if let Err(e) = self.broadcaster.publish(message).await {
            warn!(error = %e, "Broadcast failed, siblings will catch up on expiry");
        }
    }

    /// Apply invalidations from sibling contexts until the engine is dropped
    ///
    /// Returns `None` when the broadcaster never delivers anything. If the
    /// listener falls behind and messages are lost, the cache is cleared.
    pub fn spawn_sync_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.broadcaster.subscribe()?;
        let engine: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;

            loop {
                let received = rx.recv().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match received {
                    Ok(message) => {
                        if engine.config().enable_cross_context_sync {
                            engine.apply_remote(&message).await;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed = missed, "Missed sibling invalidations, clearing");
                        engine.clear_local().await;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Sync listener stopped");
        }))
    }

    // ------------------------------------------------------------------
    // Configuration and stats
    // ------------------------------------------------------------------

    /// Merge a partial configuration and immediately re-check ceilings
    ///
    /// An update that would produce an invalid configuration is rejected
    /// and leaves the live configuration unchanged.
    pub async fn update_config(&self, update: &CacheConfigUpdate) -> Result<()> {
        {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            let next = config.merged(update);
            next.validate()?;
            *config = next;
        }
        info!("Cache configuration updated");
        self.sweep().await;
        Ok(())
    }

    /// Aggregate counters; never mutates state
    pub fn get_cache_stats(&self) -> CacheStats {
        let (memory_entries, cold_entries, total_bytes) = {
            let memory = self.memory();
            (memory.slots.len(), memory.cold_keys.len(), memory.total_bytes)
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            memory_entries,
            cold_entries,
            total_bytes,
            hits,
            misses,
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Log current cache metrics
    pub fn log_metrics(&self) {
        let stats = self.get_cache_stats();
        debug!(
            hits = stats.hits,
            misses = stats.misses,
            hit_rate = format!("{:.1}%", stats.hit_rate * 100.0),
            memory_entries = stats.memory_entries,
            cold_entries = stats.cold_entries,
            total_bytes = stats.total_bytes,
            "Cache metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::{DirectoryContent, FileContent};
    use crate::store::{MemoryStore, StoreError};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Store that can park one `get` (after reading) or one `set` (before
    /// writing) until released
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        hold_get: AtomicBool,
        hold_set: AtomicBool,
        parked: Notify,
        release: Notify,
    }

    impl GatedStore {
        async fn park(&self) {
            self.parked.notify_one();
            self.release.notified().await;
        }
    }

    #[async_trait]
    impl PersistentStore for GatedStore {
        async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            let value = self.inner.get(key).await?;
            if self.hold_get.swap(false, Ordering::SeqCst) {
                self.park().await;
            }
            Ok(value)
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> std::result::Result<(), StoreError> {
            if self.hold_set.swap(false, Ordering::SeqCst) {
                self.park().await;
            }
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn clear(&self) -> std::result::Result<(), StoreError> {
            self.inner.clear().await
        }

        async fn keys(&self) -> std::result::Result<Vec<String>, StoreError> {
            self.inner.keys().await
        }
    }

    fn file(path: &str, content: &str) -> Payload {
        FileContent::new(path, content).into()
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            max_cache_size: 1024,
            max_file_size: 256,
            max_files: 10,
            ..CacheConfig::default()
        }
    }

    async fn put(engine: &CacheEngine, path: &str, content: &str) {
        engine
            .set(CacheKey::file(path), file(path, content), SetOptions::default())
            .await;
    }

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        let key = CacheKey::file("/a.txt");

        assert!(engine.get(&key).await.is_none());
        put(&engine, "/a.txt", "hello").await;

        let entry = engine.get(&key).await.unwrap();
        assert_eq!(entry.as_file().unwrap().content, "hello");
        assert_eq!(entry.access_count, 1);

        let stats = engine.get_cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let config = CacheConfig {
            max_files: 0,
            ..CacheConfig::default()
        };
        assert!(CacheEngine::new(config).is_err());
    }

    #[tokio::test]
    async fn test_wrong_kind_is_ignored() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        engine
            .set(CacheKey::directory("/a"), file("/a", "x"), SetOptions::default())
            .await;
        assert_eq!(engine.get_cache_stats().memory_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_never_extends_ttl() {
        let config = CacheConfig {
            active_file_ttl: Duration::from_millis(1000),
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        let key = CacheKey::file("/f");
        put(&engine, "/f", "v").await;

        for _ in 0..9 {
            tokio::time::advance(Duration::from_millis(100)).await;
            assert!(engine.get(&key).await.is_some());
        }
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(engine.get(&key).await.is_none());
        assert_eq!(engine.get_cache_stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_resets_ttl() {
        let config = CacheConfig {
            active_file_ttl: Duration::from_millis(1000),
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        put(&engine, "/f", "v1").await;

        tokio::time::advance(Duration::from_millis(800)).await;
        put(&engine, "/f", "v2").await;
        tokio::time::advance(Duration::from_millis(800)).await;

        let entry = engine.get(&CacheKey::file("/f")).await.unwrap();
        assert_eq!(entry.as_file().unwrap().content, "v2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_prefetch_uses_inactive_ttl() {
        let config = CacheConfig {
            active_file_ttl: Duration::from_millis(1000),
            inactive_file_ttl: Duration::from_millis(5000),
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        engine
            .set(CacheKey::file("/later"), file("/later", "x"), SetOptions::prefetch())
            .await;

        tokio::time::advance(Duration::from_millis(3000)).await;
        let entry = engine.get(&CacheKey::file("/later")).await.unwrap();
        assert_eq!(entry.ttl, Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_keeps_expired_entry() {
        let config = CacheConfig {
            active_file_ttl: Duration::from_millis(100),
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        let key = CacheKey::file("/f");
        put(&engine, "/f", "v").await;
        tokio::time::advance(Duration::from_millis(200)).await;

        assert!(engine.peek(&key, false).await.is_none());
        assert!(engine.peek(&key, true).await.is_some());
        assert_eq!(engine.get_cache_stats().memory_entries, 1);

        assert!(engine.get(&key).await.is_none());
        assert_eq!(engine.get_cache_stats().memory_entries, 0);
        assert!(engine.peek(&key, true).await.is_none());
    }

    #[tokio::test]
    async fn test_peek_does_not_count_access() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        let key = CacheKey::file("/f");
        put(&engine, "/f", "v").await;

        let peeked = engine.peek(&key, false).await.unwrap();
        assert_eq!(peeked.access_count, 0);
        assert_eq!(engine.get_cache_stats().hits, 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_kinds() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        put(&engine, "/a", "x").await;
        engine
            .set(
                CacheKey::directory("/a"),
                DirectoryContent::new("/a", Vec::new()).into(),
                SetOptions::default(),
            )
            .await;
        put(&engine, "/a/b", "y").await;

        engine.invalidate("/a/").await;

        assert!(engine.get(&CacheKey::file("/a")).await.is_none());
        assert!(engine.get(&CacheKey::directory("/a")).await.is_none());
        assert!(engine.get(&CacheKey::file("/a/b")).await.is_some());
        assert_eq!(engine.get_cache_stats().invalidations, 2);
    }

    #[tokio::test]
    async fn test_invalidate_hierarchy_is_segment_aware() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        for p in ["/a/b", "/a/b/c", "/a/b/c/d", "/a/bc", "/a"] {
            put(&engine, p, "x").await;
        }

        engine.invalidate_hierarchy("/a/b").await;

        for p in ["/a/b", "/a/b/c", "/a/b/c/d"] {
            assert!(engine.get(&CacheKey::file(p)).await.is_none(), "{} survived", p);
        }
        assert!(engine.get(&CacheKey::file("/a/bc")).await.is_some());
        assert!(engine.get(&CacheKey::file("/a")).await.is_some());
    }

    #[tokio::test]
    async fn test_clear_resets_entries_and_bytes() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        put(&engine, "/a", "x").await;
        put(&engine, "/b", "y").await;

        engine.clear().await;

        let stats = engine.get_cache_stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.total_bytes, 0);
    }

    #[tokio::test]
    async fn test_size_ceiling_holds() {
        let engine = CacheEngine::new(small_config()).unwrap();
        let body = "x".repeat(200);

        for i in 0..20 {
            put(&engine, &format!("/f{}", i), &body).await;
            let stats = engine.get_cache_stats();
            assert!(stats.total_bytes <= 1024);
            assert!(stats.memory_entries <= 10);
        }
        assert!(engine.get_cache_stats().evictions > 0);
    }

    #[tokio::test]
    async fn test_frequency_beats_recency() {
        let config = CacheConfig {
            max_files: 2,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();

        put(&engine, "/old-but-popular", "x").await;
        for _ in 0..5 {
            engine.get(&CacheKey::file("/old-but-popular")).await;
        }
        put(&engine, "/recent-once", "y").await;
        engine.get(&CacheKey::file("/recent-once")).await;
        put(&engine, "/new", "z").await;

        assert!(engine.get(&CacheKey::file("/old-but-popular")).await.is_some());
        assert!(engine.get(&CacheKey::file("/recent-once")).await.is_none());
        assert!(engine.get(&CacheKey::file("/new")).await.is_some());
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected_without_cold_tier() {
        let engine = CacheEngine::new(small_config()).unwrap();
        put(&engine, "/big", &"x".repeat(300)).await;

        assert_eq!(engine.get_cache_stats().memory_entries, 0);
        assert!(engine.get(&CacheKey::file("/big")).await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_entry_goes_cold() {
        let store = Arc::new(MemoryStore::new());
        let engine = CacheEngine::new(small_config())
            .unwrap()
            .with_cold_tier(store);
        put(&engine, "/big", &"x".repeat(300)).await;

        let stats = engine.get_cache_stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.cold_entries, 1);

        // Served from the cold tier, never promoted
        let entry = engine.get(&CacheKey::file("/big")).await.unwrap();
        assert_eq!(entry.as_file().unwrap().content.len(), 300);
        assert_eq!(engine.get_cache_stats().memory_entries, 0);
    }

    #[tokio::test]
    async fn test_evicted_entries_are_demoted_and_promoted() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            max_files: 1,
            enable_compression: true,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap().with_cold_tier(store);

        put(&engine, "/first", "1").await;
        put(&engine, "/second", "2").await;

        let stats = engine.get_cache_stats();
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.demotions, 1);
        assert_eq!(stats.cold_entries, 1);

        let entry = engine.get(&CacheKey::file("/first")).await.unwrap();
        assert_eq!(entry.as_file().unwrap().content, "1");
        // Promotion swapped the two entries
        let stats = engine.get_cache_stats();
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.demotions, 2);
        assert!(engine.peek(&CacheKey::file("/second"), false).await.is_some());
    }

    #[tokio::test]
    async fn test_malformed_cold_record_is_deleted() {
        let store = Arc::new(MemoryStore::new());
        let engine = CacheEngine::new(CacheConfig::default())
            .unwrap()
            .with_cold_tier(store.clone());
        let key = CacheKey::file("/broken");
        store
            .set(&key.storage_key(), b"\x00not json".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(engine.get(&key).await.is_none());
        assert!(store.get(&key.storage_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidation_reaches_cold_tier() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            max_files: 1,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config)
            .unwrap()
            .with_cold_tier(store.clone());
        put(&engine, "/dir/a", "1").await;
        put(&engine, "/dir/b", "2").await;

        engine.invalidate_hierarchy("/dir").await;

        assert!(store.get("file:/dir/a").await.unwrap().is_none());
        assert!(engine.get(&CacheKey::file("/dir/a")).await.is_none());
        assert!(engine.get(&CacheKey::file("/dir/b")).await.is_none());
        assert_eq!(engine.get_cache_stats().cold_entries, 0);
    }

    #[tokio::test]
    async fn test_update_config_evicts_immediately() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        for i in 0..5 {
            put(&engine, &format!("/f{}", i), "x").await;
        }

        engine
            .update_config(&CacheConfigUpdate {
                max_files: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(engine.get_cache_stats().memory_entries, 2);
        assert_eq!(engine.config().max_files, 2);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        let result = engine
            .update_config(&CacheConfigUpdate {
                max_files: Some(0),
                ..Default::default()
            })
            .await;
        assert!(result.is_err());
        assert_eq!(engine.config().max_files, CacheConfig::default().max_files);
    }

    #[tokio::test]
    async fn test_version_hint_is_compared_for_equality() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        let key = CacheKey::file("/v");
        engine
            .set(key.clone(), file("/v", "x"), SetOptions::default().with_version("etag-7"))
            .await;

        assert!(engine.is_current(&key, "etag-7"));
        assert!(!engine.is_current(&key, "etag-8"));
        assert!(!engine.is_current(&CacheKey::file("/other"), "etag-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_expired_entries() {
        let config = CacheConfig {
            directory_ttl: Duration::from_millis(100),
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        engine
            .set(
                CacheKey::directory("/d"),
                DirectoryContent::new("/d", Vec::new()).into(),
                SetOptions::default(),
            )
            .await;

        tokio::time::advance(Duration::from_millis(150)).await;
        engine.sweep().await;

        let stats = engine.get_cache_stats();
        assert_eq!(stats.memory_entries, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_remote_messages_skip_own_origin() {
        let engine = CacheEngine::new(CacheConfig::default()).unwrap();
        put(&engine, "/a", "x").await;

        engine
            .apply_remote(&SyncMessage::invalidate(engine.context_id(), "/a"))
            .await;
        assert_eq!(engine.get_cache_stats().memory_entries, 1);

        engine
            .apply_remote(&SyncMessage::invalidate("someone-else", "/a"))
            .await;
        assert_eq!(engine.get_cache_stats().memory_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_keeps_expired_entries() {
        let config = CacheConfig {
            active_file_ttl: Duration::from_millis(100),
            enable_offline_mode: true,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        let key = CacheKey::file("/f");
        put(&engine, "/f", "v").await;
        engine.set_offline(true);
        assert!(engine.serves_stale());

        tokio::time::advance(Duration::from_millis(200)).await;
        engine.sweep().await;
        put(&engine, "/g", "w").await;

        // Expired but retained: a miss for `get`, still visible to a stale peek
        assert!(engine.get(&key).await.is_none());
        assert!(engine.peek(&key, true).await.is_some());
        assert_eq!(engine.get_cache_stats().expirations, 0);

        engine.set_offline(false);
        engine.sweep().await;
        assert!(engine.peek(&key, true).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_still_enforces_ceilings() {
        let config = CacheConfig {
            active_file_ttl: Duration::from_millis(100),
            max_files: 2,
            enable_offline_mode: true,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        engine.set_offline(true);
        put(&engine, "/a", "1").await;
        put(&engine, "/b", "2").await;
        tokio::time::advance(Duration::from_millis(200)).await;
        put(&engine, "/c", "3").await;

        let stats = engine.get_cache_stats();
        assert_eq!(stats.memory_entries, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mode_alone_does_not_keep_expired_entries() {
        let config = CacheConfig {
            active_file_ttl: Duration::from_millis(100),
            enable_offline_mode: true,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config).unwrap();
        put(&engine, "/f", "v").await;
        tokio::time::advance(Duration::from_millis(200)).await;

        assert!(!engine.serves_stale());
        engine.sweep().await;
        assert_eq!(engine.get_cache_stats().memory_entries, 0);
    }

    #[tokio::test]
    async fn test_rejected_oversized_overwrite_removes_cold_copy() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            max_files: 1,
            max_file_size: 256,
            cold_tier_max_entry_size: 512,
            ..CacheConfig::default()
        };
        let engine = CacheEngine::new(config)
            .unwrap()
            .with_cold_tier(store.clone());
        put(&engine, "/a", "v1").await;
        put(&engine, "/b", "v2").await;
        assert!(store.get("file:/a").await.unwrap().is_some());

        // Too big for either tier
        put(&engine, "/a", &"x".repeat(600)).await;

        assert!(store.get("file:/a").await.unwrap().is_none());
        assert!(engine.get(&CacheKey::file("/a")).await.is_none());
    }

    #[tokio::test]
    async fn test_hierarchy_invalidation_finds_foreign_cold_records() {
        let store = Arc::new(MemoryStore::new());
        let writer = CacheEngine::new(small_config())
            .unwrap()
            .with_cold_tier(store.clone());
        put(&writer, "/dir/deep/big", &"x".repeat(300)).await;
        put(&writer, "/dirt/big", &"y".repeat(300)).await;

        let engine = CacheEngine::new(small_config())
            .unwrap()
            .with_cold_tier(store.clone());
        assert_eq!(engine.get_cache_stats().cold_entries, 0);

        engine.invalidate_hierarchy("/dir").await;

        assert!(engine.get(&CacheKey::file("/dir/deep/big")).await.is_none());
        assert!(store.get("file:/dir/deep/big").await.unwrap().is_none());
        assert!(store.get("file:/dirt/big").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidation_during_cold_read_wins() {
        let store = Arc::new(GatedStore::default());
        let engine = Arc::new(
            CacheEngine::new(CacheConfig::default())
                .unwrap()
                .with_cold_tier(store.clone()),
        );
        let key = CacheKey::file("/dir/a");
        let entry = CacheEntry::new(
            key.clone(),
            file("/dir/a", "old"),
            Duration::from_secs(60),
            Instant::now(),
        );
        let bytes = codec::encode(&entry, Instant::now(), false).unwrap();
        store
            .inner
            .set(&key.storage_key(), bytes, Duration::from_secs(60))
            .await
            .unwrap();

        store.hold_get.store(true, Ordering::SeqCst);
        let reader = tokio::spawn({
            let engine = Arc::clone(&engine);
            let key = key.clone();
            async move { engine.get(&key).await }
        });
        store.parked.notified().await;
        engine.invalidate_hierarchy("/dir").await;
        store.release.notify_one();

        assert!(reader.await.unwrap().is_none());
        assert_eq!(engine.get_cache_stats().memory_entries, 0);
        assert!(store.inner.get(&key.storage_key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_during_demotion_wins() {
        let store = Arc::new(GatedStore::default());
        let config = CacheConfig {
            max_files: 1,
            ..CacheConfig::default()
        };
        let engine = Arc::new(
            CacheEngine::new(config)
                .unwrap()
                .with_cold_tier(store.clone()),
        );
        put(&engine, "/first", "1").await;

        store.hold_set.store(true, Ordering::SeqCst);
        let writer = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { put(&engine, "/second", "2").await }
        });
        store.parked.notified().await;
        engine.clear().await;
        store.release.notify_one();
        writer.await.unwrap();

        assert!(store.inner.get("file:/first").await.unwrap().is_none());
        let stats = engine.get_cache_stats();
        assert_eq!(stats.demotions, 0);
        assert_eq!(stats.cold_entries, 0);
    }
}
