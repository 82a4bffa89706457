//! Configuration for the cache engine

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

/// Serialize durations as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}

/// Configuration for the cache engine
///
/// Durations are expressed in milliseconds when (de)serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// TTL for files written while the user is viewing them
    #[serde(with = "duration_ms")]
    pub active_file_ttl: Duration,

    /// TTL for files written speculatively (prefetch); the long
    /// "stale but fetchable" tier
    #[serde(with = "duration_ms")]
    pub inactive_file_ttl: Duration,

    /// TTL for directory listings
    #[serde(with = "duration_ms")]
    pub directory_ttl: Duration,

    /// Ceiling on bytes held by the memory tier
    pub max_cache_size: u64,

    /// Entries larger than this never enter the memory tier
    pub max_file_size: u64,

    /// Ceiling on entries held by the memory tier
    pub max_files: usize,

    /// Entries larger than this are never written to the cold tier
    pub cold_tier_max_entry_size: u64,

    /// Period of the background sweep
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,

    pub enable_prefetch: bool,
    /// Serve expired entries while the remote is reported unreachable
    pub enable_offline_mode: bool,
    pub enable_cross_context_sync: bool,
    pub enable_watcher_invalidation: bool,
    /// Gzip records written to the cold tier
    pub enable_compression: bool,
    pub enable_cold_tier: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            active_file_ttl: Duration::from_secs(5 * 60),
            inactive_file_ttl: Duration::from_secs(30 * 60),
            directory_ttl: Duration::from_secs(2 * 60),
            max_cache_size: 50 * 1024 * 1024,
            max_file_size: 5 * 1024 * 1024,
            max_files: 2_000,
            cold_tier_max_entry_size: 20 * 1024 * 1024,
            sweep_interval: Duration::from_secs(60),
            enable_prefetch: true,
            enable_offline_mode: false,
            enable_cross_context_sync: true,
            enable_watcher_invalidation: true,
            enable_compression: false,
            enable_cold_tier: true,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(CacheError::InvalidConfig(msg.to_string()));

        if self.max_files == 0 {
            return fail("maxFiles must be greater than 0");
        }
        if self.max_cache_size == 0 {
            return fail("maxCacheSize must be greater than 0");
        }
        if self.max_file_size == 0 {
            return fail("maxFileSize must be greater than 0");
        }
        if self.max_file_size > self.max_cache_size {
            return fail("maxFileSize must not exceed maxCacheSize");
        }
        if self.active_file_ttl.is_zero()
            || self.inactive_file_ttl.is_zero()
            || self.directory_ttl.is_zero()
        {
            return fail("TTLs must be greater than 0");
        }
        if self.sweep_interval.is_zero() {
            return fail("sweepInterval must be greater than 0");
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CacheError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache config: {:?}", path))?;
        let config = Self::from_json_str(&raw)
            .with_context(|| format!("Invalid cache config: {:?}", path))?;
        Ok(config)
    }

    /// Merge a partial update, returning the resulting config
    ///
    /// The receiver is left untouched; callers validate the result before
    /// adopting it.
    pub fn merged(&self, update: &CacheConfigUpdate) -> Self {
        let mut next = self.clone();

        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = update.$field { next.$field = value; })*
            };
        }

        merge!(
            active_file_ttl,
            inactive_file_ttl,
            directory_ttl,
            max_cache_size,
            max_file_size,
            max_files,
            cold_tier_max_entry_size,
            sweep_interval,
            enable_prefetch,
            enable_offline_mode,
            enable_cross_context_sync,
            enable_watcher_invalidation,
            enable_compression,
            enable_cold_tier,
        );

        next
    }
}

/// Partial configuration used by `update_config`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfigUpdate {
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub active_file_ttl: Option<Duration>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub inactive_file_ttl: Option<Duration>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub directory_ttl: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cold_tier_max_entry_size: Option<u64>,
    #[serde(with = "duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub sweep_interval: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_prefetch: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_offline_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_cross_context_sync: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_watcher_invalidation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_compression: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_cold_tier: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.active_file_ttl < config.inactive_file_ttl);
        assert!(config.enable_cold_tier);
        assert!(!config.enable_offline_mode);
    }

    #[test]
    fn test_config_validation() {
        let mut config = CacheConfig::default();
        config.max_files = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.max_file_size = config.max_cache_size + 1;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.directory_ttl = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_uses_camel_case_milliseconds() {
        let config = CacheConfig::from_json_str(
            r#"{"activeFileTtl":1000,"directoryTtl":2000,"maxFiles":2}"#,
        )
        .unwrap();

        assert_eq!(config.active_file_ttl, Duration::from_millis(1000));
        assert_eq!(config.directory_ttl, Duration::from_millis(2000));
        assert_eq!(config.max_files, 2);
        // Unspecified fields keep their defaults
        assert_eq!(config.max_file_size, CacheConfig::default().max_file_size);
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(CacheConfig::from_json_str(r#"{"maxFiles":0}"#).is_err());
        assert!(CacheConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_merge_only_touches_given_fields() {
        let base = CacheConfig::default();
        let update = CacheConfigUpdate {
            max_files: Some(10),
            enable_compression: Some(true),
            ..Default::default()
        };

        let merged = base.merged(&update);
        assert_eq!(merged.max_files, 10);
        assert!(merged.enable_compression);
        assert_eq!(merged.active_file_ttl, base.active_file_ttl);
    }

    #[test]
    fn test_update_from_json() {
        let update: CacheConfigUpdate =
            serde_json::from_str(r#"{"directoryTtl":500}"#).unwrap();
        assert_eq!(update.directory_ttl, Some(Duration::from_millis(500)));
        assert!(update.max_files.is_none());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, r#"{"maxCacheSize":1048576,"maxFileSize":1024}"#).unwrap();

        let config = CacheConfig::from_json_file(&path).unwrap();
        assert_eq!(config.max_cache_size, 1_048_576);
        assert_eq!(config.max_file_size, 1024);
    }
}
