// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the cache.
//!
//! # Example
//!
//! ```
//! use mesh_cache::{CacheConfig, EvictionPolicy, NotificationMode};
//!
//! // Minimal config (uses defaults)
//! let config = CacheConfig::new("myapp");
//! assert_eq!(config.default_ttl_ms, 5 * 60 * 1000);
//! assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
//!
//! // Full config
//! let config = CacheConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     use_remote_l2: true,
//!     notification_mode: NotificationMode::Async,
//!     compression_threshold: 16 * 1024,
//!     ..CacheConfig::new("myapp")
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::errors::CacheError;

/// How entry deadlines behave on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// A read hit slides both deadlines forward by the entry's TTL.
    #[default]
    Lru,
    /// Deadlines are fixed at write time and never refreshed.
    Fifo,
}

/// When (and whether) a written entry is serialized and announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMode {
    /// Seal on the background pipeline; the write path never waits.
    #[default]
    Async,
    /// Seal inline at write time (deterministic, but on the caller's path).
    Sync,
    /// Never seal, never notify. No backplane traffic, no remote mirror.
    None,
}

/// Configuration for a [`MeshCache`](crate::MeshCache) instance.
///
/// All fields except `cache_prefix` have sensible defaults. For a fleet
/// setup you should configure `redis_url`; without it the cache runs
/// standalone (no backplane, no second level).
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Logical namespace. Scopes the backplane channel and all remote keys.
    /// Required and non-empty.
    pub cache_prefix: String,

    /// Stable identity of this process's cache, used to suppress loopback.
    /// Defaults to a fresh UUID per instance.
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Redis connection string (e.g., "redis://localhost:6379").
    /// `None` means standalone mode.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Whether the remote store also acts as a second-level cache
    /// (mirror on write, read-through on miss).
    #[serde(default)]
    pub use_remote_l2: bool,

    /// Period of the expiration sweeper in milliseconds.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// TTL applied when the caller omits one, in milliseconds.
    #[serde(default = "default_ttl_ms")]
    pub default_ttl_ms: u64,

    /// Deadline behavior on read.
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,

    /// Seal/notify behavior on write.
    #[serde(default)]
    pub notification_mode: NotificationMode,

    /// Serialized size in bytes at or above which payloads are compressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// Shard count of the per-key lock table.
    #[serde(default = "default_lock_pool_size")]
    pub lock_pool_size: usize,

    /// Idle time after which an unused per-key lock is reclaimed, in ms.
    #[serde(default = "default_lock_idle_ms")]
    pub lock_idle_ms: u64,

    /// Seal pipeline: flush after this many milliseconds even if the batch
    /// is small.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Seal pipeline: flush once the batch reaches this many entries.
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
}

fn default_cleanup_interval_ms() -> u64 { 1000 }
fn default_ttl_ms() -> u64 { 5 * 60 * 1000 } // 5 minutes
fn default_compression_threshold() -> usize { 4 * 1024 } // 4 KiB
fn default_lock_pool_size() -> usize { 7872 }
fn default_lock_idle_ms() -> u64 { 5 * 60 * 1000 } // 5 minutes
fn default_flush_interval_ms() -> u64 { 35 }
fn default_flush_batch_size() -> usize { 100 }

impl CacheConfig {
    /// Create a config with the given namespace prefix and default settings.
    pub fn new(cache_prefix: impl Into<String>) -> Self {
        Self {
            cache_prefix: cache_prefix.into(),
            instance_id: None,
            redis_url: None,
            use_remote_l2: false,
            cleanup_interval_ms: default_cleanup_interval_ms(),
            default_ttl_ms: default_ttl_ms(),
            eviction_policy: EvictionPolicy::default(),
            notification_mode: NotificationMode::default(),
            compression_threshold: default_compression_threshold(),
            lock_pool_size: default_lock_pool_size(),
            lock_idle_ms: default_lock_idle_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_batch_size: default_flush_batch_size(),
        }
    }

    /// Default TTL as a [`Duration`].
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    /// Check the config for construction-time errors.
    ///
    /// Fails when the prefix is empty, when the second level is enabled
    /// without a connection string, or when a sizing knob is zero.
    pub fn validate(&self) -> Result<(), CacheError> {
        if self.cache_prefix.is_empty() {
            return Err(CacheError::Config("cache_prefix must not be empty".into()));
        }
        if self.use_remote_l2 && self.redis_url.is_none() {
            return Err(CacheError::Config(
                "use_remote_l2 requires redis_url".into(),
            ));
        }
        if self.lock_pool_size == 0 {
            return Err(CacheError::Config("lock_pool_size must be > 0".into()));
        }
        if self.flush_batch_size == 0 {
            return Err(CacheError::Config("flush_batch_size must be > 0".into()));
        }
        if self.default_ttl_ms == 0 {
            return Err(CacheError::Config("default_ttl_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::new("test");
        assert_eq!(config.cache_prefix, "test");
        assert_eq!(config.cleanup_interval_ms, 1000);
        assert_eq!(config.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(config.notification_mode, NotificationMode::Async);
        assert_eq!(config.lock_pool_size, 7872);
        assert!(!config.use_remote_l2);
        assert!(config.instance_id.is_none());
    }

    #[test]
    fn test_validate_empty_prefix() {
        let config = CacheConfig::new("");
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_l2_requires_url() {
        let config = CacheConfig {
            use_remote_l2: true,
            ..CacheConfig::new("test")
        };
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));

        let config = CacheConfig {
            use_remote_l2: true,
            redis_url: Some("redis://localhost".into()),
            ..CacheConfig::new("test")
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_knobs() {
        let config = CacheConfig {
            lock_pool_size: 0,
            ..CacheConfig::new("test")
        };
        assert!(config.validate().is_err());

        let config = CacheConfig {
            flush_batch_size: 0,
            ..CacheConfig::new("test")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: CacheConfig = serde_json::from_str(
            r#"{
                "cache_prefix": "orders",
                "redis_url": "redis://localhost:6379",
                "use_remote_l2": true,
                "eviction_policy": "fifo",
                "notification_mode": "sync"
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache_prefix, "orders");
        assert_eq!(config.eviction_policy, EvictionPolicy::Fifo);
        assert_eq!(config.notification_mode, NotificationMode::Sync);
        // Unspecified fields fall back to defaults
        assert_eq!(config.flush_interval_ms, 35);
        assert_eq!(config.flush_batch_size, 100);
    }
}
