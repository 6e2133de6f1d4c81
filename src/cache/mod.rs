// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The cache coordinator.
//!
//! [`MeshCache`] ties the pieces together: the L1 store, the seal pipeline,
//! the per-key lock table, the backplane subscription, and the optional
//! remote second level. Construction validates the configuration;
//! [`start`](MeshCache::start) connects the remote transport and spawns the
//! background tasks (effect fan-out, expiration sweeper, subscriber).
//!
//! # Lifecycle
//!
//! ```text
//! new() → start() → serve … → shutdown()
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use mesh_cache::{MeshCache, CacheConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), mesh_cache::CacheError> {
//! let mut config = CacheConfig::new("sessions");
//! config.redis_url = Some("redis://localhost:6379".into());
//!
//! let mut cache = MeshCache::new(config)?;
//! cache.start().await?;
//!
//! cache.set("sess.1", &"alice", None).await?;
//! assert_eq!(cache.get::<String>("sess.1").await.as_deref(), Some("alice"));
//! # Ok(())
//! # }
//! ```

mod loader;
pub(crate) mod types;

pub use loader::DEFAULT_FACTORY_WAIT;
pub use types::{CacheStats, ChangeListener, EntryEvent, EventCause};
pub(crate) use types::CacheEffect;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backplane::{self, InvalidationMessage};
use crate::config::{CacheConfig, NotificationMode};
use crate::entry::CacheEntry;
use crate::errors::CacheError;
use crate::locks::KeyLockTable;
use crate::metrics;
use crate::pipeline::{PipelineConfig, SealPipeline};
use crate::remote::{RedisRemote, RemoteStore};
use crate::store::L1Store;

/// A process-local cache kept coherent across a fleet via a pub/sub
/// backplane, with an optional shared remote second level.
///
/// All operations are safe for concurrent use; the cache is normally held
/// behind an `Arc`.
pub struct MeshCache {
    config: CacheConfig,
    instance_id: String,
    pub(crate) store: Arc<L1Store>,
    pub(crate) locks: Arc<KeyLockTable>,
    pipeline: Option<SealPipeline>,
    pub(crate) remote: Option<Arc<dyn RemoteStore>>,
    listener: Option<ChangeListener>,
    effects_tx: mpsc::UnboundedSender<CacheEffect>,
    effects_rx: Option<mpsc::UnboundedReceiver<CacheEffect>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshCache {
    /// Create a cache from `config`. Fails fast on configuration errors.
    ///
    /// The remote transport is not touched here; call
    /// [`start`](Self::start) to connect and go coherent.
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Like [`new`](Self::new), but with an injected remote store instead
    /// of a Redis connection: share one [`InMemoryRemote`](crate::InMemoryRemote)
    /// between instances to run a fleet inside one process.
    pub fn with_remote(
        config: CacheConfig,
        remote: Arc<dyn RemoteStore>,
    ) -> Result<Self, CacheError> {
        if config.cache_prefix.is_empty() {
            return Err(CacheError::Config("cache_prefix must not be empty".into()));
        }
        Ok(Self::build(config, Some(remote)))
    }

    fn build(config: CacheConfig, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();
        let store = Arc::new(L1Store::new(config.eviction_policy, effects_tx.clone()));
        let locks = Arc::new(KeyLockTable::new(
            config.lock_pool_size,
            Duration::from_millis(config.lock_idle_ms),
        ));

        let pipeline_tx = effects_tx.clone();
        let threshold = config.compression_threshold;
        let pipeline = SealPipeline::spawn(
            PipelineConfig {
                flush_interval_ms: config.flush_interval_ms,
                flush_batch_size: config.flush_batch_size,
                compression_threshold: threshold,
            },
            move |entry| {
                metrics::record_seal(entry.size_bytes(), entry.size_bytes() >= threshold);
                let _ = pipeline_tx.send(CacheEffect::Upsert { entry });
            },
        );

        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            config,
            instance_id,
            store,
            locks,
            pipeline: Some(pipeline),
            remote,
            listener: None,
            effects_tx,
            effects_rx: Some(effects_rx),
            tasks: Vec::new(),
        }
    }

    /// Install the change listener. Must be called before [`start`](Self::start).
    pub fn set_change_listener(&mut self, listener: ChangeListener) {
        self.listener = Some(listener);
    }

    /// Connect the remote transport (when configured) and spawn the
    /// background tasks. Idempotent per instance: the second call is a
    /// no-op.
    pub async fn start(&mut self) -> Result<(), CacheError> {
        let Some(effects_rx) = self.effects_rx.take() else {
            return Ok(());
        };

        if self.remote.is_none() {
            if let Some(url) = self.config.redis_url.clone() {
                let remote = RedisRemote::connect(&url)
                    .await
                    .map_err(|e| CacheError::Config(format!("remote connection failed: {e}")))?;
                self.remote = Some(Arc::new(remote));
            }
        }

        // Effect fan-out: listener + backplane publish + remote mirror.
        self.tasks.push(tokio::spawn(run_effects(
            effects_rx,
            EffectContext {
                prefix: self.config.cache_prefix.clone(),
                instance_id: self.instance_id.clone(),
                listener: self.listener.clone(),
                remote: self.remote.clone(),
                mirror: self.config.use_remote_l2,
            },
        )));

        // Inbound invalidations.
        if let Some(remote) = self.remote.clone() {
            let store = self.store.clone();
            let prefix = self.config.cache_prefix.clone();
            let instance_id = self.instance_id.clone();
            let mut rx = remote
                .subscribe(&prefix)
                .await
                .map_err(|e| CacheError::Config(format!("backplane subscribe failed: {e}")))?;
            self.tasks.push(tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    metrics::record_backplane("inbound", "received");
                    backplane::apply_inbound(&store, &prefix, &instance_id, &payload);
                }
                debug!("backplane subscription ended");
            }));
        }

        // Expiration sweeper; also reclaims idle key locks and refreshes
        // the size gauges.
        {
            let store = self.store.clone();
            let locks = self.locks.clone();
            let period = Duration::from_millis(self.config.cleanup_interval_ms.max(1));
            self.tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tick.tick().await;
                    let swept = store.evict_expired();
                    if swept > 0 {
                        metrics::record_swept(swept);
                    }
                    locks.reclaim_idle();
                    let stats = store.stats();
                    metrics::set_l1_entries(stats.count);
                    metrics::set_l1_bytes(stats.size_bytes);
                }
            }));
        }

        info!(
            prefix = %self.config.cache_prefix,
            instance = %self.instance_id,
            remote = self.remote.is_some(),
            second_level = self.config.use_remote_l2,
            "cache started"
        );
        Ok(())
    }

    /// Namespace prefix of this cache.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.config.cache_prefix
    }

    /// Identity used for loopback suppression.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub(crate) fn remote_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.cache_prefix, key)
    }

    pub(crate) fn ttl_or_default(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or_else(|| self.config.default_ttl())
    }

    pub(crate) fn mirrors(&self) -> bool {
        self.config.use_remote_l2
    }

    // ─── Core operations ────────────────────────────────────────────────

    /// Current value for `key`, if a live entry of type `T` exists.
    ///
    /// Checks L1 first; on a miss with the second level enabled, reads
    /// through the remote store and rehydrates silently. A type mismatch
    /// reads as absent, never as an error.
    #[tracing::instrument(skip(self), fields(tier))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(entry) = self.store.get(key) {
            tracing::Span::current().record("tier", "L1");
            metrics::record_hit("L1");
            return entry.decode();
        }

        if let Some(entry) = self.read_through(key).await {
            tracing::Span::current().record("tier", "L2");
            metrics::record_hit("L2");
            return entry.decode();
        }

        tracing::Span::current().record("tier", "miss");
        metrics::record_miss();
        None
    }

    /// Fetch `key` from the remote second level and install it silently.
    pub(crate) async fn read_through(&self, key: &str) -> Option<Arc<CacheEntry>> {
        if !self.config.use_remote_l2 {
            return None;
        }
        let remote = self.remote.as_ref()?;

        let bytes = match remote.get(&self.remote_key(key)).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "second-level read failed");
                return None;
            }
        };

        match CacheEntry::from_remote_bytes(&bytes) {
            Ok(entry) if !entry.is_expired() => {
                let entry = Arc::new(entry);
                // Not a new value: install without notifying anyone.
                self.store.insert(entry.clone());
                debug!(key = %key, "rehydrated from second level");
                Some(entry)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(key = %key, error = %e, "corrupt envelope treated as miss");
                None
            }
        }
    }

    /// Install `value` under `key`, replacing any previous entry.
    ///
    /// The entry is visible in L1 before its fingerprint exists; sealing,
    /// the invalidation publish, and the remote mirror follow per the
    /// configured [`NotificationMode`].
    #[tracing::instrument(skip(self, value))]
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let value = serde_json::to_value(value).map_err(|e| CacheError::Encode {
            key: key.to_string(),
            source: e,
        })?;
        let entry = Arc::new(CacheEntry::new(key, value, self.ttl_or_default(ttl)));
        self.store.insert(entry.clone());
        metrics::record_operation("set", "success");

        match self.config.notification_mode {
            NotificationMode::Async => {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.enqueue(entry);
                }
            }
            NotificationMode::Sync => {
                let failure = entry.seal(self.config.compression_threshold).err();
                match failure {
                    None => {
                        metrics::record_seal(
                            entry.size_bytes(),
                            entry.size_bytes() >= self.config.compression_threshold,
                        );
                        let _ = self.effects_tx.send(CacheEffect::Upsert { entry });
                    }
                    Some(e) => {
                        warn!(key = %key, error = %e, "inline seal failed; entry stays live without a fingerprint");
                    }
                }
            }
            NotificationMode::None => {}
        }
        Ok(())
    }

    /// Remove `key`. Returns whether a live entry was removed. Peers are
    /// notified and the mirrored copy is deleted.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.store.remove(key, true, None);
        metrics::record_operation("remove", if removed { "success" } else { "skipped" });
        removed
    }

    /// Remove every key matching `pattern` (`*` is the only metacharacter;
    /// anchored unless the pattern starts with `*`). One aggregated
    /// invalidation travels to peers; the remote copies are deleted
    /// server-side. Returns the local removal count.
    #[tracing::instrument(skip(self))]
    pub async fn remove_by_pattern(&self, pattern: &str) -> usize {
        let removed = self.store.remove_by_pattern(pattern, true);
        metrics::record_operation("pattern", "success");
        removed
    }

    /// Drain the whole namespace, locally and (via one aggregated message)
    /// on every peer and the remote second level.
    #[tracing::instrument(skip(self))]
    pub async fn clear(&self) {
        self.store.clear(true);
        metrics::record_operation("clear", "success");
    }

    /// Run one expiration sweep now, in addition to the periodic one.
    /// Returns the number of entries reclaimed.
    pub async fn evict_expired(&self) -> usize {
        self.store.evict_expired()
    }

    /// Live entry count and sealed payload bytes.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    /// Live entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stats().count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seal everything queued on the write pipeline and wait for it.
    ///
    /// Useful in tests and before planned handoffs; normal operation never
    /// needs it.
    pub async fn flush_pending_writes(&self) {
        if let Some(pipeline) = &self.pipeline {
            pipeline.flush().await;
        }
    }

    /// Flush pending writes, then stop the background tasks. Queued
    /// backplane publishes are given a moment to drain; anything later is
    /// dropped, which the coherence model tolerates.
    pub async fn shutdown(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.shutdown().await;
        }
        // Let the effect task drain what the flush just produced.
        tokio::time::sleep(Duration::from_millis(10)).await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!(instance = %self.instance_id, "cache shut down");
    }
}

impl Drop for MeshCache {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct EffectContext {
    prefix: String,
    instance_id: String,
    listener: Option<ChangeListener>,
    remote: Option<Arc<dyn RemoteStore>>,
    mirror: bool,
}

impl EffectContext {
    fn emit(&self, event: EntryEvent) {
        if let Some(listener) = &self.listener {
            listener(&event);
        }
    }

    fn publish(&self, message: InvalidationMessage) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let channel = self.prefix.clone();
        tokio::spawn(async move {
            match remote.publish(&channel, &message.encode()).await {
                Ok(()) => metrics::record_backplane("outbound", "published"),
                Err(e) => {
                    metrics::record_backplane("outbound", "error");
                    warn!(key = %message.key, error = %e, "invalidation publish failed");
                }
            }
        });
    }

    fn mirror_set(&self, entry: &Arc<CacheEntry>) {
        if !self.mirror {
            return;
        }
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let Some(envelope) = entry.envelope_bytes().map(<[u8]>::to_vec) else {
            return;
        };
        let Some(ttl) = entry.remaining_ttl() else {
            return;
        };
        let key = format!("{}:{}", self.prefix, entry.key());
        let log_key = entry.key().to_string();
        tokio::spawn(async move {
            if let Err(e) = remote.set_with_ttl(&key, &envelope, ttl).await {
                warn!(key = %log_key, error = %e, "second-level mirror write failed");
            }
        });
    }

    fn mirror_delete(&self, key: &str) {
        if !self.mirror {
            return;
        }
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let remote_key = format!("{}:{}", self.prefix, key);
        let log_key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = remote.delete(&remote_key).await {
                warn!(key = %log_key, error = %e, "second-level delete failed");
            }
        });
    }

    fn mirror_delete_pattern(&self, pattern: &str) {
        if !self.mirror {
            return;
        }
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let remote_pattern = format!("{}:{}", self.prefix, pattern);
        let log_pattern = pattern.to_string();
        tokio::spawn(async move {
            if let Err(e) = remote.delete_by_pattern(&remote_pattern).await {
                warn!(pattern = %log_pattern, error = %e, "second-level pattern delete failed");
            }
        });
    }
}

/// Fan each mutation out to the listener, the backplane, and the remote
/// mirror. Remote traffic is fire-and-forget: a failure is logged and never
/// fails the local operation.
async fn run_effects(mut rx: mpsc::UnboundedReceiver<CacheEffect>, ctx: EffectContext) {
    while let Some(effect) = rx.recv().await {
        match effect {
            CacheEffect::Upsert { entry } => {
                let fingerprint = entry.fingerprint().map(str::to_string);
                ctx.emit(EntryEvent {
                    key: entry.key().to_string(),
                    cause: EventCause::AddOrUpdate,
                    fingerprint: fingerprint.clone(),
                    is_pattern: false,
                });
                ctx.publish(InvalidationMessage::single(
                    ctx.prefix.as_str(),
                    ctx.instance_id.as_str(),
                    entry.key(),
                    fingerprint,
                ));
                ctx.mirror_set(&entry);
            }
            CacheEffect::Remove { key, fingerprint } => {
                ctx.emit(EntryEvent {
                    key: key.clone(),
                    cause: EventCause::Remove,
                    fingerprint: fingerprint.clone(),
                    is_pattern: false,
                });
                ctx.publish(InvalidationMessage::single(
                    ctx.prefix.as_str(),
                    ctx.instance_id.as_str(),
                    key.as_str(),
                    fingerprint,
                ));
                ctx.mirror_delete(&key);
            }
            CacheEffect::Expire { key, fingerprint } => {
                ctx.emit(EntryEvent {
                    key: key.clone(),
                    cause: EventCause::Expire,
                    fingerprint: fingerprint.clone(),
                    is_pattern: false,
                });
                // The mirrored copy carries its own TTL; only peers need to
                // hear about this.
                ctx.publish(InvalidationMessage::single(
                    ctx.prefix.as_str(),
                    ctx.instance_id.as_str(),
                    key.as_str(),
                    fingerprint,
                ));
            }
            CacheEffect::RemovePattern { pattern } => {
                ctx.emit(EntryEvent {
                    key: pattern.clone(),
                    cause: EventCause::Remove,
                    fingerprint: None,
                    is_pattern: true,
                });
                ctx.publish(InvalidationMessage::pattern(
                    ctx.prefix.as_str(),
                    ctx.instance_id.as_str(),
                    pattern.as_str(),
                ));
                ctx.mirror_delete_pattern(&pattern);
            }
            CacheEffect::Clear => {
                ctx.emit(EntryEvent {
                    key: "*".to_string(),
                    cause: EventCause::Clear,
                    fingerprint: None,
                    is_pattern: true,
                });
                ctx.publish(InvalidationMessage::pattern(
                    ctx.prefix.as_str(),
                    ctx.instance_id.as_str(),
                    "*",
                ));
                ctx.mirror_delete_pattern("*");
            }
        }
    }
}
