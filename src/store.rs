// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L1: the in-process concurrent store.
//!
//! A `DashMap` from key to `Arc<CacheEntry>` with TTL-aware reads, guarded
//! removal, pattern removal, and a coalesced expiration sweep. Mutations
//! that should be observable (`notify = true`) emit [`CacheEffect`]s on an
//! unbounded channel; the coordinator turns those into listener callbacks,
//! backplane messages, and remote-mirror operations.
//!
//! Expired entries are invisible to reads immediately; the sweeper reclaims
//! the memory later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::types::{CacheEffect, CacheStats};
use crate::config::EvictionPolicy;
use crate::entry::CacheEntry;
use crate::pattern;

/// Guard consulted by [`L1Store::remove`]: given the live entry's
/// fingerprint, return `true` to skip the removal.
pub type RemoveGuard<'a> = &'a dyn Fn(&str) -> bool;

pub struct L1Store {
    entries: DashMap<String, Arc<CacheEntry>>,
    policy: EvictionPolicy,
    effects: mpsc::UnboundedSender<CacheEffect>,
    sweeping: AtomicBool,
}

impl L1Store {
    pub(crate) fn new(policy: EvictionPolicy, effects: mpsc::UnboundedSender<CacheEffect>) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            effects,
            sweeping: AtomicBool::new(false),
        }
    }

    pub(crate) fn send_effect(&self, effect: CacheEffect) {
        // The receiver lives as long as the coordinator; a send after
        // shutdown is dropped silently.
        let _ = self.effects.send(effect);
    }

    /// Atomically install an entry, replacing any previous one.
    /// Returns the replaced entry, if any.
    pub fn insert(&self, entry: Arc<CacheEntry>) -> Option<Arc<CacheEntry>> {
        self.entries.insert(entry.key().to_string(), entry)
    }

    /// Current live entry for `key`. Expired entries read as absent.
    /// Under LRU a hit slides the entry's deadlines.
    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            return None;
        }
        if self.policy == EvictionPolicy::Lru {
            entry.refresh();
        }
        Some(entry.clone())
    }

    /// Like [`get`](Self::get) but without the LRU refresh; used by paths
    /// that re-check after acquiring a lock and must not extend lifetimes.
    pub fn peek(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.get(key)?;
        (!entry.is_expired()).then(|| entry.clone())
    }

    /// Remove `key`. Returns whether a live (non-expired) entry was removed.
    ///
    /// When `guard` is provided and the live entry has a fingerprint, the
    /// guard is consulted first: a `true` result skips the removal entirely.
    /// Backplane ingress passes `|fp| fp == message_fingerprint` here, so an
    /// invalidation for content the local copy already has is a no-op.
    pub fn remove(&self, key: &str, notify: bool, guard: Option<RemoveGuard<'_>>) -> bool {
        if let (Some(guard), Some(entry)) = (guard, self.entries.get(key)) {
            if let Some(fp) = entry.fingerprint() {
                if guard(fp) {
                    debug!(key = %key, "removal skipped by fingerprint guard");
                    return false;
                }
            }
        }

        let Some((_, entry)) = self.entries.remove(key) else {
            return false;
        };
        let was_live = !entry.is_expired();
        if notify {
            self.send_effect(CacheEffect::Remove {
                key: key.to_string(),
                fingerprint: entry.fingerprint().map(str::to_string),
            });
        }
        was_live
    }

    /// Remove every key matching `pattern` (`*` wildcard grammar).
    ///
    /// Matched entries are removed without individual notification; a single
    /// aggregated effect carries the pattern itself. Returns the number of
    /// removed entries. Pattern removal never refreshes TTLs.
    pub fn remove_by_pattern(&self, pat: &str, notify: bool) -> usize {
        let matched: Vec<String> = self
            .entries
            .iter()
            .filter(|e| pattern::matches(pat, e.key()))
            .map(|e| e.key().to_string())
            .collect();

        let mut removed = 0;
        for key in &matched {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        if notify {
            self.send_effect(CacheEffect::RemovePattern {
                pattern: pat.to_string(),
            });
        }
        debug!(pattern = %pat, removed, "pattern removal");
        removed
    }

    /// Drain the whole map. One aggregated effect, never one per key.
    pub fn clear(&self, notify: bool) {
        self.entries.clear();
        if notify {
            self.send_effect(CacheEffect::Clear);
        }
    }

    /// Scan for expired entries and reclaim them, tagging each as `Expire`.
    ///
    /// Concurrent sweeps coalesce through a non-blocking try-enter: an
    /// overlapping sweep simply drops. Returns the number of entries
    /// reclaimed (zero when skipped).
    pub fn evict_expired(&self) -> usize {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return 0;
        }

        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired())
            .map(|e| e.key().to_string())
            .collect();

        let mut removed = 0;
        for key in expired {
            // Re-check before removal: a writer may have replaced the entry
            // with a live one since the scan. The guard must drop before the
            // remove touches the same shard.
            let still_expired = self.entries.get(&key).is_some_and(|e| e.is_expired());
            if !still_expired {
                continue;
            }
            if let Some((_, entry)) = self.entries.remove(&key) {
                removed += 1;
                self.send_effect(CacheEffect::Expire {
                    key,
                    fingerprint: entry.fingerprint().map(str::to_string),
                });
            }
        }

        self.sweeping.store(false, Ordering::Release);
        if removed > 0 {
            debug!(removed, "expiration sweep reclaimed entries");
        }
        removed
    }

    /// Entry count, including not-yet-swept expired entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count of live entries and sum of their sealed payload sizes.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut count = 0;
        let mut size_bytes = 0;
        for entry in self.entries.iter() {
            if entry.is_expired() {
                continue;
            }
            count += 1;
            size_bytes += entry.size_bytes();
        }
        CacheStats { count, size_bytes }
    }

    /// Live keys, for diagnostics and tests.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.key().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn store(policy: EvictionPolicy) -> (L1Store, UnboundedReceiver<CacheEffect>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (L1Store::new(policy, tx), rx)
    }

    fn entry(key: &str, ttl_ms: u64) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(
            key,
            json!({"k": key}),
            Duration::from_millis(ttl_ms),
        ))
    }

    fn sealed_entry(key: &str, ttl_ms: u64) -> Arc<CacheEntry> {
        let e = entry(key, ttl_ms);
        e.seal(usize::MAX).unwrap();
        e
    }

    #[test]
    fn test_insert_and_get() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        store.insert(entry("a", 60_000));

        assert!(store.get("a").is_some());
        assert!(store.get("b").is_none());
    }

    #[test]
    fn test_insert_replaces_atomically() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        store.insert(entry("a", 60_000));
        let replaced = store.insert(entry("a", 60_000));

        assert!(replaced.is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_expired_entry_reads_absent_before_sweep() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        store.insert(entry("a", 0));
        std::thread::sleep(Duration::from_millis(5));

        assert!(store.get("a").is_none());
        // Still physically present until the sweeper runs.
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_lru_get_refreshes_deadline() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        store.insert(entry("a", 60));

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get("a").is_some());
        std::thread::sleep(Duration::from_millis(40));
        // 80ms elapsed total, but the hit at 40ms reset the 60ms window.
        assert!(store.get("a").is_some());
    }

    #[test]
    fn test_fifo_get_never_refreshes() {
        let (store, _rx) = store(EvictionPolicy::Fifo);
        store.insert(entry("a", 60));

        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get("a").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_remove_returns_liveness() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        store.insert(entry("live", 60_000));
        store.insert(entry("dead", 0));
        std::thread::sleep(Duration::from_millis(5));

        assert!(store.remove("live", false, None));
        assert!(!store.remove("dead", false, None));
        assert!(!store.remove("missing", false, None));
    }

    #[test]
    fn test_remove_emits_effect_with_fingerprint() {
        let (store, mut rx) = store(EvictionPolicy::Lru);
        let e = sealed_entry("a", 60_000);
        let fp = e.fingerprint().unwrap().to_string();
        store.insert(e);

        store.remove("a", true, None);

        match rx.try_recv().unwrap() {
            CacheEffect::Remove { key, fingerprint } => {
                assert_eq!(key, "a");
                assert_eq!(fingerprint.as_deref(), Some(fp.as_str()));
            }
            other => panic!("unexpected effect: {other:?}"),
        }
    }

    #[test]
    fn test_remove_silent_emits_nothing() {
        let (store, mut rx) = store(EvictionPolicy::Lru);
        store.insert(entry("a", 60_000));

        store.remove("a", false, None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_skips_when_guard_matches() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        let e = sealed_entry("a", 60_000);
        let fp = e.fingerprint().unwrap().to_string();
        store.insert(e);

        // Equal fingerprints: the local copy already matches, keep it.
        assert!(!store.remove("a", false, Some(&|local| local == fp)));
        assert!(store.get("a").is_some());

        // Different fingerprint: stale copy, drop it.
        assert!(store.remove("a", false, Some(&|local| local == "other")));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_guard_on_unsealed_entry_removes() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        store.insert(entry("a", 60_000));

        // No fingerprint yet: the guard cannot vouch for the copy.
        assert!(store.remove("a", false, Some(&|_| true)));
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_remove_by_pattern_prefix() {
        let (store, mut rx) = store(EvictionPolicy::Lru);
        for key in ["11", "12", "22", "13", "23", "33"] {
            store.insert(entry(key, 60_000));
        }

        let removed = store.remove_by_pattern("2*", true);
        assert_eq!(removed, 2);

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["11", "12", "13", "33"]);

        // One aggregated effect, not one per key.
        match rx.try_recv().unwrap() {
            CacheEffect::RemovePattern { pattern } => assert_eq!(pattern, "2*"),
            other => panic!("unexpected effect: {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_by_pattern_is_idempotent() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        for key in ["a1", "a2", "b1"] {
            store.insert(entry(key, 60_000));
        }

        assert_eq!(store.remove_by_pattern("a*", false), 2);
        assert_eq!(store.remove_by_pattern("a*", false), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_clear_emits_single_effect() {
        let (store, mut rx) = store(EvictionPolicy::Lru);
        for i in 0..10 {
            store.insert(entry(&format!("k{i}"), 60_000));
        }

        store.clear(true);
        assert!(store.is_empty());
        assert!(matches!(rx.try_recv().unwrap(), CacheEffect::Clear));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_evict_expired_tags_expire() {
        let (store, mut rx) = store(EvictionPolicy::Lru);
        store.insert(entry("dead", 0));
        store.insert(entry("live", 60_000));
        std::thread::sleep(Duration::from_millis(5));

        let removed = store.evict_expired();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);

        match rx.try_recv().unwrap() {
            CacheEffect::Expire { key, .. } => assert_eq!(key, "dead"),
            other => panic!("unexpected effect: {other:?}"),
        }
    }

    #[test]
    fn test_stats_counts_live_and_sealed_sizes() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        store.insert(sealed_entry("a", 60_000));
        store.insert(entry("b", 60_000)); // unsealed, size 0
        store.insert(entry("dead", 0));
        std::thread::sleep(Duration::from_millis(5));

        let stats = store.stats();
        assert_eq!(stats.count, 2);
        assert!(stats.size_bytes > 0);
    }

    #[tokio::test]
    async fn test_concurrent_inserts() {
        let (store, _rx) = store(EvictionPolicy::Lru);
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for batch in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store.insert(entry(&format!("b{batch}-i{i}"), 60_000));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len(), 100);
    }
}
