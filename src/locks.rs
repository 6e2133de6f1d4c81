// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-key lock table backing single-flight loads.
//!
//! One single-permit semaphore per key, created on demand and reclaimed
//! after a sliding idle period so user-controlled key strings cannot grow
//! the table without bound. Creation is guarded by a fixed pool of shard
//! mutexes; lookups stay lock-free on the hot path.
//!
//! Cancellation is drop-based: dropping an [`acquire`](KeyLockTable::acquire)
//! future abandons the wait without touching the slot.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::entry::mono_ms;

/// Error returned when a lock cannot be acquired within the caller's budget.
#[derive(Debug, thiserror::Error)]
#[error("lock wait exceeded {waited_ms} ms")]
pub struct LockTimeout {
    pub waited_ms: u64,
}

struct KeySlot {
    permits: Arc<Semaphore>,
    last_used_ms: AtomicU64,
}

impl KeySlot {
    fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            last_used_ms: AtomicU64::new(mono_ms()),
        }
    }

    fn touch(&self) {
        self.last_used_ms.store(mono_ms(), Ordering::Relaxed);
    }
}

/// Holding this guard means exclusive ownership of the key's lock.
/// Dropping it releases the lock; releasing is infallible.
pub struct KeyGuard {
    _permit: OwnedSemaphorePermit,
    slot: Arc<KeySlot>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Keep the slot warm so back-to-back loaders reuse it.
        self.slot.touch();
    }
}

/// Fixed-size shard pool plus a keyed map of single-permit locks.
pub struct KeyLockTable {
    slots: DashMap<String, Arc<KeySlot>>,
    shards: Vec<Mutex<()>>,
    idle_ttl: Duration,
}

impl KeyLockTable {
    pub fn new(pool_size: usize, idle_ttl: Duration) -> Self {
        let shards = (0..pool_size.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            slots: DashMap::new(),
            shards,
            idle_ttl,
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    /// Find or create the slot for `key`.
    ///
    /// Fast path is a lock-free map read. The slow path serializes creation
    /// per shard and double-checks, so two racing creators end up sharing
    /// one slot.
    fn slot_for(&self, key: &str) -> Arc<KeySlot> {
        if let Some(slot) = self.slots.get(key) {
            slot.touch();
            return slot.clone();
        }

        let _shard = self.shards[self.shard_index(key)].lock();
        if let Some(slot) = self.slots.get(key) {
            slot.touch();
            return slot.clone();
        }
        let slot = Arc::new(KeySlot::new());
        self.slots.insert(key.to_string(), slot.clone());
        trace!(key = %key, "created key lock slot");
        slot
    }

    /// Acquire the lock for `key`, waiting up to `timeout`.
    ///
    /// At most one holder exists per key at any instant; waiters on one key
    /// never block lookups on other keys.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<KeyGuard, LockTimeout> {
        let slot = self.slot_for(key);
        let acquired =
            tokio::time::timeout(timeout, slot.permits.clone().acquire_owned()).await;
        match acquired {
            Ok(Ok(permit)) => {
                slot.touch();
                Ok(KeyGuard {
                    _permit: permit,
                    slot,
                })
            }
            // The semaphore is never closed while the table is alive.
            Ok(Err(_)) | Err(_) => Err(LockTimeout {
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Drop slots idle longer than the sliding grace period.
    ///
    /// A slot that is currently held (or referenced by a waiter) survives
    /// regardless of its idle time. Reclaiming while a holder keeps its
    /// `Arc` is harmless: the holder finishes on the detached slot and the
    /// next acquirer transparently creates a fresh one.
    pub fn reclaim_idle(&self) -> usize {
        let cutoff = mono_ms().saturating_sub(self.idle_ttl.as_millis() as u64);
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            Arc::strong_count(slot) > 1 || slot.last_used_ms.load(Ordering::Relaxed) >= cutoff
        });
        let dropped = before - self.slots.len();
        if dropped > 0 {
            trace!(dropped, "reclaimed idle key lock slots");
        }
        dropped
    }

    /// Number of live slots (held or idle-but-recent).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> KeyLockTable {
        KeyLockTable::new(64, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = table();

        let guard = locks.acquire("k", Duration::from_millis(100)).await.unwrap();
        drop(guard);

        // Released: a second acquire succeeds immediately.
        let _guard = locks.acquire("k", Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_contended_acquire_times_out() {
        let locks = Arc::new(table());

        let _held = locks.acquire("k", Duration::from_millis(100)).await.unwrap();

        let start = std::time::Instant::now();
        let result = locks.acquire("k", Duration::from_millis(50)).await;
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = table();

        let _a = locks.acquire("a", Duration::from_millis(50)).await.unwrap();
        let _b = locks.acquire("b", Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(table());

        let guard = locks.acquire("k", Duration::from_millis(100)).await.unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2.acquire("k", Duration::from_secs(2)).await.is_ok()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_at_most_one_holder() {
        use std::sync::atomic::AtomicUsize;

        let locks = Arc::new(table());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("hot", Duration::from_secs(5)).await.unwrap();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idle_slots_are_reclaimed() {
        let locks = KeyLockTable::new(8, Duration::from_millis(10));

        for i in 0..5 {
            let guard = locks
                .acquire(&format!("k{i}"), Duration::from_millis(50))
                .await
                .unwrap();
            drop(guard);
        }
        assert_eq!(locks.len(), 5);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let dropped = locks.reclaim_idle();
        assert_eq!(dropped, 5);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_held_slot_survives_reclaim() {
        let locks = KeyLockTable::new(8, Duration::from_millis(1));

        let _guard = locks.acquire("held", Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        locks.reclaim_idle();
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_after_reclaim_recreates_slot() {
        let locks = KeyLockTable::new(8, Duration::from_millis(1));

        drop(locks.acquire("k", Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.reclaim_idle(), 1);

        // Transparent re-creation.
        let _guard = locks.acquire("k", Duration::from_millis(50)).await.unwrap();
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_double_reclaim_is_idempotent() {
        let locks = KeyLockTable::new(8, Duration::from_millis(1));
        drop(locks.acquire("k", Duration::from_millis(50)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(locks.reclaim_idle(), 1);
        assert_eq!(locks.reclaim_idle(), 0);
    }
}
