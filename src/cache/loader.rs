// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-flight and batch loading.
//!
//! `get_or_set` is the cache-aside path with thundering-herd protection:
//! for a given key, at most one factory executes at any instant; other
//! callers wait on the per-key lock (up to their own budget) and then see
//! the value the in-flight factory installed.
//!
//! The batch path deliberately holds no per-key locks: two overlapping
//! concurrent batches may each invoke the factory for a shared key. That
//! trade keeps wide batches one round-trip instead of thousands of lock
//! acquisitions.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::errors::{BoxError, CacheError};
use crate::metrics;

use super::MeshCache;

/// Default factory-wait budget for [`MeshCache::get_or_set`].
pub const DEFAULT_FACTORY_WAIT: Duration = Duration::from_secs(10);

impl MeshCache {
    /// Return the cached value for `key`, producing it with `factory` on a
    /// miss.
    ///
    /// On a miss the per-key lock is acquired (waiting up to `max_wait`),
    /// the cache is re-checked (the previous holder usually filled it)
    /// and only then does the factory run. The produced value is installed
    /// through the normal write path before the lock is released.
    ///
    /// # Errors
    ///
    /// - [`CacheError::LockTimeout`] when the lock isn't acquired in time;
    ///   the in-flight factory keeps running and its value still lands.
    /// - [`CacheError::Factory`] when the factory fails; nothing is
    ///   installed and the lock is released immediately.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use std::time::Duration;
    /// # async fn example(cache: &mesh_cache::MeshCache) -> Result<(), mesh_cache::CacheError> {
    /// let user: String = cache
    ///     .get_or_set(
    ///         "user.42",
    ///         |key| async move { Ok(format!("loaded {key}")) },
    ///         Some(Duration::from_secs(300)),
    ///         Duration::from_secs(10),
    ///     )
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    #[tracing::instrument(skip(self, factory, ttl))]
    pub async fn get_or_set<T, F, Fut>(
        &self,
        key: &str,
        factory: F,
        ttl: Option<Duration>,
        max_wait: Duration,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }

        let _guard = self
            .locks
            .acquire(key, max_wait)
            .await
            .map_err(|e| CacheError::LockTimeout {
                key: key.to_string(),
                waited_ms: e.waited_ms,
            })?;

        // Another holder may have filled it while we waited.
        if let Some(value) = self.get(key).await {
            debug!(key = %key, "filled by previous lock holder");
            return Ok(value);
        }

        let _timer = metrics::LatencyTimer::new("factory");
        let value = factory(key.to_string())
            .await
            .map_err(|source| CacheError::Factory {
                key: key.to_string(),
                source,
            })?;

        self.set(key, &value, ttl).await?;
        metrics::record_operation("factory", "success");
        Ok(value)
    }

    /// Batch cache-aside: partition `keys` into hits and misses, consult
    /// the second level once for the misses, invoke `factory` once with the
    /// keys still missing, install its results, and return values aligned
    /// to the input order.
    ///
    /// Keys the factory leaves out come back as `None`. No per-key locking
    /// is performed (see module docs).
    #[tracing::instrument(skip(self, factory, ttl), fields(keys = keys.len()))]
    pub async fn get_or_set_batch<T, F, Fut>(
        &self,
        keys: &[String],
        factory: F,
        ttl: Option<Duration>,
    ) -> Result<Vec<Option<T>>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<HashMap<String, T>, BoxError>>,
    {
        let mut results: Vec<Option<T>> = Vec::with_capacity(keys.len());
        let mut missing: Vec<usize> = Vec::new();

        for (i, key) in keys.iter().enumerate() {
            match self.store.get(key).and_then(|entry| entry.decode()) {
                Some(value) => {
                    metrics::record_hit("L1");
                    results.push(Some(value));
                }
                None => {
                    results.push(None);
                    missing.push(i);
                }
            }
        }

        // One MGET for everything L1 didn't have.
        if let (false, Some(remote), true) =
            (missing.is_empty(), self.remote.as_ref(), self.mirrors())
        {
            let remote_keys: Vec<String> =
                missing.iter().map(|&i| self.remote_key(&keys[i])).collect();
            match remote.get_many(&remote_keys).await {
                Ok(found) => {
                    let mut still_missing = Vec::with_capacity(missing.len());
                    for (slot, bytes) in missing.iter().zip(found) {
                        let Some(bytes) = bytes else {
                            still_missing.push(*slot);
                            continue;
                        };
                        match CacheEntry::from_remote_bytes(&bytes) {
                            Ok(entry) if !entry.is_expired() => {
                                let entry = std::sync::Arc::new(entry);
                                self.store.insert(entry.clone());
                                metrics::record_hit("L2");
                                results[*slot] = entry.decode();
                                if results[*slot].is_none() {
                                    still_missing.push(*slot);
                                }
                            }
                            Ok(_) => still_missing.push(*slot),
                            Err(e) => {
                                warn!(key = %keys[*slot], error = %e, "corrupt envelope treated as miss");
                                still_missing.push(*slot);
                            }
                        }
                    }
                    missing = still_missing;
                }
                Err(e) => {
                    warn!(error = %e, "batch second-level read failed");
                }
            }
        }

        if missing.is_empty() {
            return Ok(results);
        }

        let miss_keys: Vec<String> = missing.iter().map(|&i| keys[i].clone()).collect();
        debug!(misses = miss_keys.len(), "invoking batch factory");
        let mut produced = factory(miss_keys.clone())
            .await
            .map_err(|source| CacheError::Factory {
                key: miss_keys.join(","),
                source,
            })?;

        for slot in missing {
            let key = &keys[slot];
            if let Some(value) = produced.remove(key) {
                self.set(key, &value, ttl).await?;
                results[slot] = Some(value);
            }
        }
        metrics::record_operation("batch_factory", "success");
        Ok(results)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(prefix: &str) -> CacheConfig {
        CacheConfig {
            flush_interval_ms: 5,
            ..CacheConfig::new(prefix)
        }
    }

    async fn started(prefix: &str) -> MeshCache {
        let mut cache = MeshCache::new(config(prefix)).unwrap();
        cache.start().await.unwrap();
        cache
    }

    #[tokio::test]
    async fn test_miss_runs_factory_once_then_hits() {
        let cache = started("app").await;
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let value: u64 = cache
                .get_or_set(
                    "k",
                    move |_| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(7)
                    },
                    None,
                    DEFAULT_FACTORY_WAIT,
                )
                .await
                .unwrap();
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_single_flight_blocks_second_caller() {
        let cache = Arc::new(started("app").await);
        let calls = Arc::new(AtomicUsize::new(0));

        let slow_cache = cache.clone();
        let slow_calls = calls.clone();
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_set(
                    "k",
                    move |_| async move {
                        slow_calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok("slow".to_string())
                    },
                    None,
                    DEFAULT_FACTORY_WAIT,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast_calls = calls.clone();
        let start = std::time::Instant::now();
        let value: String = cache
            .get_or_set(
                "k",
                move |_| async move {
                    fast_calls.fetch_add(1, Ordering::SeqCst);
                    Ok("fast".to_string())
                },
                None,
                DEFAULT_FACTORY_WAIT,
            )
            .await
            .unwrap();

        // The second caller blocked on the in-flight factory and got its
        // value; the fast factory never ran.
        assert_eq!(value, "slow");
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_waiter_times_out_but_value_still_lands() {
        let cache = Arc::new(started("app").await);

        let slow_cache = cache.clone();
        let slow = tokio::spawn(async move {
            slow_cache
                .get_or_set(
                    "k",
                    |_| async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok(42u64)
                    },
                    None,
                    DEFAULT_FACTORY_WAIT,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let result: Result<u64, _> = cache
            .get_or_set(
                "k",
                |_| async { Ok(0u64) },
                None,
                Duration::from_millis(100),
            )
            .await;
        assert!(matches!(result, Err(CacheError::LockTimeout { .. })));

        // The first factory completes and installs regardless.
        assert_eq!(slow.await.unwrap().unwrap(), 42);
        assert_eq!(cache.get::<u64>("k").await, Some(42));
    }

    #[tokio::test]
    async fn test_factory_failure_propagates_and_installs_nothing() {
        let cache = started("app").await;

        let result: Result<u64, _> = cache
            .get_or_set(
                "k",
                |_| async { Err::<u64, BoxError>("backend down".into()) },
                None,
                DEFAULT_FACTORY_WAIT,
            )
            .await;

        assert!(matches!(result, Err(CacheError::Factory { .. })));
        assert_eq!(cache.get::<u64>("k").await, None);

        // The lock was released: a retry succeeds immediately.
        let value: u64 = cache
            .get_or_set("k", |_| async { Ok(9) }, None, DEFAULT_FACTORY_WAIT)
            .await
            .unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test]
    async fn test_batch_aligns_results_to_input_order() {
        let cache = started("app").await;
        cache.set("b", &"cached-b".to_string(), None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let results: Vec<Option<String>> = cache
            .get_or_set_batch(
                &keys,
                |misses| async move {
                    // Only the misses arrive here.
                    assert_eq!(misses, vec!["a".to_string(), "c".to_string()]);
                    Ok(misses
                        .into_iter()
                        .map(|k| (k.clone(), format!("made-{k}")))
                        .collect())
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(
            results,
            vec![
                Some("made-a".to_string()),
                Some("cached-b".to_string()),
                Some("made-c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_batch_factory_skipped_when_all_hit() {
        let cache = started("app").await;
        cache.set("a", &1u64, None).await.unwrap();
        cache.set("b", &2u64, None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        let results: Vec<Option<u64>> = cache
            .get_or_set_batch(
                &keys,
                |_| async { panic!("factory must not run on full hit") },
                None,
            )
            .await
            .unwrap();

        assert_eq!(results, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_batch_unproduced_keys_stay_absent() {
        let cache = started("app").await;

        let keys = vec!["x".to_string(), "y".to_string()];
        let results: Vec<Option<u64>> = cache
            .get_or_set_batch(
                &keys,
                |_| async { Ok(HashMap::from([("x".to_string(), 1u64)])) },
                None,
            )
            .await
            .unwrap();

        assert_eq!(results, vec![Some(1), None]);
        assert_eq!(cache.get::<u64>("y").await, None);
    }
}
