// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote store.
//!
//! Implements the full [`RemoteStore`] contract (TTL'd key/value plus
//! broadcast pub/sub) against process memory. Share one instance between
//! several caches and they behave like a fleet wired to a real broker,
//! which is exactly what the integration tests do.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use super::traits::{RemoteError, RemoteStore};
use crate::pattern;

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

#[derive(Default)]
pub struct InMemoryRemote {
    data: DashMap<String, StoredValue>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl InMemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, name: &str) -> broadcast::Sender<Vec<u8>> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.iter().filter(|v| !v.is_expired()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        Ok(self
            .data
            .get(key)
            .filter(|v| !v.is_expired())
            .map(|v| v.data.clone()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RemoteError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), RemoteError> {
        self.data.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.data.remove(key);
        Ok(())
    }

    async fn delete_by_pattern(&self, pat: &str) -> Result<u64, RemoteError> {
        let matched: Vec<String> = self
            .data
            .iter()
            .filter(|v| pattern::matches(pat, v.key()))
            .map(|v| v.key().to_string())
            .collect();
        let mut removed = 0;
        for key in matched {
            if self.data.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), RemoteError> {
        // No subscribers is fine; the message just evaporates.
        let _ = self.channel(channel).send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, RemoteError> {
        let mut source = self.channel(channel).subscribe();
        let (tx, rx) = mpsc::channel(1024);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }
}
