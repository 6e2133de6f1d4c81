// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote backend error: {0}")]
    Backend(String),
    #[error("remote connection error: {0}")]
    Connection(String),
}

/// The five key/value primitives plus pub/sub that the cache consumes.
///
/// Implementations must be safe for concurrent use. Keys arrive already
/// prefixed with the cache namespace; patterns use `*` as the only
/// metacharacter and are likewise prefixed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Fetch many keys in one round-trip; the result aligns with the input.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RemoteError>;

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// Delete every key matching `pattern` server-side, bounding
    /// round-trips. Returns the number of keys deleted.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, RemoteError>;

    /// Fire one message at every subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), RemoteError>;

    /// Open a subscription on `channel`. Payloads arrive on the returned
    /// receiver until it is dropped; implementations reconnect internally
    /// where the transport allows it.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, RemoteError>;
}
