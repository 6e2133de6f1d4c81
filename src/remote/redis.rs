// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the remote store.
//!
//! Key/value traffic goes through a multiplexed [`ConnectionManager`];
//! pattern deletes run server-side as a SCAN/UNLINK script so a wide
//! pattern costs one round-trip instead of one per key. Subscriptions use a
//! dedicated pub/sub connection with an infinite reconnect loop, so a dropped
//! broker connection heals without the cache noticing beyond a gap in
//! deliveries.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::{RemoteError, RemoteStore};
use crate::retry::{retry, RetryConfig};

/// Deletes keys matching ARGV[1] in SCAN pages, off the keyspace hot path.
const DELETE_PATTERN_SCRIPT: &str = r#"
local cursor = "0"
local removed = 0
repeat
    local reply = redis.call("SCAN", cursor, "MATCH", ARGV[1], "COUNT", 200)
    cursor = reply[1]
    for _, key in ipairs(reply[2]) do
        redis.call("UNLINK", key)
        removed = removed + 1
    end
until cursor == "0"
return removed
"#;

pub struct RedisRemote {
    connection: ConnectionManager,
    url: String,
}

impl RedisRemote {
    /// Connect with fast-fail startup retries so a bad connection string
    /// surfaces at construction, not at first use.
    pub async fn connect(url: &str) -> Result<Self, RemoteError> {
        let client =
            Client::open(url).map_err(|e| RemoteError::Connection(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| RemoteError::Connection(e.to_string()))?;

        info!(url = %url, "remote store connected");
        Ok(Self {
            connection,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RemoteStore for RedisRemote {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let conn = self.connection.clone();
        let key = key.to_string();

        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let data: Option<Vec<u8>> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| RemoteError::Backend(e.to_string()))
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RemoteError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let conn = self.connection.clone();
        let keys = keys.to_vec();

        retry("redis_mget", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let keys = keys.clone();
            async move {
                let mut cmd = redis::cmd("MGET");
                for key in &keys {
                    cmd.arg(key);
                }
                let data: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| RemoteError::Backend(e.to_string()))
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<(), RemoteError> {
        let conn = self.connection.clone();
        let key = key.to_string();
        let value = value.to_vec();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            let value = value.clone();
            async move {
                // SET with PX keeps millisecond TTL precision.
                let _: () = redis::cmd("SET")
                    .arg(&key)
                    .arg(value.as_slice())
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| RemoteError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let conn = self.connection.clone();
        let key = key.to_string();

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = key.clone();
            async move {
                let _: () = conn.del(&key).await?;
                Ok(())
            }
        })
        .await
        .map_err(|e: redis::RedisError| RemoteError::Backend(e.to_string()))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, RemoteError> {
        let mut conn = self.connection.clone();
        let script = Script::new(DELETE_PATTERN_SCRIPT);

        let removed: u64 = script
            .arg(pattern)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RemoteError::Backend(e.to_string()))?;

        debug!(pattern = %pattern, removed, "server-side pattern delete");
        Ok(removed)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), RemoteError> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| RemoteError::Backend(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Vec<u8>>, RemoteError> {
        let (tx, rx) = mpsc::channel(1024);
        let url = self.url.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                match run_subscription(&url, &channel, &tx).await {
                    Ok(()) => break, // receiver dropped, subscription over
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "subscription lost, reconnecting in 5s");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
            debug!(channel = %channel, "subscription task ended");
        });

        Ok(rx)
    }
}

/// One subscription session on a dedicated pub/sub connection.
///
/// Returns `Ok(())` only when the receiving side hung up; any transport
/// failure returns `Err` so the outer loop reconnects.
async fn run_subscription(
    url: &str,
    channel: &str,
    tx: &mpsc::Sender<Vec<u8>>,
) -> Result<(), RemoteError> {
    let client = Client::open(url).map_err(|e| RemoteError::Connection(e.to_string()))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| RemoteError::Connection(e.to_string()))?;
    pubsub
        .subscribe(channel)
        .await
        .map_err(|e| RemoteError::Connection(e.to_string()))?;

    info!(channel = %channel, "subscribed to invalidation channel");

    let mut stream = pubsub.on_message();
    loop {
        match stream.next().await {
            Some(msg) => {
                let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
                if tx.send(payload).await.is_err() {
                    return Ok(());
                }
            }
            None => return Err(RemoteError::Connection("pub/sub stream closed".into())),
        }
    }
}
