// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entries, seals, and the remote envelope format.
//!
//! A [`CacheEntry`] is installed in L1 the moment it is written, with both
//! of its deadlines already computed so expiry checks are correct before
//! serialization completes. The seal (canonical payload bytes, content
//! fingerprint, optional compression, and the envelope mirrored to the
//! remote store) is produced later, usually on the background pipeline.
//!
//! Expiry is judged against a monotonic clock so wall-clock jumps can never
//! resurrect or prematurely kill an entry; the wall-clock deadline exists for
//! the remote TTL and for cross-process rehydration.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::compression;
use crate::errors::CacheError;

/// Milliseconds on a process-local monotonic clock.
///
/// The zero point is the first call in this process; only differences are
/// meaningful, and never across processes.
#[must_use]
pub fn mono_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Wall-clock unix-epoch milliseconds.
#[must_use]
pub fn wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The sealed form of an entry: canonical bytes digested, packaged, sized.
#[derive(Debug)]
pub struct Seal {
    /// SHA-256 hex of the canonical payload bytes.
    pub fingerprint: String,
    /// Envelope bytes as mirrored to the remote store.
    pub envelope: Vec<u8>,
    /// Length of the canonical (uncompressed) payload bytes.
    pub size_bytes: usize,
}

/// One cached value with its lifetime metadata.
///
/// Entries are shared as `Arc<CacheEntry>`; replacement swaps the whole
/// entry, so a fingerprint, once set, never changes in place.
pub struct CacheEntry {
    key: String,
    value: Value,
    ttl: Duration,
    created_at_ms: i64,
    /// Wall-clock staleness deadline; slides under LRU.
    expires_at_ms: AtomicI64,
    /// Monotonic staleness deadline; authoritative for [`is_expired`](Self::is_expired).
    kill_tick_ms: AtomicU64,
    seal: OnceLock<Seal>,
}

impl CacheEntry {
    /// Create a fresh entry. Both deadlines are computed immediately.
    pub fn new(key: impl Into<String>, value: Value, ttl: Duration) -> Self {
        let ttl_ms = ttl.as_millis() as u64;
        let now = wall_ms();
        Self {
            key: key.into(),
            value,
            ttl,
            created_at_ms: now,
            expires_at_ms: AtomicI64::new(now + ttl_ms as i64),
            kill_tick_ms: AtomicU64::new(mono_ms() + ttl_ms),
            seal: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    #[must_use]
    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at_ms.load(Ordering::Relaxed)
    }

    /// Decode the payload as `T`. A type mismatch yields `None`, never an
    /// error: the entry simply isn't the value the caller asked for.
    #[must_use]
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        T::deserialize(&self.value).ok()
    }

    /// Raw payload value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether the monotonic deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        mono_ms() > self.kill_tick_ms.load(Ordering::Relaxed)
    }

    /// Slide both deadlines forward by the entry's TTL (LRU read hit).
    pub fn refresh(&self) {
        let ttl_ms = self.ttl.as_millis() as u64;
        self.expires_at_ms
            .store(wall_ms() + ttl_ms as i64, Ordering::Relaxed);
        self.kill_tick_ms.store(mono_ms() + ttl_ms, Ordering::Relaxed);
    }

    /// Time left until the wall-clock deadline, if any.
    #[must_use]
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let left = self.expires_at_ms() - wall_ms();
        (left > 0).then(|| Duration::from_millis(left as u64))
    }

    /// Content fingerprint, present once the entry is sealed.
    #[must_use]
    pub fn fingerprint(&self) -> Option<&str> {
        self.seal.get().map(|s| s.fingerprint.as_str())
    }

    /// Sealed envelope bytes, present once the entry is sealed.
    #[must_use]
    pub fn envelope_bytes(&self) -> Option<&[u8]> {
        self.seal.get().map(|s| s.envelope.as_slice())
    }

    /// Canonical payload size; zero until sealed.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.seal.get().map_or(0, |s| s.size_bytes)
    }

    /// Serialize the payload, digest it, compress above `threshold`, and
    /// package the envelope. Idempotent: a second call returns the existing
    /// seal untouched.
    pub fn seal(&self, threshold: usize) -> Result<&Seal, CacheError> {
        if let Some(seal) = self.seal.get() {
            return Ok(seal);
        }

        let payload = serde_json::to_vec(&self.value).map_err(|e| CacheError::Encode {
            key: self.key.clone(),
            source: e,
        })?;
        let size_bytes = payload.len();
        let fingerprint = hex::encode(Sha256::digest(&payload));

        let compressed = size_bytes >= threshold;
        let envelope_payload = if compressed {
            let packed = compression::compress_bytes(&payload)
                .map_err(|e| CacheError::CorruptEnvelope(e.to_string()))?;
            debug!(
                key = %self.key,
                raw = size_bytes,
                packed = packed.len(),
                "payload compressed for envelope"
            );
            Value::String(hex::encode(packed))
        } else {
            self.value.clone()
        };

        let envelope = Envelope {
            key: self.key.clone(),
            ttl_ms: self.ttl.as_millis() as u64,
            created_at_ms: self.created_at_ms,
            expires_at_ms: self.expires_at_ms(),
            kill_tick_ms: self.kill_tick_ms.load(Ordering::Relaxed),
            fingerprint: fingerprint.clone(),
            compressed,
            payload: envelope_payload,
        };
        let envelope = serde_json::to_vec(&envelope).map_err(|e| CacheError::Encode {
            key: self.key.clone(),
            source: e,
        })?;

        // A racing seal may have won; either way the stored seal is used.
        let _ = self.seal.set(Seal {
            fingerprint,
            envelope,
            size_bytes,
        });
        Ok(self.seal.get().expect("seal just installed"))
    }

    /// Reconstruct an entry from envelope bytes fetched from the remote
    /// store.
    ///
    /// Wall-clock metadata (`created_at_ms`, `expires_at_ms`, `ttl_ms`) and
    /// the fingerprint come back verbatim. The monotonic deadline is
    /// re-derived from the remaining wall-clock lifetime: another process's
    /// monotonic tick has no meaning here.
    pub fn from_remote_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| CacheError::CorruptEnvelope(e.to_string()))?;

        let value = if envelope.compressed {
            let packed = match &envelope.payload {
                Value::String(s) => hex::decode(s)
                    .map_err(|e| CacheError::CorruptEnvelope(format!("bad payload hex: {e}")))?,
                other => {
                    return Err(CacheError::CorruptEnvelope(format!(
                        "compressed payload must be a hex string, got {other}"
                    )))
                }
            };
            let raw = compression::decompress_bytes(&packed)
                .map_err(|e| CacheError::CorruptEnvelope(e.to_string()))?;
            serde_json::from_slice(&raw)
                .map_err(|e| CacheError::CorruptEnvelope(format!("bad payload json: {e}")))?
        } else {
            envelope.payload
        };

        let remaining = (envelope.expires_at_ms - wall_ms()).max(0) as u64;
        let entry = Self {
            key: envelope.key.clone(),
            value,
            ttl: Duration::from_millis(envelope.ttl_ms),
            created_at_ms: envelope.created_at_ms,
            expires_at_ms: AtomicI64::new(envelope.expires_at_ms),
            kill_tick_ms: AtomicU64::new(mono_ms() + remaining),
            seal: OnceLock::new(),
        };
        // Rehydrated entries are already sealed: the fingerprint must be
        // available for invalidation guards, and a re-mirror would be a
        // byte-identical write.
        let _ = entry.seal.set(Seal {
            fingerprint: envelope.fingerprint,
            envelope: bytes.to_vec(),
            size_bytes: 0,
        });
        Ok(entry)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("expired", &self.is_expired())
            .field("sealed", &self.seal.get().is_some())
            .finish()
    }
}

/// Wire form of an entry in the remote store.
///
/// JSON-encoded; `payload` is the raw value, or a hex string of the
/// zstd-compressed value bytes when `compressed` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub key: String,
    pub ttl_ms: u64,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    /// Sender-local monotonic deadline, recorded for fidelity only.
    pub kill_tick_ms: u64,
    pub fingerprint: String,
    #[serde(default)]
    pub compressed: bool,
    pub payload: Value,
}
