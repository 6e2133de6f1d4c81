// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invalidation messages and the inbound apply rules.
//!
//! The backplane channel is named by the cache prefix; every instance
//! publishes and subscribes on the same channel. Messages carry the sender's
//! instance id; that is the whole loopback-suppression mechanism, no
//! broker-side filtering exists. Delivery may duplicate; applying a message
//! twice is a no-op thanks to the fingerprint guard and the idempotence of
//! removal.
//!
//! Messages never carry values. The backplane is an invalidation bus, not a
//! data plane.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::entry::wall_ms;
use crate::store::L1Store;

/// Wire record exchanged on the backplane. JSON, one record per publish,
/// immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidationMessage {
    /// Namespace of the sending cache; receivers drop foreign prefixes.
    pub cache_prefix: String,
    /// Identity of the sending instance, for loopback suppression.
    pub instance_id: String,
    /// Affected key, or a pattern when `is_pattern` is set.
    pub key: String,
    /// Content fingerprint the sender just established; absent for pattern
    /// deletes and for removes that happened before the entry was sealed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Send time in unix-epoch milliseconds. Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub is_pattern: bool,
}

impl InvalidationMessage {
    /// Message for a single-key mutation (write completion, remove, expiry).
    pub fn single(
        cache_prefix: impl Into<String>,
        instance_id: impl Into<String>,
        key: impl Into<String>,
        fingerprint: Option<String>,
    ) -> Self {
        Self {
            cache_prefix: cache_prefix.into(),
            instance_id: instance_id.into(),
            key: key.into(),
            fingerprint,
            timestamp_ms: Some(wall_ms()),
            is_pattern: false,
        }
    }

    /// Message for a pattern removal (`"*"` for a full clear).
    pub fn pattern(
        cache_prefix: impl Into<String>,
        instance_id: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Self {
        Self {
            cache_prefix: cache_prefix.into(),
            instance_id: instance_id.into(),
            key: pattern.into(),
            fingerprint: None,
            timestamp_ms: Some(wall_ms()),
            is_pattern: true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // A struct of strings and scalars cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Apply one inbound backplane payload against the local store.
///
/// Rules, in order: undecodable or foreign-prefix payloads are dropped;
/// the sender's own echo is dropped; pattern messages remove silently by
/// pattern; single-key messages remove silently with a fingerprint guard
/// that **skips** the removal when the local copy's fingerprint equals the
/// message's: the local state already matches what the sender established,
/// so the message is redundant.
pub(crate) fn apply_inbound(store: &L1Store, prefix: &str, self_id: &str, payload: &[u8]) {
    let message = match InvalidationMessage::decode(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "undecodable backplane payload dropped");
            return;
        }
    };

    if message.cache_prefix != prefix {
        trace!(prefix = %message.cache_prefix, "foreign-prefix message dropped");
        return;
    }
    if message.instance_id == self_id {
        trace!(key = %message.key, "loopback message dropped");
        return;
    }

    if message.is_pattern {
        let removed = store.remove_by_pattern(&message.key, false);
        debug!(pattern = %message.key, removed, from = %message.instance_id, "applied pattern invalidation");
    } else {
        let removed = match message.fingerprint.as_deref() {
            Some(fp) => store.remove(&message.key, false, Some(&|local: &str| local == fp)),
            None => store.remove(&message.key, false, None),
        };
        debug!(key = %message.key, removed, from = %message.instance_id, "applied invalidation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::types::CacheEffect;
    use crate::config::EvictionPolicy;
    use crate::entry::CacheEntry;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn store() -> (L1Store, mpsc::UnboundedReceiver<CacheEffect>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (L1Store::new(EvictionPolicy::Lru, tx), rx)
    }

    fn sealed(key: &str) -> Arc<CacheEntry> {
        let e = Arc::new(CacheEntry::new(key, json!({"k": key}), Duration::from_secs(60)));
        e.seal(usize::MAX).unwrap();
        e
    }

    fn payload(message: &InvalidationMessage) -> Vec<u8> {
        message.encode()
    }

    #[test]
    fn test_roundtrip_encoding() {
        let msg = InvalidationMessage::single("app", "i-1", "user.1", Some("abc".into()));
        let decoded = InvalidationMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let msg = InvalidationMessage::pattern("app", "i-1", "2*");
        let text = String::from_utf8(msg.encode()).unwrap();
        assert!(!text.contains("fingerprint"));
        assert!(text.contains("\"is_pattern\":true"));
    }

    #[test]
    fn test_decode_tolerates_minimal_record() {
        let decoded = InvalidationMessage::decode(
            br#"{"cache_prefix":"app","instance_id":"i-9","key":"k"}"#,
        )
        .unwrap();
        assert!(!decoded.is_pattern);
        assert!(decoded.fingerprint.is_none());
        assert!(decoded.timestamp_ms.is_none());
    }

    #[test]
    fn test_foreign_prefix_is_dropped() {
        let (store, _rx) = store();
        store.insert(sealed("k"));

        let msg = InvalidationMessage::single("other-app", "i-2", "k", None);
        apply_inbound(&store, "app", "i-1", &payload(&msg));

        assert!(store.get("k").is_some());
    }

    #[test]
    fn test_loopback_is_dropped() {
        let (store, _rx) = store();
        store.insert(sealed("k"));

        let msg = InvalidationMessage::single("app", "i-1", "k", None);
        apply_inbound(&store, "app", "i-1", &payload(&msg));

        assert!(store.get("k").is_some());
    }

    #[test]
    fn test_peer_remove_applies() {
        let (store, mut rx) = store();
        store.insert(sealed("k"));

        let msg = InvalidationMessage::single("app", "i-2", "k", None);
        apply_inbound(&store, "app", "i-1", &payload(&msg));

        assert!(store.get("k").is_none());
        // Inbound applications never re-notify.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_equal_fingerprint_skips_removal() {
        let (store, _rx) = store();
        let entry = sealed("k");
        let fp = entry.fingerprint().unwrap().to_string();
        store.insert(entry);

        let msg = InvalidationMessage::single("app", "i-2", "k", Some(fp));
        apply_inbound(&store, "app", "i-1", &payload(&msg));

        // Redundant message: local copy already has this content.
        assert!(store.get("k").is_some());
    }

    #[test]
    fn test_different_fingerprint_removes() {
        let (store, _rx) = store();
        store.insert(sealed("k"));

        let msg = InvalidationMessage::single("app", "i-2", "k", Some("deadbeef".into()));
        apply_inbound(&store, "app", "i-1", &payload(&msg));

        assert!(store.get("k").is_none());
    }

    #[test]
    fn test_pattern_message_applies() {
        let (store, _rx) = store();
        for key in ["11", "12", "22", "23", "33"] {
            store.insert(sealed(key));
        }

        let msg = InvalidationMessage::pattern("app", "i-2", "2*");
        apply_inbound(&store, "app", "i-1", &payload(&msg));

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["11", "12", "33"]);
    }

    #[test]
    fn test_duplicate_pattern_message_is_idempotent() {
        let (store, _rx) = store();
        for key in ["a1", "a2", "b1"] {
            store.insert(sealed(key));
        }

        let msg = InvalidationMessage::pattern("app", "i-2", "a*");
        apply_inbound(&store, "app", "i-1", &payload(&msg));
        apply_inbound(&store, "app", "i-1", &payload(&msg));

        assert_eq!(store.keys(), vec!["b1"]);
    }

    #[test]
    fn test_garbage_payload_is_dropped() {
        let (store, _rx) = store();
        store.insert(sealed("k"));

        apply_inbound(&store, "app", "i-1", b"not json");

        assert!(store.get("k").is_some());
    }
}
