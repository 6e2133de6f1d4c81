// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the public cache surface.
//!
//! Only three kinds ever reach callers: a factory-lock timeout, a factory
//! failure, and a construction-time configuration error. Everything that
//! touches the backplane or the remote store is logged and swallowed; the
//! cache prefers availability over strict second-level consistency.

use thiserror::Error;

/// Boxed error type carried by caller-supplied factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The per-key lock could not be acquired within the caller's budget.
    #[error("timed out after {waited_ms} ms waiting for the value factory lock on '{key}'")]
    LockTimeout { key: String, waited_ms: u64 },

    /// The caller-supplied factory failed. Nothing was installed.
    #[error("value factory for '{key}' failed")]
    Factory {
        key: String,
        #[source]
        source: BoxError,
    },

    /// The caller's value could not be reified for storage.
    #[error("failed to encode value for '{key}'")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// An envelope from the remote store failed to parse or decompress.
    /// Treated as a miss on the read path; surfaced only by the direct
    /// envelope API.
    #[error("corrupt remote envelope: {0}")]
    CorruptEnvelope(String),

    /// Invalid configuration, fatal at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = CacheError::LockTimeout {
            key: "user.1".into(),
            waited_ms: 1000,
        };
        assert!(err.to_string().contains("user.1"));
        assert!(err.to_string().contains("1000"));

        let err = CacheError::Config("cache_prefix must not be empty".into());
        assert!(err.to_string().contains("cache_prefix"));
    }

    #[test]
    fn test_factory_source_is_preserved() {
        use std::error::Error;

        let inner: BoxError = "database unreachable".into();
        let err = CacheError::Factory {
            key: "user.1".into(),
            source: inner,
        };
        assert!(err.source().unwrap().to_string().contains("unreachable"));
    }
}
