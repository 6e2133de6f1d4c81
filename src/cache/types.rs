// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the cache coordinator.

use std::sync::Arc;

use crate::entry::CacheEntry;

/// Why an observable entry change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCause {
    /// A write completed (fingerprint known).
    AddOrUpdate,
    /// An explicit or pattern removal.
    Remove,
    /// The expiration sweeper reclaimed the entry.
    Expire,
    /// The whole namespace was drained.
    Clear,
}

impl std::fmt::Display for EventCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AddOrUpdate => write!(f, "AddOrUpdate"),
            Self::Remove => write!(f, "Remove"),
            Self::Expire => write!(f, "Expire"),
            Self::Clear => write!(f, "Clear"),
        }
    }
}

/// One observable entry change, delivered to the configured change listener.
///
/// Pattern removals and clears arrive aggregated: a single event whose `key`
/// is the pattern (`"*"` for clear) with `is_pattern` set, not one event per
/// matched key.
#[derive(Debug, Clone)]
pub struct EntryEvent {
    pub key: String,
    pub cause: EventCause,
    /// Content fingerprint of the affected entry, when known.
    pub fingerprint: Option<String>,
    pub is_pattern: bool,
}

/// User callback invoked on each observable entry change.
pub type ChangeListener = Arc<dyn Fn(&EntryEvent) + Send + Sync>;

/// Point-in-time size of the L1 store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries.
    pub count: usize,
    /// Sum of sealed payload sizes. Entries not yet sealed count zero.
    pub size_bytes: usize,
}

/// Internal mutation record flowing from the store and the seal pipeline to
/// the coordinator, which fans it out to the listener, the backplane, and
/// the remote mirror.
#[derive(Debug)]
pub(crate) enum CacheEffect {
    /// A write sealed successfully; the entry carries its envelope.
    Upsert { entry: Arc<CacheEntry> },
    Remove {
        key: String,
        fingerprint: Option<String>,
    },
    Expire {
        key: String,
        fingerprint: Option<String>,
    },
    RemovePattern { pattern: String },
    Clear,
}
