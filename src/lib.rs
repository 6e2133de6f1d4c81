// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # mesh-cache
//!
//! A process-local in-memory cache kept coherent across a fleet of processes
//! via a publish/subscribe backplane, with an optional shared remote store as
//! a second-level tier.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MeshCache                             │
//! │  • Typed get / set / remove / pattern remove                │
//! │  • Single-flight get_or_set via per-key locks               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  L1: In-Memory Store                        │
//! │  • DashMap keyed by string, TTL per entry                   │
//! │  • LRU (deadline slides on read) or FIFO policy             │
//! │  • Periodic expiration sweep                                │
//! └─────────────────────────────────────────────────────────────┘
//!          │                                        │
//!   (Seal pipeline: batch                   (Invalidation bus)
//!    serialize + fingerprint)                       │
//!          ▼                                        ▼
//! ┌──────────────────────────┐   ┌─────────────────────────────┐
//! │  L2: Remote KV (Redis)   │   │  Backplane (Redis pub/sub)  │
//! │  • Envelope per entry    │   │  • Invalidation messages    │
//! │  • TTL mirrors L1        │   │  • Loopback suppression     │
//! │  • Read-through on miss  │   │  • Fingerprint guard        │
//! └──────────────────────────┘   └─────────────────────────────┘
//! ```
//!
//! Every write lands in L1 immediately. The seal pipeline then serializes the
//! payload off the write path, computes a content fingerprint, and (when the
//! second level is enabled) mirrors the sealed envelope to the remote store.
//! Peers subscribed to the same channel drop their stale copies; a peer whose
//! copy already carries the same fingerprint keeps it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mesh_cache::{MeshCache, CacheConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mesh_cache::CacheError> {
//!     let mut config = CacheConfig::new("orders");
//!     config.redis_url = Some("redis://localhost:6379".into());
//!     config.use_remote_l2 = true;
//!
//!     let mut cache = MeshCache::new(config)?;
//!     cache.start().await?;
//!
//!     cache.set("order.1001", &serde_json::json!({"total": 42}), None).await?;
//!
//!     let hit: Option<serde_json::Value> = cache.get("order.1001").await;
//!     assert!(hit.is_some());
//!
//!     let value: String = cache
//!         .get_or_set(
//!             "order.1002",
//!             |_key| async { Ok("built once".to_string()) },
//!             Some(Duration::from_secs(60)),
//!             Duration::from_secs(10),
//!         )
//!         .await?;
//!     assert_eq!(value, "built once");
//!
//!     cache.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Consistency model
//!
//! Eventually consistent. After a mutation, every live subscriber either
//! drops or re-acquires its local copy once the invalidation message is
//! delivered. The backplane is never a data plane: only keys, patterns and
//! fingerprints travel on it. The remote second level only makes warm
//! restarts and cold L1s cheap; coherence comes from the backplane alone.
//!
//! ## Modules
//!
//! - [`cache`]: the [`MeshCache`] coordinator and its loader paths
//! - [`store`]: the L1 concurrent store with TTL and eviction policies
//! - [`entry`]: cache entries, seals, and the remote envelope format
//! - [`pipeline`]: the batched serialize-and-fingerprint worker
//! - [`locks`]: the per-key lock table backing single-flight loads
//! - [`backplane`]: invalidation message schema and inbound apply rules
//! - [`remote`]: the remote store trait, Redis backend, in-memory backend

pub mod backplane;
pub mod cache;
pub mod compression;
pub mod config;
pub mod entry;
pub mod errors;
pub mod locks;
pub mod metrics;
pub mod pattern;
pub mod pipeline;
pub mod remote;
pub mod retry;
pub mod store;

pub use backplane::InvalidationMessage;
pub use cache::{CacheStats, ChangeListener, EntryEvent, EventCause, MeshCache, DEFAULT_FACTORY_WAIT};
pub use config::{CacheConfig, EvictionPolicy, NotificationMode};
pub use entry::{CacheEntry, Envelope};
pub use errors::{BoxError, CacheError};
pub use remote::{InMemoryRemote, RedisRemote, RemoteError, RemoteStore};
