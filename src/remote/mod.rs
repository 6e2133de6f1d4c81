// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote store backends.
//!
//! The cache consumes exactly five key/value primitives (GET, MGET,
//! SET-with-TTL, DEL, DEL-by-pattern) plus publish/subscribe, captured by
//! [`RemoteStore`]. [`RedisRemote`] is the production backend;
//! [`InMemoryRemote`] implements the same contract in-process so tests and
//! single-process setups can run the full coherence machinery without a
//! server.

pub mod memory;
pub mod redis;
pub mod traits;

pub use memory::InMemoryRemote;
pub use redis::RedisRemote;
pub use traits::{RemoteError, RemoteStore};
