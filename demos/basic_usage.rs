// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic mesh-cache usage example.
//!
//! Demonstrates:
//! 1. Running two cache instances against one in-process remote (swap in a
//!    Redis URL for a real fleet)
//! 2. Writes, reads, and single-flight loading
//! 3. Cross-instance invalidation and pattern removal
//! 4. Displaying metrics (OTEL-compatible)
//! 5. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use mesh_cache::{CacheConfig, InMemoryRemote, MeshCache, RemoteStore};
use metrics_util::debugging::DebuggingRecorder;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for OTEL export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    // Simple logging (no filter for simplicity)
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           mesh-cache: Basic Usage Example                     ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Two instances, one shared remote
    // ─────────────────────────────────────────────────────────────────────────
    // With a real broker you'd set `config.redis_url` instead and call
    // `MeshCache::new`; everything below behaves the same.
    let remote = Arc::new(InMemoryRemote::new());

    let config = CacheConfig {
        use_remote_l2: true,
        flush_interval_ms: 10,
        ..CacheConfig::new("demo")
    };

    let shared_a: Arc<dyn RemoteStore> = remote.clone();
    let shared_b: Arc<dyn RemoteStore> = remote.clone();
    let mut node_a = MeshCache::with_remote(config.clone(), shared_a)?;
    let mut node_b = MeshCache::with_remote(config, shared_b)?;
    node_a.start().await?;
    node_b.start().await?;

    println!("🚀 Two cache instances started (prefix: demo)\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Writes and reads
    // ─────────────────────────────────────────────────────────────────────────
    for i in 1..=5 {
        node_a
            .set(
                &format!("patient.{i}"),
                &json!({"name": format!("Patient {i}"), "ward": i % 2}),
                Some(Duration::from_secs(300)),
            )
            .await?;
    }
    node_a.flush_pending_writes().await;
    println!("📝 node_a wrote 5 entries, stats: {:?}", node_a.stats());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Single-flight loading
    // ─────────────────────────────────────────────────────────────────────────
    let loaded: serde_json::Value = node_a
        .get_or_set(
            "patient.6",
            |key| async move {
                println!("   (factory ran exactly once for {key})");
                Ok(json!({"name": "Patient 6", "ward": 0}))
            },
            None,
            Duration::from_secs(10),
        )
        .await?;
    println!("🔒 get_or_set produced: {loaded}");

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Second-level read-through on the peer
    // ─────────────────────────────────────────────────────────────────────────
    tokio::time::sleep(Duration::from_millis(100)).await;
    let from_l2: Option<serde_json::Value> = node_b.get("patient.3").await;
    println!("🌐 node_b read patient.3 through the second level: {from_l2:?}");

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Cross-instance pattern invalidation
    // ─────────────────────────────────────────────────────────────────────────
    node_b.remove_by_pattern("patient.*").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!(
        "🧹 node_b removed patient.*, node_a now holds {} entries",
        node_a.len()
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics snapshot
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📊 Metrics:");
    let snapshot = snapshotter.snapshot();
    for (key, _, _, value) in snapshot.into_vec() {
        println!("   {} = {:?}", key.key().name(), value);
    }

    node_a.shutdown().await;
    node_b.shutdown().await;
    println!("\n✅ Shut down cleanly");
    Ok(())
}
