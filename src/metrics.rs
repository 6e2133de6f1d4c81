// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` crate for backend-agnostic collection; the embedding
//! application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `mesh_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: L1, L2
//! - `operation`: get, set, remove, pattern, clear, sweep, seal
//! - `status`: hit, miss, success, error, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a read hit on a tier.
pub fn record_hit(tier: &'static str) {
    counter!("mesh_cache_reads_total", "tier" => tier, "status" => "hit").increment(1);
}

/// Record a read that missed every tier.
pub fn record_miss() {
    counter!("mesh_cache_reads_total", "tier" => "none", "status" => "miss").increment(1);
}

/// Record a cache operation outcome.
pub fn record_operation(operation: &'static str, status: &'static str) {
    counter!(
        "mesh_cache_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

/// Record operation latency.
pub fn record_latency(operation: &'static str, duration: Duration) {
    histogram!("mesh_cache_operation_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record one sealed entry and its canonical payload size.
pub fn record_seal(size_bytes: usize, compressed: bool) {
    counter!("mesh_cache_seals_total").increment(1);
    histogram!("mesh_cache_sealed_bytes").record(size_bytes as f64);
    if compressed {
        counter!("mesh_cache_sealed_compressed_total").increment(1);
    }
}

/// Record a backplane message by direction and outcome.
pub fn record_backplane(direction: &'static str, outcome: &'static str) {
    counter!(
        "mesh_cache_backplane_messages_total",
        "direction" => direction,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record entries reclaimed by an expiration sweep.
pub fn record_swept(count: usize) {
    counter!("mesh_cache_swept_entries_total").increment(count as u64);
}

/// Set current L1 entry count.
pub fn set_l1_entries(count: usize) {
    gauge!("mesh_cache_l1_entries").set(count as f64);
}

/// Set current L1 sealed bytes.
pub fn set_l1_bytes(bytes: usize) {
    gauge!("mesh_cache_l1_bytes").set(bytes as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
