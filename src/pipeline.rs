// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The background serialize-and-fingerprint worker.
//!
//! Writes enqueue their entry here and return; the worker batches entries
//! for up to `flush_interval_ms` or until the batch reaches
//! `flush_batch_size`, whichever comes first, then seals the whole batch in
//! parallel and reports each success to the coordinator. Ordering between
//! batches is not guaranteed, and an entry is visible in L1 before its
//! fingerprint exists; readers tolerate that window.
//!
//! Seal failures are logged and swallowed: the entry keeps serving from L1,
//! it just has no remote mirror and no fingerprint guard until the next
//! successful write of that key.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::entry::CacheEntry;

/// Why a batch left the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Time threshold reached
    Time,
    /// Entry count threshold reached
    Count,
    /// Explicit flush or shutdown
    Manual,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Flush after this many milliseconds, even if the batch is small.
    pub flush_interval_ms: u64,
    /// Flush once the batch holds this many entries.
    pub flush_batch_size: usize,
    /// Compression threshold handed to each seal.
    pub compression_threshold: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 35,
            flush_batch_size: 100,
            compression_threshold: 4 * 1024,
        }
    }
}

enum Job {
    Seal(Arc<CacheEntry>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the pipeline worker task.
pub struct SealPipeline {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl SealPipeline {
    /// Spawn the worker. `on_sealed` runs once per successfully sealed
    /// entry, on the worker task; it must not block.
    pub fn spawn<F>(config: PipelineConfig, on_sealed: F) -> Self
    where
        F: Fn(Arc<CacheEntry>) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(config, rx, Arc::new(on_sealed)));
        Self { tx, worker }
    }

    /// Queue an entry for sealing. Never blocks the caller.
    pub fn enqueue(&self, entry: Arc<CacheEntry>) {
        let _ = self.tx.send(Job::Seal(entry));
    }

    /// Seal everything currently buffered and wait for it to complete.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Job::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Flush, then stop the worker.
    pub async fn shutdown(self) {
        self.flush().await;
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn run_worker(
    config: PipelineConfig,
    mut rx: mpsc::UnboundedReceiver<Job>,
    on_sealed: Arc<dyn Fn(Arc<CacheEntry>) + Send + Sync>,
) {
    let mut batch: Vec<Arc<CacheEntry>> = Vec::with_capacity(config.flush_batch_size);
    let mut tick = tokio::time::interval(Duration::from_millis(config.flush_interval_ms.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(Job::Seal(entry)) => {
                    batch.push(entry);
                    if batch.len() >= config.flush_batch_size {
                        seal_batch(&mut batch, &config, &on_sealed, FlushReason::Count).await;
                    }
                }
                Some(Job::Flush(ack)) => {
                    seal_batch(&mut batch, &config, &on_sealed, FlushReason::Manual).await;
                    let _ = ack.send(());
                }
                None => {
                    seal_batch(&mut batch, &config, &on_sealed, FlushReason::Manual).await;
                    break;
                }
            },
            _ = tick.tick() => {
                if !batch.is_empty() {
                    seal_batch(&mut batch, &config, &on_sealed, FlushReason::Time).await;
                }
            }
        }
    }
}

/// Seal a batch in parallel; completion order within the batch is arbitrary.
async fn seal_batch(
    batch: &mut Vec<Arc<CacheEntry>>,
    config: &PipelineConfig,
    on_sealed: &Arc<dyn Fn(Arc<CacheEntry>) + Send + Sync>,
    reason: FlushReason,
) {
    if batch.is_empty() {
        return;
    }
    let entries = std::mem::take(batch);
    debug!(count = entries.len(), ?reason, "sealing batch");

    let mut tasks = JoinSet::new();
    for entry in entries {
        let threshold = config.compression_threshold;
        let on_sealed = on_sealed.clone();
        tasks.spawn(async move {
            let failure = entry.seal(threshold).err();
            match failure {
                None => on_sealed(entry),
                Some(e) => {
                    warn!(key = %entry.key(), error = %e, "seal failed; entry stays live without a fingerprint");
                }
            }
        });
    }
    while tasks.join_next().await.is_some() {}
}
