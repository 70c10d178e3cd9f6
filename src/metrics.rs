//! Process-local crawl counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct Metrics {
    /// Pages workers finished with, regardless of outcome.
    pub processed_total: AtomicU64,
    /// Pages that came back 200 OK.
    pub processed_ok: AtomicU64,
    /// URLs newly enqueued into the frontier.
    pub urls_put: AtomicU64,
    /// Puts rejected by a host's Bloom filter.
    pub dedup_dropped: AtomicU64,
    /// Fetches that ended in a retryable failure.
    pub fetch_failures: AtomicU64,
    /// URLs skipped by robots.txt or the scope filter.
    pub filtered: AtomicU64,
    /// Cross-node URL batches acknowledged by their owner.
    pub batches_flushed: AtomicU64,
    /// Host queues handed off to a new ring owner.
    pub handoffs: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed_total: self.processed_total.load(Ordering::Relaxed),
            processed_ok: self.processed_ok.load(Ordering::Relaxed),
            urls_put: self.urls_put.load(Ordering::Relaxed),
            dedup_dropped: self.dedup_dropped.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
        }
    }

    /// Logs a progress line periodically until cancelled.
    pub fn spawn_reporter(self: &Arc<Self>, period: Duration, cancel: CancellationToken) {
        let metrics = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let snapshot = metrics.snapshot();
                        tracing::info!(
                            processed = snapshot.processed_total,
                            ok = snapshot.processed_ok,
                            put = snapshot.urls_put,
                            dedup_dropped = snapshot.dedup_dropped,
                            failures = snapshot.fetch_failures,
                            filtered = snapshot.filtered,
                            batches = snapshot.batches_flushed,
                            handoffs = snapshot.handoffs,
                            "crawl progress"
                        );
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub processed_total: u64,
    pub processed_ok: u64,
    pub urls_put: u64,
    pub dedup_dropped: u64,
    pub fetch_failures: u64,
    pub filtered: u64,
    pub batches_flushed: u64,
    pub handoffs: u64,
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} processed ({} ok), {} put, {} dedup-dropped, {} failures, {} filtered, {} batches, {} handoffs",
            self.processed_total,
            self.processed_ok,
            self.urls_put,
            self.dedup_dropped,
            self.fetch_failures,
            self.filtered,
            self.batches_flushed,
            self.handoffs
        )
    }
}
