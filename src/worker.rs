//! Worker pool: pulls URLs from the frontier, applies the scope, robots and
//! size filters, honors the politeness deadline, fetches, and reports the
//! outcome back.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::fetcher::Fetcher;
use crate::frontier::{AnyFrontier, FrontierError};
use crate::metrics::Metrics;
use crate::parser;
use crate::robots::RobotsCache;
use crate::url_utils;

/// Cap on a single politeness sleep so active-set changes become visible
/// even when a host's next-access time is far out.
const MAX_WAIT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Regex a URL must match to be fetched; `None` admits everything.
    pub scope: Option<Regex>,
    pub max_page_size: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 512,
            scope: None,
            max_page_size: 100 * 1024 * 1024,
        }
    }
}

/// Spawns the worker tasks. They run until the token cancels.
pub fn spawn_workers<F>(
    config: WorkerConfig,
    frontier: Arc<AnyFrontier>,
    fetcher: Arc<F>,
    robots: Arc<RobotsCache>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    F: Fetcher + 'static,
{
    (0..config.workers.max(1))
        .map(|_| {
            let config = config.clone();
            let frontier = Arc::clone(&frontier);
            let fetcher = Arc::clone(&fetcher);
            let robots = Arc::clone(&robots);
            let metrics = Arc::clone(&metrics);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_worker(config, frontier, fetcher, robots, metrics, cancel).await;
            })
        })
        .collect()
}

async fn run_worker<F: Fetcher>(
    config: WorkerConfig,
    frontier: Arc<AnyFrontier>,
    fetcher: Arc<F>,
    robots: Arc<RobotsCache>,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) {
    loop {
        let (url, not_before) = match frontier.get().await {
            Ok(next) => next,
            Err(FrontierError::Cancelled) => return,
            Err(e) => {
                tracing::warn!(error = %e, "frontier get failed");
                continue;
            }
        };

        if let Err(e) = process_one(
            &config, &frontier, &fetcher, &robots, &metrics, &cancel, url, not_before,
        )
        .await
        {
            tracing::warn!(error = %e, "worker bookkeeping failed");
        }

        if cancel.is_cancelled() {
            return;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_one<F: Fetcher>(
    config: &WorkerConfig,
    frontier: &AnyFrontier,
    fetcher: &F,
    robots: &RobotsCache,
    metrics: &Metrics,
    cancel: &CancellationToken,
    url: Url,
    not_before: Instant,
) -> Result<(), FrontierError> {
    if let Some(scope) = &config.scope {
        if !scope.is_match(url.as_str()) {
            metrics.filtered.fetch_add(1, Ordering::Relaxed);
            return frontier.mark_processed(&url);
        }
    }

    match robots.allowed(fetcher, &url).await {
        Ok(true) => {}
        Ok(false) => {
            metrics.filtered.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%url, "crawl forbidden by robots.txt");
            return frontier.mark_processed(&url);
        }
        Err(e) => {
            // No rules means no permission.
            metrics.filtered.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%url, error = %e, "robots fetch failed");
            return frontier.mark_processed(&url);
        }
    }

    match fetcher.head(&url).await {
        Ok(head) => {
            if head.content_length.unwrap_or(0) > config.max_page_size {
                metrics.filtered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(%url, "page exceeds size cap");
                return frontier.mark_processed(&url);
            }
        }
        Err(e) => {
            metrics.fetch_failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%url, error = %e, "head request failed");
            return frontier.mark_failed(&url);
        }
    }

    // Respect the frontier's politeness deadline, capped so this worker
    // re-enters circulation on long delays.
    let wait = not_before
        .saturating_duration_since(Instant::now())
        .min(MAX_WAIT);
    if !wait.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return frontier.mark_processed(&url),
        }
    }

    match fetcher.fetch(&url).await {
        Ok(details) => {
            metrics.processed_total.fetch_add(1, Ordering::Relaxed);
            if details.status == 200 {
                metrics.processed_ok.fetch_add(1, Ordering::Relaxed);
            }

            if is_html(details.content_type.as_deref()) {
                let html = String::from_utf8_lossy(&details.body);
                for link in parser::discovered_urls(&url, &html) {
                    if url_utils::host_key(&link).is_none() {
                        continue;
                    }
                    match frontier.put(&link).await {
                        Ok(true) => {
                            metrics.urls_put.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {
                            metrics.dedup_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            tracing::debug!(url = %link, error = %e, "put failed");
                        }
                    }
                }
            }
            frontier.mark_successful(&url, details.ttr)
        }
        Err(e) => {
            metrics.fetch_failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%url, error = %e, "fetch failed");
            frontier.mark_failed(&url)
        }
    }
}

fn is_html(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/html") || ct.starts_with("application/xhtml+xml")
        }
        // Assume HTML when the server does not say otherwise.
        None => true,
    }
}
