//! Cluster layer around the local frontier: routes URLs to the node owning
//! their host, batches cross-node submissions, and migrates host queues with
//! a two-phase lock/notify handoff when ring ownership changes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::dht::{DhtError, Router};
use crate::metrics::Metrics;
use crate::net::{BoxFut, Peer, RequestHandler, StreamHandler};
use crate::proto::{KeyLockNotification, UrlBatch};
use crate::url_utils;

use super::{BfFrontier, FrontierError};

pub const URL_FOUND: &str = "url.found";
pub const KEYS_LOCK: &str = "keys.lock";
pub const LOCK_NOTIFY: &str = "lock.notify";

#[derive(Debug, Clone)]
pub struct DistributedOptions {
    pub batch_period: Duration,
    pub check_keys_period: Duration,
    /// Pending URLs kept per remote; oldest are dropped beyond this.
    pub max_batch: usize,
}

impl Default for DistributedOptions {
    fn default() -> Self {
        Self {
            batch_period: Duration::from_millis(40_000),
            check_keys_period: Duration::from_millis(30_000),
            max_batch: 10_000,
        }
    }
}

pub struct DistributedFrontier {
    peer: Arc<Peer>,
    router: Arc<dyn Router>,
    frontier: Arc<BfFrontier>,
    batches: Mutex<HashMap<String, VecDeque<String>>>,
    opts: DistributedOptions,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl DistributedFrontier {
    /// Registers the dispatcher's message handlers on the peer and starts
    /// the batch-flush and reassignment loops.
    pub fn new(
        peer: Arc<Peer>,
        frontier: Arc<BfFrontier>,
        router: Arc<dyn Router>,
        opts: DistributedOptions,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        peer.add_request_handler(
            URL_FOUND,
            Arc::new(UrlFoundHandler {
                frontier: Arc::clone(&frontier),
            }),
        );
        peer.add_request_handler(
            KEYS_LOCK,
            Arc::new(KeysLockHandler {
                frontier: Arc::clone(&frontier),
            }),
        );
        peer.add_stream_handler(
            LOCK_NOTIFY,
            Arc::new(LockNotifyHandler {
                frontier: Arc::clone(&frontier),
            }),
        );

        let dispatcher = Arc::new(Self {
            peer,
            router,
            frontier,
            batches: Mutex::new(HashMap::new()),
            opts,
            metrics,
            cancel,
        });
        dispatcher.spawn_loops();
        dispatcher
    }

    pub fn local(&self) -> &Arc<BfFrontier> {
        &self.frontier
    }

    /// Routes a URL to its owning node: local enqueue when this node owns
    /// the host, otherwise batched for the remote owner. Returns whether the
    /// URL was newly accepted; a batched URL counts as accepted because its
    /// owner performs the dedup check on arrival.
    pub async fn put(&self, url: &Url) -> Result<bool, FrontierError> {
        let host = url_utils::host_key(url)
            .ok_or_else(|| FrontierError::NoHost(url.to_string()))?;
        let owner = self
            .router
            .owner_of(host.as_bytes())
            .await
            .map_err(|e| match e {
                DhtError::Net(net) => FrontierError::Transport(net.to_string()),
                other => FrontierError::Ring(other.to_string()),
            })?;

        if owner == self.peer.addr() {
            self.frontier.put(url)
        } else {
            self.enqueue_batch(&owner, url);
            Ok(true)
        }
    }

    pub async fn get(&self) -> Result<(Url, tokio::time::Instant), FrontierError> {
        self.frontier.get().await
    }

    pub fn mark_successful(&self, url: &Url, ttr: Duration) -> Result<(), FrontierError> {
        self.frontier.mark_successful(url, ttr)
    }

    pub fn mark_failed(&self, url: &Url) -> Result<(), FrontierError> {
        self.frontier.mark_failed(url)
    }

    pub fn mark_processed(&self, url: &Url) -> Result<(), FrontierError> {
        self.frontier.mark_processed(url)
    }

    /// URLs waiting for a given remote (test and metrics hook).
    pub fn pending_for(&self, addr: &str) -> usize {
        self.batches.lock().get(addr).map(|b| b.len()).unwrap_or(0)
    }

    /// Sends every pending batch. An entry is cleared only when its remote
    /// acknowledged the batch, so transport failures retain the URLs for the
    /// next flush.
    pub async fn flush_batches_once(&self) {
        let targets: Vec<String> = {
            let batches = self.batches.lock();
            batches
                .iter()
                .filter(|(_, pending)| !pending.is_empty())
                .map(|(addr, _)| addr.clone())
                .collect()
        };

        for addr in targets {
            let snapshot: Vec<String> = {
                let batches = self.batches.lock();
                match batches.get(&addr) {
                    Some(pending) => pending.iter().cloned().collect(),
                    None => continue,
                }
            };
            if snapshot.is_empty() {
                continue;
            }
            let sent = snapshot.len();
            let payload = match (UrlBatch { urls: snapshot }).to_wire() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(error = %e, "batch encode failed");
                    continue;
                }
            };

            match self.peer.request(&addr, URL_FOUND, payload).await {
                Ok(_) => {
                    let mut batches = self.batches.lock();
                    if let Some(pending) = batches.get_mut(&addr) {
                        pending.drain(..sent.min(pending.len()));
                    }
                    self.metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(node = %addr, urls = sent, "batch delivered");
                }
                Err(e) => {
                    tracing::warn!(node = %addr, error = %e, "batch send failed, retaining");
                }
            }
        }
    }

    /// Scans local host queues for hosts the ring no longer assigns here and
    /// hands them off to their new owners.
    pub async fn rebalance_once(&self) {
        let mut moved: HashMap<String, Vec<String>> = HashMap::new();
        for host in self.frontier.non_empty_hosts() {
            match self.router.owner_of(host.as_bytes()).await {
                Ok(owner) if owner != self.peer.addr() => {
                    moved.entry(owner).or_default().push(host);
                }
                Ok(_) => {}
                Err(e) => {
                    // Ring in flux; this host is reconsidered next round.
                    tracing::debug!(%host, error = %e, "owner lookup failed");
                }
            }
        }

        if !moved.is_empty() {
            tracing::info!(keys = moved.values().map(Vec::len).sum::<usize>(), "found reassigned keys");
        }

        for (addr, keys) in moved {
            self.handoff(&addr, keys).await;
        }
    }

    /// Two-phase handoff of a key group to remote `addr`: lock the keys on
    /// the remote, then stream each key's Bloom filter once its local
    /// in-flight work has drained.
    async fn handoff(&self, addr: &str, keys: Vec<String>) {
        let payload = match (UrlBatch { urls: keys.clone() }).to_wire() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "lock request encode failed");
                return;
            }
        };
        if let Err(e) = self.peer.request(addr, KEYS_LOCK, payload).await {
            tracing::warn!(node = %addr, error = %e, "keys.lock failed, retrying next round");
            return;
        }

        let stream = match self.peer.open_stream(addr, LOCK_NOTIFY).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(node = %addr, error = %e, "lock.notify stream failed");
                return;
            }
        };

        for key in &keys {
            self.frontier.wait_idle(key).await;
            let bloom = match self.frontier.bloom_encoded(key) {
                Ok(bloom) => bloom,
                Err(e) => {
                    tracing::error!(%key, error = %e, "bloom encode failed, skipping key");
                    continue;
                }
            };
            let block = match (KeyLockNotification {
                key: key.clone(),
                bloom,
            })
            .to_wire()
            {
                Ok(block) => block,
                Err(e) => {
                    tracing::error!(%key, error = %e, "notification encode failed");
                    continue;
                }
            };
            if let Err(e) = stream.send_block(&block).await {
                tracing::warn!(node = %addr, error = %e, "notify send failed");
                break;
            }
            // The remote owns the host now; stop dequeuing it here. Queued
            // URLs stay persisted until ownership maybe moves back.
            if let Err(e) = self.frontier.set_queue_lock(key, true) {
                tracing::error!(%key, error = %e, "failed to lock handed-off queue");
            }
            self.metrics.handoffs.fetch_add(1, Ordering::Relaxed);
            tracing::info!(%key, node = %addr, "host handed off");
        }
        stream.close().await;
    }

    fn enqueue_batch(&self, addr: &str, url: &Url) {
        let mut batches = self.batches.lock();
        let pending = batches.entry(addr.to_string()).or_default();
        if pending.len() >= self.opts.max_batch {
            pending.pop_front();
            tracing::warn!(node = %addr, "batch overflow, dropped oldest url");
        }
        pending.push_back(url.to_string());
    }

    fn spawn_loops(self: &Arc<Self>) {
        let flusher = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(flusher.opts.batch_period);
            tick.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = tick.tick() => flusher.flush_batches_once().await,
                    _ = flusher.cancel.cancelled() => break,
                }
            }
        });

        let rebalancer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(rebalancer.opts.check_keys_period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => rebalancer.rebalance_once().await,
                    _ = rebalancer.cancel.cancelled() => break,
                }
            }
        });
    }
}

struct UrlFoundHandler {
    frontier: Arc<BfFrontier>,
}

impl RequestHandler for UrlFoundHandler {
    fn handle(&self, from: &str, payload: Bytes) -> BoxFut<Result<Bytes, String>> {
        let frontier = Arc::clone(&self.frontier);
        let from = from.to_string();
        Box::pin(async move {
            let batch = UrlBatch::from_wire(&payload).map_err(|e| e.to_string())?;
            // Best effort: individual failures must not reject the batch.
            for raw in &batch.urls {
                match url_utils::parse_absolute(raw) {
                    Some(url) => {
                        if let Err(e) = frontier.put(&url) {
                            tracing::warn!(url = %raw, error = %e, "remote url rejected");
                        }
                    }
                    None => {
                        tracing::debug!(url = %raw, node = %from, "unparseable remote url");
                    }
                }
            }
            Ok(Bytes::new())
        })
    }
}

struct KeysLockHandler {
    frontier: Arc<BfFrontier>,
}

impl RequestHandler for KeysLockHandler {
    fn handle(&self, _from: &str, payload: Bytes) -> BoxFut<Result<Bytes, String>> {
        let frontier = Arc::clone(&self.frontier);
        Box::pin(async move {
            let keys = UrlBatch::from_wire(&payload).map_err(|e| e.to_string())?;
            for key in &keys.urls {
                tracing::info!(%key, "locking host queue");
                frontier.set_queue_lock(key, true).map_err(|e| e.to_string())?;
            }
            Ok(Bytes::new())
        })
    }
}

struct LockNotifyHandler {
    frontier: Arc<BfFrontier>,
}

impl StreamHandler for LockNotifyHandler {
    fn handle(&self, from: &str, mut blocks: mpsc::Receiver<Bytes>) -> BoxFut<()> {
        let frontier = Arc::clone(&self.frontier);
        let from = from.to_string();
        Box::pin(async move {
            while let Some(block) = blocks.recv().await {
                let notification = match KeyLockNotification::from_wire(&block) {
                    Ok(notification) => notification,
                    Err(e) => {
                        tracing::warn!(node = %from, error = %e, "malformed lock notification");
                        continue;
                    }
                };
                if let Err(e) = frontier.install_bloom(&notification.key, &notification.bloom) {
                    tracing::error!(key = %notification.key, error = %e, "bloom install failed");
                }
                if let Err(e) = frontier.set_queue_lock(&notification.key, false) {
                    tracing::error!(key = %notification.key, error = %e, "unlock failed");
                    continue;
                }
                tracing::info!(key = %notification.key, node = %from, "host adopted");
            }
        })
    }
}
