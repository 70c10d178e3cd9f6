//! Per-host URL scheduler with politeness delays, a bounded active set and
//! session budgets.
//!
//! Hosts eligible to yield URLs live in a min-heap ordered by their next
//! allowed access time. The heap never holds more than `max_active_queues`
//! hosts; the rest wait in an inactive index and are promoted as slots free
//! up. Dedup happens against the per-host Bloom store before anything is
//! enqueued.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::bloom::BloomStore;
use crate::storage::queue::QueueStore;
use crate::storage::KvError;
use crate::url_utils;

pub mod distributed;
pub mod host_queue;

pub use distributed::DistributedFrontier;
pub use host_queue::{HostQueue, UrlEntry};

/// Floor for the delay between two fetches of the same host.
const MIN_DELAY_MS: u64 = 100;
/// Ceiling for the same delay.
const MAX_DELAY_MS: u64 = 30_000;
/// Consecutive failures after which a URL is dropped.
const MAX_URL_FAILURES: u32 = 3;
/// Upper bound on how long `get` sleeps before re-checking the heap.
const IDLE_POLL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum FrontierError {
    #[error("url has no absolute host: {0}")]
    NoHost(String),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("ring lookup failed: {0}")]
    Ring(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("shutting down")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PolitenessConfig {
    pub max_active_queues: usize,
    pub multiplier: u64,
    pub session_budget: u64,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            max_active_queues: 256,
            multiplier: 10,
            session_budget: 50,
        }
    }
}

/// `max(100 ms, min(30 s, multiplier x last RTT))`.
pub(crate) fn politeness_delay(multiplier: u64, rtt_ms: u64) -> Duration {
    Duration::from_millis(multiplier.saturating_mul(rtt_ms).clamp(MIN_DELAY_MS, MAX_DELAY_MS))
}

struct SchedState {
    queues: HashMap<String, HostQueue>,
    /// `(next_access_at, host)`; ties resolve to the smaller host key.
    heap: BinaryHeap<Reverse<(Instant, String)>>,
    /// Hosts logically in the active set (heap entries may lag behind).
    active: usize,
    inactive_index: VecDeque<String>,
    inflight: HashMap<String, usize>,
    idle_waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

pub struct BfFrontier {
    store: QueueStore,
    bloom: BloomStore,
    state: Mutex<SchedState>,
    wake: Notify,
    cancel: CancellationToken,
    cfg: PolitenessConfig,
    failures: DashMap<String, u32>,
}

impl BfFrontier {
    pub fn new(
        store: QueueStore,
        bloom: BloomStore,
        cfg: PolitenessConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            bloom,
            state: Mutex::new(SchedState {
                queues: HashMap::new(),
                heap: BinaryHeap::new(),
                active: 0,
                inactive_index: VecDeque::new(),
                inflight: HashMap::new(),
                idle_waiters: HashMap::new(),
            }),
            wake: Notify::new(),
            cancel,
            cfg,
            failures: DashMap::new(),
        }
    }

    /// Rebuilds host queues from persisted state after a restart. Active-set
    /// membership is transient, so every non-empty queue is re-admitted from
    /// scratch. Returns the number of restored queues.
    pub fn load_queues(&self) -> Result<usize, FrontierError> {
        let hosts = self.store.all_hosts()?;
        let mut restored = 0;
        let mut state = self.state.lock();
        for host in hosts {
            if state.queues.contains_key(&host) {
                continue;
            }
            let queue = self.store.queue(&host)?;
            if queue.is_empty() {
                continue;
            }
            state.queues.insert(
                host.clone(),
                HostQueue::new(queue, false, self.cfg.session_budget),
            );
            self.try_admit(&mut state, &host);
            restored += 1;
        }
        drop(state);
        if restored > 0 {
            self.wake.notify_waiters();
        }
        Ok(restored)
    }

    /// Admits a URL to its host queue unless the Bloom store has seen it.
    /// Returns whether the URL was newly enqueued; `false` means the Bloom
    /// filter dropped it as a duplicate.
    pub fn put(&self, url: &Url) -> Result<bool, FrontierError> {
        let host = url_utils::host_key(url)
            .ok_or_else(|| FrontierError::NoHost(url.to_string()))?;
        if self.bloom.seen_or_insert(&host, url.as_str())? {
            return Ok(false);
        }
        self.enqueue_unchecked(&host, UrlEntry::new(url.to_string()))?;
        Ok(true)
    }

    /// Blocks until a host is due, then returns one URL and the time before
    /// which it must not be fetched.
    pub async fn get(&self) -> Result<(Url, Instant), FrontierError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(FrontierError::Cancelled);
            }

            let notified = self.wake.notified();
            tokio::pin!(notified);

            let wait;
            {
                let mut state = self.state.lock();
                let now = Instant::now();
                let next_due = state.heap.peek().map(|entry| entry.0 .0);
                match next_due {
                    Some(at) if at <= now => {
                        if let Some(Reverse((_, host))) = state.heap.pop() {
                            if let Some(found) = self.dequeue_from(&mut state, &host, now)? {
                                return Ok(found);
                            }
                        }
                        continue;
                    }
                    Some(at) => wait = (at - now).min(IDLE_POLL),
                    None => wait = IDLE_POLL,
                }
                // Enable the waiter while still holding the lock so a
                // concurrent put cannot slip between check and sleep.
                notified.as_mut().enable();
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => return Err(FrontierError::Cancelled),
            }
        }
    }

    /// Records the observed round-trip time and settles in-flight accounting.
    pub fn mark_successful(&self, url: &Url, ttr: Duration) -> Result<(), FrontierError> {
        let host = url_utils::host_key(url)
            .ok_or_else(|| FrontierError::NoHost(url.to_string()))?;
        self.store
            .set_last_rtt_ms(&host, ttr.as_millis().min(u128::from(u64::MAX)) as u64)?;
        self.failures.remove(url.as_str());
        self.finish_inflight(&host);
        Ok(())
    }

    /// Re-enqueues the URL at the tail, dropping it after the third
    /// consecutive failure.
    pub fn mark_failed(&self, url: &Url) -> Result<(), FrontierError> {
        let host = url_utils::host_key(url)
            .ok_or_else(|| FrontierError::NoHost(url.to_string()))?;

        let strikes = {
            let mut entry = self.failures.entry(url.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if strikes >= MAX_URL_FAILURES {
            self.failures.remove(url.as_str());
            tracing::warn!(%url, strikes, "dropping url after repeated failures");
        } else {
            // The Bloom filter already contains this URL; bypass it.
            self.enqueue_unchecked(&host, UrlEntry::new(url.to_string()))?;
        }
        self.finish_inflight(&host);
        Ok(())
    }

    /// Settles in-flight accounting without touching the RTT.
    pub fn mark_processed(&self, url: &Url) -> Result<(), FrontierError> {
        let host = url_utils::host_key(url)
            .ok_or_else(|| FrontierError::NoHost(url.to_string()))?;
        self.failures.remove(url.as_str());
        self.finish_inflight(&host);
        Ok(())
    }

    /// Locks or unlocks a host queue, creating the queue record if the host
    /// has never been seen here. Unlocking re-admits eligible queues.
    pub fn set_queue_lock(&self, host: &str, locked: bool) -> Result<(), FrontierError> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(host) {
            let queue = self.store.queue(host)?;
            state.queues.insert(
                host.to_string(),
                HostQueue::new(queue, false, self.cfg.session_budget),
            );
        }
        if let Some(queue) = state.queues.get_mut(host) {
            queue.set_locked(locked);
        }
        if !locked {
            self.try_admit(&mut state, host);
            drop(state);
            self.wake.notify_waiters();
        }
        Ok(())
    }

    /// Hosts whose queues currently hold URLs.
    pub fn non_empty_hosts(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(host, _)| host.clone())
            .collect()
    }

    /// Resolves once the host has no outstanding fetches.
    pub async fn wait_idle(&self, host: &str) {
        let pending = {
            let mut state = self.state.lock();
            if state.inflight.get(host).copied().unwrap_or(0) == 0 {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state
                    .idle_waiters
                    .entry(host.to_string())
                    .or_default()
                    .push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = pending {
            let _ = rx.await;
        }
    }

    pub fn inflight_count(&self, host: &str) -> usize {
        self.state.lock().inflight.get(host).copied().unwrap_or(0)
    }

    pub fn bloom_encoded(&self, host: &str) -> Result<Vec<u8>, FrontierError> {
        Ok(self.bloom.encoded(host)?)
    }

    pub fn install_bloom(&self, host: &str, encoded: &[u8]) -> Result<(), FrontierError> {
        Ok(self.bloom.install(host, encoded)?)
    }

    /// Flushes cached Bloom filters to the KV (shutdown path).
    pub fn flush(&self) {
        self.bloom.flush();
    }

    fn enqueue_unchecked(&self, host: &str, entry: UrlEntry) -> Result<(), FrontierError> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(host) {
            let queue = self.store.queue(host)?;
            state.queues.insert(
                host.to_string(),
                HostQueue::new(queue, false, self.cfg.session_budget),
            );
        }
        let Some(queue) = state.queues.get_mut(host) else {
            return Err(FrontierError::Kv(KvError::Serialization(
                "host queue vanished during enqueue".into(),
            )));
        };
        queue.enqueue(&entry)?;
        self.try_admit(&mut state, host);
        drop(state);
        self.wake.notify_waiters();
        Ok(())
    }

    /// Moves a host into the active set if there is room, otherwise parks it
    /// in the inactive index.
    fn try_admit(&self, state: &mut SchedState, host: &str) {
        let admit_to_heap = state.active < self.cfg.max_active_queues;
        let Some(queue) = state.queues.get_mut(host) else {
            return;
        };
        if queue.is_locked() || queue.is_empty() || queue.is_active() || queue.in_inactive_index {
            return;
        }
        if admit_to_heap {
            queue.reset(self.cfg.session_budget);
            state.active += 1;
            state.heap.push(Reverse((Instant::now(), host.to_string())));
        } else {
            queue.in_inactive_index = true;
            state.inactive_index.push_back(host.to_string());
        }
    }

    /// Fills a freed active-set slot from the inactive index.
    fn promote_one(&self, state: &mut SchedState) {
        while let Some(host) = state.inactive_index.pop_front() {
            let Some(queue) = state.queues.get_mut(&host) else {
                continue;
            };
            queue.in_inactive_index = false;
            if queue.is_locked() || queue.is_empty() || queue.is_active() {
                continue;
            }
            queue.reset(self.cfg.session_budget);
            state.active += 1;
            state.heap.push(Reverse((Instant::now(), host)));
            return;
        }
    }

    /// One dequeue attempt against a host just popped from the heap.
    fn dequeue_from(
        &self,
        state: &mut SchedState,
        host: &str,
        now: Instant,
    ) -> Result<Option<(Url, Instant)>, FrontierError> {
        let entry = match state.queues.get_mut(host) {
            Some(queue) if queue.is_active() && !queue.is_locked() => queue.dequeue()?,
            _ => None,
        };

        let Some(entry) = entry else {
            // Queue vanished, got locked, or deactivated itself on dequeue.
            self.retire(state, host);
            return Ok(None);
        };

        let rtt = self.store.last_rtt_ms(host)?.unwrap_or(0);
        let next_access = now + politeness_delay(self.cfg.multiplier, rtt);

        let still_eligible = state
            .queues
            .get(host)
            .map(|q| q.is_active() && !q.is_locked() && !q.is_empty())
            .unwrap_or(false);
        if still_eligible {
            state.heap.push(Reverse((next_access, host.to_string())));
        } else {
            self.retire(state, host);
        }

        let url = match Url::parse(&entry.url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(url = %entry.url, error = %e, "dropping unparseable queued url");
                return Ok(None);
            }
        };
        *state.inflight.entry(host.to_string()).or_insert(0) += 1;
        Ok(Some((url, next_access)))
    }

    /// Removes a host from the active set, parking it in the inactive index
    /// when it still has eligible work, and promotes a replacement.
    fn retire(&self, state: &mut SchedState, host: &str) {
        state.active = state.active.saturating_sub(1);
        if let Some(queue) = state.queues.get_mut(host) {
            queue.deactivate();
            if !queue.is_locked() && !queue.is_empty() && !queue.in_inactive_index {
                queue.in_inactive_index = true;
                state.inactive_index.push_back(host.to_string());
            }
        }
        self.promote_one(state);
    }

    fn finish_inflight(&self, host: &str) {
        let mut state = self.state.lock();
        let idle = match state.inflight.get_mut(host) {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => true,
        };
        if idle {
            state.inflight.remove(host);
            if let Some(waiters) = state.idle_waiters.remove(host) {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
        }
    }
}

/// The frontier surface workers consume. Single-node deployments talk to the
/// local scheduler directly; clustered ones route through the dispatcher.
/// `get` and the marks always act locally either way.
pub enum AnyFrontier {
    Local(Arc<BfFrontier>),
    Distributed(Arc<DistributedFrontier>),
}

impl AnyFrontier {
    /// Submits a URL; `Ok(false)` means dedup dropped it locally.
    pub async fn put(&self, url: &Url) -> Result<bool, FrontierError> {
        match self {
            AnyFrontier::Local(frontier) => frontier.put(url),
            AnyFrontier::Distributed(dispatcher) => dispatcher.put(url).await,
        }
    }

    pub async fn get(&self) -> Result<(Url, Instant), FrontierError> {
        self.local().get().await
    }

    pub fn mark_successful(&self, url: &Url, ttr: Duration) -> Result<(), FrontierError> {
        self.local().mark_successful(url, ttr)
    }

    pub fn mark_failed(&self, url: &Url) -> Result<(), FrontierError> {
        self.local().mark_failed(url)
    }

    pub fn mark_processed(&self, url: &Url) -> Result<(), FrontierError> {
        self.local().mark_processed(url)
    }

    pub fn local(&self) -> &Arc<BfFrontier> {
        match self {
            AnyFrontier::Local(frontier) => frontier,
            AnyFrontier::Distributed(dispatcher) => dispatcher.local(),
        }
    }
}
