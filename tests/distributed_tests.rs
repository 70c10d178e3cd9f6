//! Cluster behavior over real TCP on loopback: routing through a live ring,
//! batch delivery, and the two-phase lock/handoff protocol.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use orbweaver::bloom::BloomStore;
use orbweaver::dht::{BoxFut, Dht, DhtConfig, DhtError, Router};
use orbweaver::frontier::distributed::{DistributedFrontier, DistributedOptions};
use orbweaver::frontier::{BfFrontier, PolitenessConfig};
use orbweaver::metrics::Metrics;
use orbweaver::net::Peer;
use orbweaver::storage::queue::QueueStore;
use orbweaver::storage::MemoryKv;

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn frontier(cancel: &CancellationToken) -> Arc<BfFrontier> {
    Arc::new(BfFrontier::new(
        QueueStore::new(MemoryKv::shared()),
        BloomStore::new(MemoryKv::shared()),
        PolitenessConfig {
            multiplier: 0,
            ..Default::default()
        },
        cancel.clone(),
    ))
}

/// Loop/flush periods long enough that tests drive every round by hand.
fn manual_options() -> DistributedOptions {
    DistributedOptions {
        batch_period: Duration::from_secs(600),
        check_keys_period: Duration::from_secs(600),
        max_batch: 10_000,
    }
}

fn manual_ring() -> DhtConfig {
    DhtConfig {
        stabilize_interval: Duration::from_secs(60),
        fix_fingers_interval: Duration::from_secs(60),
        check_predecessor_interval: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Router whose assignment can be flipped mid-test to simulate a ring
/// membership change.
struct SwitchRouter {
    owner: Mutex<String>,
}

impl SwitchRouter {
    fn new(owner: &str) -> Arc<Self> {
        Arc::new(Self {
            owner: Mutex::new(owner.to_string()),
        })
    }

    fn set_owner(&self, owner: &str) {
        *self.owner.lock() = owner.to_string();
    }
}

impl Router for SwitchRouter {
    fn owner_of<'a>(&'a self, _key: &'a [u8]) -> BoxFut<'a, Result<String, DhtError>> {
        Box::pin(async move { Ok(self.owner.lock().clone()) })
    }
}

async fn drain(frontier: &Arc<BfFrontier>) -> HashSet<String> {
    let mut seen = HashSet::new();
    while let Ok(Ok((got, _))) =
        tokio::time::timeout(Duration::from_millis(500), frontier.get()).await
    {
        seen.insert(got.to_string());
        frontier.mark_processed(&got).unwrap();
    }
    seen
}

#[tokio::test]
async fn test_two_node_routing_delivers_urls_to_owners() {
    let cancel = CancellationToken::new();
    let peer_x = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();
    let peer_y = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();

    let dht_x = Dht::new(Arc::clone(&peer_x), manual_ring(), cancel.clone());
    let dht_y = Dht::new(Arc::clone(&peer_y), manual_ring(), cancel.clone());

    dht_y.join(peer_x.addr()).await.unwrap();
    for _ in 0..8 {
        dht_x.stabilize_all().await;
        dht_y.stabilize_all().await;
    }

    let frontier_x = frontier(&cancel);
    let frontier_y = frontier(&cancel);
    let metrics_x = Metrics::new();
    let router_x: Arc<dyn Router> = dht_x.clone();
    let dispatcher_x = DistributedFrontier::new(
        Arc::clone(&peer_x),
        Arc::clone(&frontier_x),
        router_x,
        manual_options(),
        Arc::clone(&metrics_x),
        cancel.clone(),
    );
    let router_y: Arc<dyn Router> = dht_y.clone();
    let _dispatcher_y = DistributedFrontier::new(
        Arc::clone(&peer_y),
        Arc::clone(&frontier_y),
        router_y,
        manual_options(),
        Metrics::new(),
        cancel.clone(),
    );

    // Submit everything on X; the ring decides who schedules what.
    let mut expect_x = HashSet::new();
    let mut expect_y = HashSet::new();
    for i in 0..16 {
        let host = format!("host{}.test", i);
        let submitted = format!("http://{}/p", host);
        let owner = dht_x.owner_of(host.as_bytes()).await.unwrap();
        if owner == peer_x.addr() {
            expect_x.insert(submitted.clone());
        } else {
            assert_eq!(owner, peer_y.addr());
            expect_y.insert(submitted.clone());
        }
        dispatcher_x.put(&url(&submitted)).await.unwrap();
    }
    assert!(
        !expect_y.is_empty(),
        "sixteen hosts across eight vnodes should not all land on one node"
    );

    dispatcher_x.flush_batches_once().await;
    assert_eq!(metrics_x.batches_flushed.load(Ordering::Relaxed), 1);

    assert_eq!(drain(&frontier_x).await, expect_x);
    assert_eq!(drain(&frontier_y).await, expect_y);
    cancel.cancel();
}

#[tokio::test]
async fn test_batch_is_retained_until_owner_acknowledges() {
    let cancel = CancellationToken::new();
    let peer_x = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();
    let frontier_x = frontier(&cancel);

    // Owner is a black hole; flushes must not lose the URLs.
    let router = SwitchRouter::new("127.0.0.1:1");
    let metrics = Metrics::new();
    let dispatcher = DistributedFrontier::new(
        Arc::clone(&peer_x),
        frontier_x,
        router,
        manual_options(),
        Arc::clone(&metrics),
        cancel.clone(),
    );

    dispatcher.put(&url("http://h.test/1")).await.unwrap();
    dispatcher.flush_batches_once().await;
    dispatcher.flush_batches_once().await;
    assert_eq!(dispatcher.pending_for("127.0.0.1:1"), 1);
    assert_eq!(metrics.batches_flushed.load(Ordering::Relaxed), 0);
    cancel.cancel();
}

#[tokio::test]
async fn test_lock_handoff_waits_for_inflight_and_moves_bloom() {
    let cancel = CancellationToken::new();
    let peer_x = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();
    let peer_y = Peer::bind("127.0.0.1:0", cancel.clone()).await.unwrap();
    let y_addr = peer_y.addr().to_string();

    let frontier_x = frontier(&cancel);
    let frontier_y = frontier(&cancel);

    let router_x = SwitchRouter::new(peer_x.addr());
    let metrics_x = Metrics::new();
    let dispatcher_x = DistributedFrontier::new(
        Arc::clone(&peer_x),
        Arc::clone(&frontier_x),
        Arc::clone(&router_x) as Arc<dyn Router>,
        manual_options(),
        Arc::clone(&metrics_x),
        cancel.clone(),
    );
    let router_y = SwitchRouter::new(peer_y.addr());
    let dispatcher_y = DistributedFrontier::new(
        Arc::clone(&peer_y),
        Arc::clone(&frontier_y),
        Arc::clone(&router_y) as Arc<dyn Router>,
        manual_options(),
        Metrics::new(),
        cancel.clone(),
    );

    // X owns h.test and starts fetching one of its URLs.
    dispatcher_x.put(&url("http://h.test/seen-1")).await.unwrap();
    dispatcher_x.put(&url("http://h.test/seen-2")).await.unwrap();
    let (inflight_url, _) = dispatcher_x.get().await.unwrap();
    assert_eq!(frontier_x.inflight_count("h.test"), 1);

    // The ring changes: Y owns h.test now.
    router_x.set_owner(peer_y.addr());
    let rebalance = {
        let dispatcher_x = Arc::clone(&dispatcher_x);
        tokio::spawn(async move { dispatcher_x.rebalance_once().await })
    };

    // Y sees keys.lock quickly and must not schedule the host while the old
    // owner still has a fetch in flight.
    tokio::time::sleep(Duration::from_millis(200)).await;
    dispatcher_y.put(&url("http://h.test/fresh")).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), dispatcher_y.get())
            .await
            .is_err(),
        "locked host must not be scheduled"
    );
    assert!(!rebalance.is_finished(), "notify waits for the in-flight fetch");

    // The fetch completes; the handoff streams the Bloom filter over.
    dispatcher_x
        .mark_successful(&inflight_url, Duration::from_millis(100))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rebalance)
        .await
        .expect("handoff completes")
        .unwrap();
    assert_eq!(metrics_x.handoffs.load(Ordering::Relaxed), 1);

    // Y now schedules the host.
    let (got, _) = tokio::time::timeout(Duration::from_secs(5), dispatcher_y.get())
        .await
        .expect("unlocked after notify")
        .unwrap();
    assert_eq!(got.as_str(), "http://h.test/fresh");
    dispatcher_y.mark_processed(&got).unwrap();

    // Dedup moved with the host: URLs X already saw are rejected on Y.
    dispatcher_y.put(&url("http://h.test/seen-1")).await.unwrap();
    dispatcher_y.put(&url("http://h.test/seen-2")).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(400), dispatcher_y.get())
            .await
            .is_err(),
        "migrated bloom filter rejects previously-seen urls"
    );

    // Genuinely new URLs still flow.
    dispatcher_y.put(&url("http://h.test/brand-new")).await.unwrap();
    let (novel, _) = tokio::time::timeout(Duration::from_secs(5), dispatcher_y.get())
        .await
        .expect("new url accepted")
        .unwrap();
    assert_eq!(novel.as_str(), "http://h.test/brand-new");

    // The old owner stopped dequeuing the handed-off host.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), dispatcher_x.get())
            .await
            .is_err(),
        "old owner's queue is locked after handoff"
    );
    cancel.cancel();
}
