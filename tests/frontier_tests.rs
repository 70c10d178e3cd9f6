//! End-to-end scheduler behavior over real sled-backed persistence.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use url::Url;

use orbweaver::bloom::BloomStore;
use orbweaver::frontier::{BfFrontier, PolitenessConfig};
use orbweaver::storage::queue::QueueStore;
use orbweaver::storage::{Kv, SledKv};

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn sled_frontier(dir: &TempDir, cfg: PolitenessConfig) -> (sled::Db, BfFrontier) {
    let db = sled::open(dir.path().join("frontier")).unwrap();
    let queue_kv: Arc<dyn Kv> = Arc::new(SledKv::open(&db, "queues").unwrap());
    let bloom_kv: Arc<dyn Kv> = Arc::new(SledKv::open(&db, "bloom").unwrap());
    let frontier = BfFrontier::new(
        QueueStore::new(queue_kv),
        BloomStore::new(bloom_kv),
        cfg,
        CancellationToken::new(),
    );
    (db, frontier)
}

fn fast() -> PolitenessConfig {
    PolitenessConfig {
        multiplier: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_urls_survive_restart_in_order() {
    let dir = TempDir::new().unwrap();

    {
        let (db, frontier) = sled_frontier(&dir, fast());
        for i in 0..5 {
            frontier.put(&url(&format!("http://a.com/{}", i))).unwrap();
        }
        for i in 0..3 {
            frontier.put(&url(&format!("http://b.com/{}", i))).unwrap();
        }
        frontier.flush();
        db.flush().unwrap();
    }

    let (_db, frontier) = sled_frontier(&dir, fast());
    assert_eq!(frontier.load_queues().unwrap(), 2);

    let mut a_urls = Vec::new();
    let mut b_urls = Vec::new();
    for _ in 0..8 {
        let (got, _) = tokio::time::timeout(Duration::from_secs(5), frontier.get())
            .await
            .expect("queued url available after restart")
            .unwrap();
        match got.host_str() {
            Some("a.com") => a_urls.push(got.to_string()),
            Some("b.com") => b_urls.push(got.to_string()),
            other => panic!("unexpected host {:?}", other),
        }
        frontier.mark_processed(&got).unwrap();
    }

    assert_eq!(
        a_urls,
        (0..5).map(|i| format!("http://a.com/{}", i)).collect::<Vec<_>>()
    );
    assert_eq!(
        b_urls,
        (0..3).map(|i| format!("http://b.com/{}", i)).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_dedup_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let (db, frontier) = sled_frontier(&dir, fast());
        frontier.put(&url("http://a.com/once")).unwrap();
        frontier.flush();
        db.flush().unwrap();
    }

    let (_db, frontier) = sled_frontier(&dir, fast());
    frontier.load_queues().unwrap();
    // The Bloom filter persisted, so the same URL is dropped again.
    frontier.put(&url("http://a.com/once")).unwrap();

    let (first, _) = frontier.get().await.unwrap();
    assert_eq!(first.as_str(), "http://a.com/once");
    frontier.mark_processed(&first).unwrap();

    let second = tokio::time::timeout(Duration::from_millis(400), frontier.get()).await;
    assert!(second.is_err(), "duplicate must not be dequeued twice");
}

#[tokio::test]
async fn test_politeness_spacing_from_observed_rtt() {
    let dir = TempDir::new().unwrap();
    let (_db, frontier) = sled_frontier(
        &dir,
        PolitenessConfig {
            multiplier: 10,
            ..Default::default()
        },
    );

    frontier.put(&url("http://a.com/1")).unwrap();
    frontier.put(&url("http://a.com/2")).unwrap();

    let (first, first_not_before) = frontier.get().await.unwrap();
    // The worker reports a 500 ms fetch.
    frontier
        .mark_successful(&first, Duration::from_millis(500))
        .unwrap();

    let (_, second_not_before) = tokio::time::timeout(Duration::from_secs(5), frontier.get())
        .await
        .expect("second url becomes due")
        .unwrap();

    // 10 x 500 ms politeness window after the first fetch.
    assert!(second_not_before - first_not_before >= Duration::from_secs(5));
}

#[tokio::test]
async fn test_session_budget_with_single_active_slot() {
    let dir = TempDir::new().unwrap();
    let (_db, frontier) = sled_frontier(
        &dir,
        PolitenessConfig {
            max_active_queues: 1,
            multiplier: 0,
            session_budget: 2,
        },
    );

    for i in 0..5 {
        frontier.put(&url(&format!("http://a.com/{}", i))).unwrap();
    }
    frontier.put(&url("http://b.com/only")).unwrap();

    let mut hosts = Vec::new();
    for _ in 0..4 {
        let (got, _) = tokio::time::timeout(Duration::from_secs(5), frontier.get())
            .await
            .expect("url due")
            .unwrap();
        hosts.push(got.host_str().unwrap().to_string());
        frontier.mark_processed(&got).unwrap();
    }

    // A's budget of 2 drains, B gets its turn, then A is re-admitted.
    assert_eq!(hosts, vec!["a.com", "a.com", "b.com", "a.com"]);
}

#[tokio::test]
async fn test_failed_url_is_dropped_after_third_strike() {
    let dir = TempDir::new().unwrap();
    let (_db, frontier) = sled_frontier(&dir, fast());

    frontier.put(&url("http://a.com/flaky")).unwrap();
    for _ in 0..3 {
        let (got, _) = tokio::time::timeout(Duration::from_secs(5), frontier.get())
            .await
            .expect("retry available")
            .unwrap();
        assert_eq!(got.as_str(), "http://a.com/flaky");
        frontier.mark_failed(&got).unwrap();
    }

    let gone = tokio::time::timeout(Duration::from_millis(400), frontier.get()).await;
    assert!(gone.is_err(), "url dropped after the retry cap");
}
