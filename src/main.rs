use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use orbweaver::bloom::BloomStore;
use orbweaver::cli::Cli;
use orbweaver::config::Config;
use orbweaver::dht::{Dht, Router};
use orbweaver::fetcher::HttpFetcher;
use orbweaver::frontier::{AnyFrontier, BfFrontier, DistributedFrontier};
use orbweaver::metrics::Metrics;
use orbweaver::net::Peer;
use orbweaver::robots::RobotsCache;
use orbweaver::storage::queue::QueueStore;
use orbweaver::storage::{Kv, SledKv};
use orbweaver::worker::{self, WorkerConfig};
use orbweaver::{logging, seeder};

const MAX_PAGE_SIZE: u64 = 100 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();
    let mut config = Config::load(&cli.conf)?;
    cli.apply(&mut config);

    logging::init_logging(Path::new(&config.data_dir).join("logs"))?;
    let scope = config.scope_regex()?;

    let cancel = CancellationToken::new();
    setup_shutdown_handler(cancel.clone());

    let metrics = Metrics::new();
    metrics.spawn_reporter(Duration::from_secs(30), cancel.clone());

    // Persistent state: queue data and metadata in one namespace, Bloom
    // filters in another, all inside a single sled database.
    let db = sled::open(Path::new(&config.data_dir).join("frontier"))?;
    let queue_kv: Arc<dyn Kv> = Arc::new(SledKv::open(&db, "queues")?);
    let bloom_kv: Arc<dyn Kv> = Arc::new(SledKv::open(&db, "bloom")?);

    let local_frontier = Arc::new(BfFrontier::new(
        QueueStore::new(queue_kv),
        BloomStore::new(bloom_kv),
        config.politeness_config(),
        cancel.clone(),
    ));
    let restored = local_frontier.load_queues()?;
    if restored > 0 {
        tracing::info!(queues = restored, "restored host queues from disk");
    }

    let frontier = if config.is_distributed() {
        let peer = Peer::bind(&config.distributed.addr, cancel.clone()).await?;
        tracing::info!(addr = peer.addr(), "distribution enabled");

        let dht = Dht::new(Arc::clone(&peer), config.dht_config(), cancel.clone());
        if !config.distributed.bootstrap_node.is_empty() {
            if let Err(e) = dht.join(&config.distributed.bootstrap_node).await {
                tracing::warn!(
                    bootstrap = %config.distributed.bootstrap_node,
                    error = %e,
                    "bootstrap failed; continuing as a fresh ring"
                );
            }
        }

        let router: Arc<dyn Router> = dht;
        let dispatcher = DistributedFrontier::new(
            peer,
            Arc::clone(&local_frontier),
            router,
            config.distributed_options(),
            Arc::clone(&metrics),
            cancel.clone(),
        );
        Arc::new(AnyFrontier::Distributed(dispatcher))
    } else {
        Arc::new(AnyFrontier::Local(Arc::clone(&local_frontier)))
    };

    if !config.seed.is_empty() {
        match seeder::read_seed(&config.seed) {
            Ok(urls) => {
                let mut seeded = 0;
                for url in urls {
                    match frontier.put(&url).await {
                        Ok(true) => {
                            seeded += 1;
                            metrics.urls_put.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {
                            metrics.dedup_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => tracing::warn!(%url, error = %e, "seed rejected"),
                    }
                }
                tracing::info!(seeded, "seed file loaded");
            }
            Err(e) => tracing::error!(seed = %config.seed, error = %e, "failed to read seed file"),
        }
    }

    let fetcher = Arc::new(HttpFetcher::new(&config.user_agent, config.fetch_timeout())?);
    let robots = Arc::new(RobotsCache::new(&config.user_agent));
    let workers = worker::spawn_workers(
        WorkerConfig {
            workers: config.workers,
            scope,
            max_page_size: MAX_PAGE_SIZE,
        },
        Arc::clone(&frontier),
        fetcher,
        robots,
        Arc::clone(&metrics),
        cancel.clone(),
    );
    tracing::info!(workers = workers.len(), "crawling");

    cancel.cancelled().await;

    tracing::info!("draining workers");
    let _ = tokio::time::timeout(
        Duration::from_secs(10),
        futures_util::future::join_all(workers),
    )
    .await;

    local_frontier.flush();
    db.flush()?;
    tracing::info!("{}", metrics.snapshot());
    Ok(())
}

/// First Ctrl+C cancels everything for a graceful drain; a second one exits
/// immediately.
fn setup_shutdown_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, draining (press Ctrl+C again to force quit)");
            cancel.cancel();

            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("force quit");
                std::process::exit(1);
            }
        }
    });
}
