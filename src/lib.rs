pub mod bloom;
pub mod cli;
pub mod config;
pub mod dht;
pub mod fetcher;
pub mod frontier;
pub mod logging;
pub mod metrics;
pub mod net;
pub mod parser;
pub mod proto;
pub mod robots;
pub mod seeder;
pub mod storage;
pub mod url_utils;
pub mod worker;

// Re-export the surface a crawler embedding the frontier needs.
pub use bloom::BloomStore;
pub use config::Config;
pub use dht::{Dht, DhtConfig, RingId, Router};
pub use fetcher::{Fetcher, HttpFetcher};
pub use frontier::{
    AnyFrontier, BfFrontier, DistributedFrontier, FrontierError, PolitenessConfig,
};
pub use metrics::Metrics;
pub use net::Peer;
pub use storage::queue::QueueStore;
pub use storage::{Kv, MemoryKv, SledKv};
