//! robots.txt checks with a bounded per-host cache. A worker concern; the
//! frontier schedules URLs without consulting robots rules.

use parking_lot::Mutex;
use robotstxt::DefaultMatcher;
use url::Url;

use crate::fetcher::{FetchError, Fetcher};
use crate::storage::cache::SlidingCache;
use crate::url_utils;

const CACHE_WINDOW: usize = 4096;

pub struct RobotsCache {
    /// hostKey -> robots.txt body. An empty body allows everything.
    bodies: Mutex<SlidingCache<String>>,
    user_agent: String,
}

impl RobotsCache {
    pub fn new(user_agent: &str) -> Self {
        Self {
            bodies: Mutex::new(SlidingCache::new(CACHE_WINDOW)),
            user_agent: user_agent.to_string(),
        }
    }

    /// Whether the host's robots.txt permits fetching `url`, fetching and
    /// caching the rules on first contact with the host.
    pub async fn allowed<F: Fetcher>(&self, fetcher: &F, url: &Url) -> Result<bool, FetchError> {
        let host = match url_utils::host_key(url) {
            Some(host) => host,
            None => return Ok(false),
        };

        let cached = self.bodies.lock().get(&host).cloned();
        let body = match cached {
            Some(body) => body,
            None => {
                let body = self.fetch_rules(fetcher, url).await?;
                self.bodies.lock().put(&host, body.clone());
                body
            }
        };

        let mut matcher = DefaultMatcher::default();
        Ok(matcher.one_agent_allowed_by_robots(&body, &self.user_agent, url.as_str()))
    }

    async fn fetch_rules<F: Fetcher>(&self, fetcher: &F, url: &Url) -> Result<String, FetchError> {
        let Some(robots_url) = url_utils::robots_url(url) else {
            return Ok(String::new());
        };
        let details = fetcher.fetch(&robots_url).await?;
        if details.status != 200 {
            // Missing rules allow everything.
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&details.body).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{FetchDetails, HeadDetails};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StaticFetcher {
        robots_body: &'static str,
        robots_status: u16,
        fetches: AtomicUsize,
    }

    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _url: &Url) -> Result<FetchDetails, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(FetchDetails {
                body: self.robots_body.as_bytes().to_vec(),
                status: self.robots_status,
                content_type: Some("text/plain".to_string()),
                ttr: Duration::from_millis(1),
            })
        }

        async fn head(&self, _url: &Url) -> Result<HeadDetails, FetchError> {
            Ok(HeadDetails {
                status: 200,
                content_length: None,
            })
        }
    }

    #[tokio::test]
    async fn test_disallow_rule_applies() {
        let fetcher = StaticFetcher {
            robots_body: "User-agent: *\nDisallow: /private/",
            robots_status: 200,
            fetches: AtomicUsize::new(0),
        };
        let cache = RobotsCache::new("OrbweaverBot/1.0");

        let open = Url::parse("https://a.com/public/page").unwrap();
        let closed = Url::parse("https://a.com/private/page").unwrap();
        assert!(cache.allowed(&fetcher, &open).await.unwrap());
        assert!(!cache.allowed(&fetcher, &closed).await.unwrap());
    }

    #[tokio::test]
    async fn test_rules_are_cached_per_host() {
        let fetcher = StaticFetcher {
            robots_body: "User-agent: *\nAllow: /",
            robots_status: 200,
            fetches: AtomicUsize::new(0),
        };
        let cache = RobotsCache::new("OrbweaverBot/1.0");

        let url = Url::parse("https://a.com/x").unwrap();
        for _ in 0..3 {
            assert!(cache.allowed(&fetcher, &url).await.unwrap());
        }
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_robots_allows_everything() {
        let fetcher = StaticFetcher {
            robots_body: "",
            robots_status: 404,
            fetches: AtomicUsize::new(0),
        };
        let cache = RobotsCache::new("OrbweaverBot/1.0");
        let url = Url::parse("https://a.com/anything").unwrap();
        assert!(cache.allowed(&fetcher, &url).await.unwrap());
    }
}
