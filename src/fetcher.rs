//! HTTP fetching with measured time-to-response.
//!
//! The frontier never fetches; workers do, through this seam, and report the
//! observed TTR back via `mark_successful` so politeness delays adapt.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

#[derive(Debug, Clone)]
pub struct FetchDetails {
    pub body: Vec<u8>,
    pub status: u16,
    pub content_type: Option<String>,
    /// Time to response for the whole exchange.
    pub ttr: Duration,
}

#[derive(Debug, Clone)]
pub struct HeadDetails {
    pub status: u16,
    pub content_length: Option<u64>,
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timeout")]
    Timeout,
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("failed to build http client: {0}")]
    ClientBuild(String),
}

impl FetchError {
    fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FetchError::Timeout
        } else if error.is_body() || error.is_decode() {
            FetchError::Body(error.to_string())
        } else {
            FetchError::Network(error.to_string())
        }
    }
}

/// Fetch seam so tests substitute scripted responses for live HTTP.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<FetchDetails, FetchError>> + Send;
    fn head(&self, url: &Url) -> impl Future<Output = Result<HeadDetails, FetchError>> + Send;
}

impl<F: Fetcher + ?Sized> Fetcher for std::sync::Arc<F> {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<FetchDetails, FetchError>> + Send {
        (**self).fetch(url)
    }
    fn head(&self, url: &Url) -> impl Future<Output = Result<HeadDetails, FetchError>> + Send {
        (**self).head(url)
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchDetails, FetchError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url.clone())
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            )
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        let ttr = start.elapsed();

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Body(e.to_string()))?;

        Ok(FetchDetails {
            body: body.to_vec(),
            status,
            content_type,
            ttr,
        })
    }

    async fn head(&self, url: &Url) -> Result<HeadDetails, FetchError> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;
        Ok(HeadDetails {
            status: response.status().as_u16(),
            content_length: response.content_length(),
        })
    }
}
