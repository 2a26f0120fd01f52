//! Shared HTTP client for council sites, the dataset catalog and the
//! geocoder.
//!
//! Requests are limited twice: a global in-flight cap and a smaller cap per
//! host, since many councils publish through the same few portals. Transient
//! failures (5xx, 429, connect errors, client timeouts) are retried with
//! doubling delays; everything else is returned to the caller as-is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

/// Append query parameters to a base URL, percent-encoding values.
pub fn url_with_params(base: &str, params: &[(&str, String)]) -> anyhow::Result<String> {
    let url = Url::parse_with_params(base, params).with_context(|| format!("building url from {base}"))?;
    Ok(url.to_string())
}

/// Resolve a possibly relative link against the page it was found on.
pub fn resolve_link(page_url: &str, href: &str) -> Option<String> {
    let base = Url::parse(page_url).ok()?;
    base.join(href.trim()).ok().map(|u| u.to_string())
}

fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default()
}

pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// How many times a transient failure is retried, and how long to wait.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            initial_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles, capped.
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.ceiling)
    }
}

/// Spaces calls at least `interval` apart. Callers queue in arrival order.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for this caller's slot. The first call never waits.
    pub async fn wait(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(slot) = *next_slot {
            if slot > now {
                tokio::time::sleep_until(slot).await;
            }
        }
        *next_slot = Some(Instant::now() + self.interval);
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_host: usize,
    pub retry: RetryPolicy,
    /// Minimum spacing between any two requests, if set.
    pub pace: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 16,
            max_in_flight_per_host: 2,
            retry: RetryPolicy::default(),
            pace: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// First characters of the body as lossy text, for failure reports.
    pub fn snippet(&self, max_chars: usize) -> String {
        String::from_utf8_lossy(&self.body).chars().take(max_chars).collect()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::Closed => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }

    /// Worth another attempt after a pause.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(is_transient_status)
                .unwrap_or(false),
            FetchError::Request(err) => err.is_timeout() || err.is_connect(),
            FetchError::Closed => false,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_host_limit: config.max_in_flight_per_host.max(1),
            per_host: Mutex::new(HashMap::new()),
            pacer: config.pace.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    async fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.per_host.lock().await;
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GET `url` on behalf of `source` (a council name or service label).
    /// Only 2xx responses are returned as `Ok`.
    pub async fn fetch_bytes(&self, run_id: Uuid, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        // Host first, so a request queued behind a busy host holds no global slot.
        let host = self.host_semaphore(&host_of(url)).await;
        let _host_slot = host.acquire().await.map_err(|_| FetchError::Closed)?;
        let _slot = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut retry = 0usize;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait().await;
            }
            match self.get_once(url).await {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_transient() && retry < self.retry.retries => {
                    let delay = self.retry.delay(retry);
                    debug!(error = %err, retry, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);
        let body = resp.bytes().await?.to_vec();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}
