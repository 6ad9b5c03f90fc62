//! Shared HTTP client for source fetchers.
//!
//! Requests are capped by a semaphore, retried on throttling and transient failures,
//! and abandoned as soon as the cycle's cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

use crate::AdapterError;

/// 5xx and 429 are worth another attempt; other statuses are final.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Exponential backoff between attempts, capped at `ceiling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub initial_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn wait_before_retry(&self, retry: u32) -> Duration {
        let multiplier = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(multiplier).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all sources.
    pub concurrent_requests: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrent_requests: 8,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
    slots: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(agent) = config.user_agent {
            builder = builder.user_agent(agent);
        }
        Ok(Self {
            inner: builder.build()?,
            slots: Arc::new(Semaphore::new(config.concurrent_requests.max(1))),
            retry: config.retry,
        })
    }

    /// Fetches the body at `url`. Returns [`AdapterError::Cancelled`] once `cancel` fires.
    pub async fn get(
        &self,
        source: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AdapterError> {
        let span = info_span!("http_fetch", source, url);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdapterError::Cancelled),
            body = self.fetch_body(url).instrument(span) => body,
        }
    }

    async fn fetch_body(&self, url: &str) -> Result<Vec<u8>, AdapterError> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| AdapterError::Message("http client closed".to_string()))?;

        let mut retry = 0u32;
        loop {
            let can_retry = retry < self.retry.retries;
            match self.inner.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !can_retry || !is_retryable_status(status) {
                        return Err(AdapterError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    debug!(%status, retry, "upstream status, backing off");
                }
                Err(err) => {
                    if !can_retry || !is_transient(&err) {
                        return Err(AdapterError::Request(err));
                    }
                    debug!(error = %err, retry, "request failed, backing off");
                }
            }
            tokio::time::sleep(self.retry.wait_before_retry(retry)).await;
            retry += 1;
        }
    }
}
