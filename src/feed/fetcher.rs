use crate::feed::parser::{parse_feed, ParsedFeed, RawEntry};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while pulling a feed.
///
/// All of them are transient from the scheduler's point of view: the
/// subscription is simply retried at its next interval.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed XML could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Anything that can turn a feed address into raw entries.
pub trait FeedSource: Send + Sync {
    fn fetch_entries(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Vec<RawEntry>, FetchError>> + Send;
}

impl<T: FeedSource> FeedSource for Arc<T> {
    fn fetch_entries(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<Vec<RawEntry>, FetchError>> + Send {
        (**self).fetch_entries(address)
    }
}

/// Feed source backed by HTTP.
///
/// Retries 429 and 5xx responses with exponential back-off (1s, 2s, 4s) and
/// bounds every request by a timeout.
#[derive(Clone)]
pub struct HttpFeedSource {
    client: reqwest::Client,
    timeout: Duration,
    backoff_base: Duration,
}

impl HttpFeedSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            backoff_base: Duration::from_secs(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shorten the retry back-off (tests).
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Fetch and parse a feed, keeping its channel-level details.
    pub async fn fetch_feed(&self, address: &str) -> Result<ParsedFeed, FetchError> {
        let bytes = self.fetch_bytes(address).await?;

        let parsed = parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))?;
        if parsed.skipped > 0 {
            tracing::warn!(
                feed = %address,
                skipped = parsed.skipped,
                "Entries without timestamps skipped"
            );
        }
        Ok(parsed)
    }

    async fn fetch_bytes(&self, address: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            // The timeout covers headers and body alike
            let attempt = tokio::time::timeout(self.timeout, self.fetch_once(address))
                .await
                .map_err(|_| FetchError::Timeout)?;

            let status = match attempt {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(status)) => status,
                Err(FetchError::IncompleteResponse { expected, received })
                    if retry_count < MAX_RETRIES =>
                {
                    let delay = self.backoff_base * 2u32.pow(retry_count);
                    tracing::debug!(
                        feed = %address,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if retry_count >= MAX_RETRIES {
                return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    FetchError::RateLimited(MAX_RETRIES)
                } else {
                    FetchError::HttpStatus(status.as_u16())
                });
            }

            let delay = self.backoff_base * 2u32.pow(retry_count);
            tracing::warn!(
                feed = %address,
                status = %status,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Feed server unavailable, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    /// One request. `Ok(Err(status))` is a retryable 429 or 5xx response.
    async fn fetch_once(
        &self,
        address: &str,
    ) -> Result<Result<Vec<u8>, reqwest::StatusCode>, FetchError> {
        let response = self
            .client
            .get(address)
            .send()
            .await
            .map_err(FetchError::Network)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Ok(Err(status));
        }

        // 4xx errors fail immediately
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        read_limited_bytes(response, MAX_FEED_SIZE).await.map(Ok)
    }
}

impl FeedSource for HttpFeedSource {
    async fn fetch_entries(&self, address: &str) -> Result<Vec<RawEntry>, FetchError> {
        self.fetch_feed(address).await.map(|parsed| parsed.entries)
    }
}

pub(crate) async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
