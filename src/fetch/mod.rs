//! Single HTTP request with exponential backoff, jitter-free capped retry,
//! a per-host cookie jar, and browser-imitating headers. Grounded on the
//! teacher's `hosts/error_classifier.rs` status-driven retry policy and
//! `main.rs`'s shared-client construction, generalised to the simpler
//! retry-or-not policy this spec calls for.

use crate::config::ExtractorConfig;
use reqwest::{header, Method, StatusCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,
    #[error("transport error after final retry: {0}")]
    Transport(String),
}

const RETRYABLE_STATUSES: &[StatusCode] = &[
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
    StatusCode::TOO_MANY_REQUESTS,
];

/// Retrying, cookie-aware HTTP client. One instance is shared across the
/// Playlist Resolver and Segment Downloader so the cookie jar is process-wide
/// per host, as the concurrency model requires.
pub struct RetryableFetcher {
    client: reqwest::Client,
    retry_delay_ms: u64,
    max_retries: Option<u32>,
    max_retry_delay_ms: u64,
    retry_backoff_multiplier: f64,
}

impl RetryableFetcher {
    pub fn new(config: &ExtractorConfig) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ));
        headers.insert(header::ACCEPT_LANGUAGE, header::HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("max-age=0"));
        // Fetch-metadata headers; no `Accept-Encoding` is ever set here —
        // reqwest would otherwise negotiate one automatically via its
        // transparent decompression, which is what we want, but setting it
        // by hand is explicitly disallowed by the provider contract.
        headers.insert("Sec-Fetch-Dest", header::HeaderValue::from_static("document"));
        headers.insert("Sec-Fetch-Mode", header::HeaderValue::from_static("navigate"));
        headers.insert("Sec-Fetch-Site", header::HeaderValue::from_static("none"));

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(config.timeout_seconds))
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            retry_delay_ms: config.retry_delay_ms,
            max_retries: config.max_retries,
            max_retry_delay_ms: config.max_retry_delay_ms,
            retry_backoff_multiplier: config.retry_backoff_multiplier,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.retry_delay_ms as f64 * self.retry_backoff_multiplier.powi(attempt as i32);
        let capped = raw.min(self.max_retry_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        range: Option<(u64, u64)>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let mut req = self.client.request(method.clone(), url);
            if let Some((start, end)) = range {
                req = req.header(header::RANGE, format!("bytes={start}-{end}"));
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = req.send() => result,
            };

            match outcome {
                Ok(resp) => {
                    let status = resp.status();
                    if RETRYABLE_STATUSES.contains(&status) && self.should_retry(attempt) {
                        warn!(%url, %status, attempt, "retryable status, backing off");
                        attempt += 1;
                        self.sleep_or_cancel(attempt, cancel).await?;
                        continue;
                    }
                    if (status == StatusCode::FORBIDDEN || status == StatusCode::SERVICE_UNAVAILABLE)
                        && Self::looks_like_challenge(&resp).await
                    {
                        warn!(%url, %status, "anti-bot challenge detected, not retrying");
                        return Ok(resp);
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if self.should_retry(attempt) {
                        warn!(%url, error = %e, attempt, "transport error, retrying");
                        attempt += 1;
                        self.sleep_or_cancel(attempt, cancel).await?;
                        continue;
                    }
                    return Err(FetchError::Transport(e.to_string()));
                }
            }
        }
    }

    fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt < max,
            None => true,
        }
    }

    async fn sleep_or_cancel(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), FetchError> {
        let delay = self.delay_for_attempt(attempt);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Best-effort sniff for a Cloudflare-style interstitial. We never
    /// attempt to solve it, only detect and surface it unchanged.
    async fn looks_like_challenge(resp: &reqwest::Response) -> bool {
        // Peeking the body would consume the response; callers that need the
        // body text do their own inspection. Header-only heuristic here.
        resp.headers()
            .get("server")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase().contains("cloudflare"))
            .unwrap_or(false)
    }

    pub async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<reqwest::Response, FetchError> {
        self.fetch(Method::GET, url, None, cancel).await
    }

    pub async fn head(&self, url: &str, cancel: &CancellationToken) -> Result<reqwest::Response, FetchError> {
        self.fetch(Method::HEAD, url, None, cancel).await
    }

    pub async fn get_range(
        &self,
        url: &str,
        start: u64,
        end: u64,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, FetchError> {
        self.fetch(Method::GET, url, Some((start, end)), cancel).await
    }
}

/// Inspect a response/page body for the known anti-bot challenge sentinels.
/// Separate from `looks_like_challenge` because it needs owned body text.
pub fn body_indicates_challenge(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("cloudflare") || lower.contains("cf-browser-verification")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(max_retries: Option<u32>) -> RetryableFetcher {
        RetryableFetcher::new(&ExtractorConfig {
            base_url: String::new(),
            timeout_seconds: 30,
            user_agent: "test-agent".to_string(),
            retry_delay_ms: 2000,
            max_retries,
            max_retry_delay_ms: 30_000,
            retry_backoff_multiplier: 2.0,
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let f = fetcher(None);
        assert_eq!(f.delay_for_attempt(0), Duration::from_millis(2000));
        assert_eq!(f.delay_for_attempt(1), Duration::from_millis(4000));
        assert_eq!(f.delay_for_attempt(2), Duration::from_millis(8000));
        // saturates at max_retry_delay_ms well before attempt 30
        assert_eq!(f.delay_for_attempt(20), Duration::from_millis(30_000));
    }

    #[test]
    fn unbounded_retry_mode_always_retries() {
        let f = fetcher(None);
        assert!(f.should_retry(0));
        assert!(f.should_retry(1_000_000));
    }

    #[test]
    fn bounded_retry_mode_respects_cap() {
        let f = fetcher(Some(3));
        assert!(f.should_retry(0));
        assert!(f.should_retry(2));
        assert!(!f.should_retry(3));
    }

    #[test]
    fn challenge_body_sentinels() {
        assert!(body_indicates_challenge("Checking your browser... cloudflare"));
        assert!(body_indicates_challenge("<div id=\"cf-browser-verification\">"));
        assert!(!body_indicates_challenge("<html>ordinary page</html>"));
    }
}
