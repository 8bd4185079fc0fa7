//! Two-tier HTTP fetch: direct (fast) with escalation to a headless browser
//! when the origin serves an anti-bot challenge.

pub mod browser;

use futures::StreamExt;
use governor::{Quota, RateLimiter};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use browser::BrowserTier;

/// Per-request timeout for the direct tier.
const FETCH_TIMEOUT_SECS: u64 = 20;
/// Requests per second per domain.
const RATE_PER_SECOND: u32 = 2;
/// Largest body accepted; bodies are streamed chunk by chunk up to this cap.
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("blocked by anti-bot challenge")]
    AntiBotBlock,
    #[error("invalid content: {0}")]
    InvalidContent(String),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("network error: {0}")]
    Network(String),
}

/// Result of a successful fetch through either tier.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub final_url: String,
}

impl FetchOutcome {
    pub fn is_html(&self) -> bool {
        self.mime.contains("text/html") || self.mime.contains("application/xhtml")
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

type DomainLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Two-tier fetcher with per-domain rate limiting.
///
/// Each domain gets its own rate limiter so product subdomains don't
/// bottleneck on a single limiter. The browser tier is launched lazily and
/// reused for the lifetime of the job; `shutdown` tears it down.
pub struct Fetcher {
    client: Client,
    domain_limiters: Arc<RwLock<HashMap<String, Arc<DomainLimiter>>>>,
    browser: BrowserTier,
}

impl Fetcher {
    pub fn new(user_agent: &str) -> Self {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(10))
            .gzip(true)
            .pool_max_idle_per_host(20)
            .build()
            .expect("Failed to build HTTP client");

        Fetcher {
            client,
            domain_limiters: Arc::new(RwLock::new(HashMap::new())),
            browser: BrowserTier::new(),
        }
    }

    /// Fetch a page, escalating to the browser tier on an anti-bot response.
    pub async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let (status, outcome) = self.direct(url, cancel).await?;

        if is_anti_bot_response(status, &outcome.bytes) {
            tracing::debug!(url = %url, status = status, "Anti-bot challenge, escalating to browser");
            return self.browser.fetch_html(url, cancel).await;
        }
        if status >= 400 {
            return Err(FetchError::HttpStatus(status));
        }
        Ok(outcome)
    }

    /// Fetch raw bytes without browser escalation. Used for PDF downloads:
    /// the browser tier can only return a rendered DOM, not the original
    /// body, so a challenged binary fetch is reported as blocked.
    pub async fn fetch_binary(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let (status, outcome) = self.direct(url, cancel).await?;
        if is_anti_bot_response(status, &outcome.bytes) {
            return Err(FetchError::AntiBotBlock);
        }
        if status >= 400 {
            return Err(FetchError::HttpStatus(status));
        }
        Ok(outcome)
    }

    /// Tear down the browser tier (no-op if it was never launched).
    pub async fn shutdown(&self) {
        self.browser.shutdown().await;
    }

    /// Direct-tier fetch. The body is read as a chunked stream with a
    /// cancellation check per chunk; a cancelled download is discarded.
    async fn direct(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(u16, FetchOutcome), FetchError> {
        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
            .unwrap_or_default();

        let limiter = self.get_limiter(&domain).await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = limiter.until_ready() => {}
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            r = self.client.get(url).send() => r.map_err(map_reqwest_error)?,
        };

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_lowercase();

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                c = stream.next() => c,
            };
            match chunk {
                Some(Ok(c)) => {
                    if bytes.len() + c.len() > MAX_BODY_BYTES {
                        return Err(FetchError::InvalidContent(format!(
                            "body exceeds {MAX_BODY_BYTES} bytes"
                        )));
                    }
                    bytes.extend_from_slice(&c);
                }
                Some(Err(e)) => return Err(map_reqwest_error(e)),
                None => break,
            }
        }

        Ok((
            status,
            FetchOutcome {
                bytes,
                mime,
                final_url,
            },
        ))
    }

    /// Get or create a rate limiter for the given domain.
    async fn get_limiter(&self, domain: &str) -> Arc<DomainLimiter> {
        {
            let limiters = self.domain_limiters.read().await;
            if let Some(limiter) = limiters.get(domain) {
                return limiter.clone();
            }
        }

        let mut limiters = self.domain_limiters.write().await;
        limiters
            .entry(domain.to_string())
            .or_insert_with(|| {
                let rate = NonZeroU32::new(RATE_PER_SECOND).unwrap();
                Arc::new(RateLimiter::direct(Quota::per_second(rate)))
            })
            .clone()
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

/// Signatures of Cloudflare / Akamai interstitial pages. Checked on 403/503
/// responses and on any body that carries a challenge marker.
const CHALLENGE_SIGNATURES: &[&str] = &[
    "checking your browser",
    "just a moment",
    "cf-browser-verification",
    "cf-chl",
    "attention required! | cloudflare",
    "_abck",
    "akam/1",
    "ak_bmsc",
];

pub fn is_anti_bot_response(status: u16, body: &[u8]) -> bool {
    let looks_challenged = || {
        // Challenge pages are small; only inspect a bounded prefix.
        let prefix = &body[..body.len().min(64 * 1024)];
        let text = String::from_utf8_lossy(prefix).to_lowercase();
        CHALLENGE_SIGNATURES.iter().any(|sig| text.contains(sig))
    };
    match status {
        403 | 503 => true,
        _ => looks_challenged(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_triggers_escalation() {
        assert!(is_anti_bot_response(403, b"<html>forbidden</html>"));
        assert!(is_anti_bot_response(503, b""));
        assert!(!is_anti_bot_response(200, b"<html>ok</html>"));
        assert!(!is_anti_bot_response(404, b"not found"));
    }

    #[test]
    fn test_cloudflare_signature_in_200_body() {
        let body = b"<html><title>Just a moment...</title></html>";
        assert!(is_anti_bot_response(200, body));

        let body = b"<html><body>Checking your browser before accessing</body></html>";
        assert!(is_anti_bot_response(200, body));
    }

    #[test]
    fn test_akamai_sensor_signature() {
        let body = b"<script>bm.js sensor_data _abck</script>";
        assert!(is_anti_bot_response(200, body));
    }

    #[test]
    fn test_plain_page_not_flagged() {
        let body = b"<html><body><a href=\"/spec.pdf\">spec</a></body></html>";
        assert!(!is_anti_bot_response(200, body));
    }
}
