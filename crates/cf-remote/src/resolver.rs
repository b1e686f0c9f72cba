//! Source resolution with rate limiting and bounded retry.
//!
//! A [`SourceLookup`] turns a reference (e.g. a social media post URL) into a
//! directly downloadable media URL. The [`Resolver`] wraps a lookup with a
//! process-wide rate limiter and exponential backoff, retrying only failures
//! classified as retryable.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cf_core::config::ResolverConfig;
use cf_core::{Error, Result};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[async_trait]
pub trait SourceLookup: Send + Sync {
    /// Resolve `reference` to a playable URL. Failures are
    /// [`Error::Resolution`] with the retryable flag set by the lookup.
    async fn lookup(&self, reference: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Rate-limited, retrying front of a [`SourceLookup`].
pub struct Resolver {
    lookup: Arc<dyn SourceLookup>,
    limiter: Arc<DirectLimiter>,
    max_attempts: u32,
    base_delay: Duration,
}

impl Resolver {
    pub fn new(lookup: Arc<dyn SourceLookup>, config: &ResolverConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            lookup,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Resolve `reference`, retrying retryable failures with exponential
    /// backoff. Every attempt first waits for a rate-limit permit.
    ///
    /// Returns the first non-retryable error immediately, or the last
    /// retryable error once all attempts are spent.
    pub async fn resolve(&self, reference: &str) -> Result<String> {
        let mut attempt = 1;
        loop {
            self.limiter.until_ready().await;

            let err = match self.lookup.lookup(reference).await {
                Ok(url) => {
                    tracing::debug!(reference, attempt, "Resolved source");
                    return Ok(url);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::warn!(reference, attempt, error = %err, "Source resolution failed");
                return Err(err);
            }
            if attempt >= self.max_attempts {
                tracing::warn!(reference, attempts = attempt, error = %err, "Source resolution retries exhausted");
                return Err(err);
            }

            let delay = backoff(self.base_delay, attempt);
            tracing::info!(reference, attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying source resolution");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// `base * 2^(attempt-1)`, saturating.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

// ---------------------------------------------------------------------------
// HTTP lookup
// ---------------------------------------------------------------------------

/// Lookup against `GET {base_url}/resolve?url={reference}` returning
/// `{"url": "..."}`.
///
/// Rate limiting (429), server errors (5xx) and transport failures are
/// retryable; any other non-success status is not.
pub struct HttpSourceLookup {
    http: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
    api_key_header: String,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    url: Option<String>,
}

impl HttpSourceLookup {
    pub fn new(config: &ResolverConfig) -> Result<Self> {
        Ok(Self {
            http: crate::http_client(Duration::from_secs(config.timeout_secs))?,
            base_url: config
                .base_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            api_key: config.api_key.clone(),
            api_key_header: config.api_key_header.clone(),
        })
    }
}

#[async_trait]
impl SourceLookup for HttpSourceLookup {
    async fn lookup(&self, reference: &str) -> Result<String> {
        let base = self
            .base_url
            .as_deref()
            .ok_or_else(|| Error::resolution(false, "resolver.base_url is not configured"))?;

        let mut req = self
            .http
            .get(format!("{base}/resolve"))
            .query(&[("url", reference)]);
        if let Some(key) = &self.api_key {
            req = req.header(self.api_key_header.as_str(), key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| Error::resolution(true, format!("lookup request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Error::resolution(true, format!("lookup returned {status}")));
        }
        if !status.is_success() {
            return Err(Error::resolution(false, format!("lookup returned {status}")));
        }

        let body: LookupResponse = resp
            .json()
            .await
            .map_err(|e| Error::resolution(false, format!("unreadable lookup response: {e}")))?;
        body.url
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::resolution(false, format!("no media found for {reference}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Fails with the given retryability for the first `failures` calls.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        retryable: bool,
    }

    #[async_trait]
    impl SourceLookup for Flaky {
        async fn lookup(&self, _reference: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(Error::resolution(self.retryable, format!("attempt {n}")))
            } else {
                Ok("https://cdn/video.mp4".into())
            }
        }
    }

    fn config(max_attempts: u32) -> ResolverConfig {
        ResolverConfig {
            max_attempts,
            base_delay_ms: 1,
            requests_per_second: 1000,
            ..Default::default()
        }
    }

    fn flaky(failures: u32, retryable: bool) -> Arc<Flaky> {
        Arc::new(Flaky {
            calls: AtomicU32::new(0),
            failures,
            retryable,
        })
    }

    #[tokio::test]
    async fn always_retryable_makes_exactly_max_attempts() {
        let lookup = flaky(u32::MAX, true);
        let resolver = Resolver::new(lookup.clone(), &config(3));

        let err = resolver.resolve("ref").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Resolution error: attempt 3");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_stops_after_one_attempt() {
        let lookup = flaky(u32::MAX, false);
        let resolver = Resolver::new(lookup.clone(), &config(3));

        let err = resolver.resolve("ref").await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let lookup = flaky(2, true);
        let resolver = Resolver::new(lookup.clone(), &config(3));

        let url = resolver.resolve("ref").await.unwrap();
        assert_eq!(url, "https://cdn/video.mp4");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let lookup = flaky(u32::MAX, true);
        let resolver = Resolver::new(lookup.clone(), &config(0));
        assert_eq!(resolver.max_attempts(), 1);
        resolver.resolve("ref").await.unwrap_err();
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 1), Duration::from_millis(100));
        assert_eq!(backoff(base, 2), Duration::from_millis(200));
        assert_eq!(backoff(base, 3), Duration::from_millis(400));
        assert_eq!(backoff(base, 40), base.saturating_mul(u32::MAX));
    }

    async fn http_lookup(server: &MockServer) -> HttpSourceLookup {
        HttpSourceLookup::new(&ResolverConfig {
            base_url: Some(server.uri()),
            api_key: Some("secret".into()),
            timeout_secs: 5,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn http_lookup_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resolve"))
            .and(query_param("url", "https://social/p/1"))
            .and(header("x-api-key", "secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"url": "https://cdn/v.mp4"})),
            )
            .mount(&server)
            .await;

        let url = http_lookup(&server).await.lookup("https://social/p/1").await.unwrap();
        assert_eq!(url, "https://cdn/v.mp4");
    }

    #[tokio::test]
    async fn http_lookup_classifies_statuses() {
        for (status, retryable) in [(429, true), (503, true), (404, false), (400, false)] {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;

            let err = http_lookup(&server).await.lookup("ref").await.unwrap_err();
            assert_eq!(err.is_retryable(), retryable, "status {status}");
        }
    }

    #[tokio::test]
    async fn resolver_over_http_counts_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let resolver = Resolver::new(Arc::new(http_lookup(&server).await), &config(3));
        let err = resolver.resolve("ref").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn missing_base_url_is_not_retryable() {
        let lookup = HttpSourceLookup::new(&ResolverConfig::default()).unwrap();
        let err = lookup.lookup("ref").await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
