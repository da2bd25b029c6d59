//! Rate-limited HTTP access to the CVE API
//!
//! Every request waits on a rate limiter shared by the whole run, carries a
//! per-request timeout, and is retried with exponential backoff on timeouts,
//! 5xx and 429 responses. A `Retry-After` hint overrides the computed delay,
//! up to the policy's maximum backoff. Other 4xx responses fail immediately.

use super::models::{CveApiResponse, RawPage};
use crate::config::{ApiKey, RetryPolicy, SyncConfig};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Header the upstream reads the API key from
pub const API_KEY_HEADER: &str = "apiKey";

/// Source of upstream result pages
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetch and decode one page
    async fn fetch(&self, url: &Url) -> Result<RawPage>;
}

/// Outcome of a single HTTP attempt that did not produce a page
#[derive(Debug)]
enum AttemptError {
    Transient {
        cause: String,
        retry_after: Option<Duration>,
    },
    Rejected {
        status: u16,
    },
}

/// [`PageFetcher`] backed by `reqwest`
pub struct HttpFetcher {
    client: Client,
    api_key: Option<ApiKey>,
    timeout: Duration,
    retry: RetryPolicy,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl HttpFetcher {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("nvdsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::configuration(format!("failed to build HTTP client: {e}")))?;

        let has_key = config.api_key().is_some();
        let policy = config.rate_limit();
        let limiter = build_limiter(policy.window, policy.requests_per_window(has_key))?;

        debug!(
            authenticated = has_key,
            requests_per_window = policy.requests_per_window(has_key),
            window_secs = policy.window.as_secs_f64(),
            "Configured upstream rate limit"
        );

        Ok(Self {
            client,
            api_key: config.api_key().cloned(),
            timeout: config.download_timeout(),
            retry: config.retry(),
            limiter: Arc::new(limiter),
        })
    }

    async fn attempt(&self, url: &Url) -> std::result::Result<RawPage, AttemptError> {
        self.limiter.until_ready().await;

        let mut request = self.client.get(url.clone()).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key.expose());
        }

        let response = request.send().await.map_err(|e| AttemptError::Transient {
            cause: describe(&e, self.timeout),
            retry_after: None,
        })?;

        let status = response.status();
        if status.is_success() {
            let body: CveApiResponse =
                response.json().await.map_err(|e| AttemptError::Transient {
                    cause: format!("unreadable response body: {}", describe(&e, self.timeout)),
                    retry_after: None,
                })?;
            return Ok(body.into());
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AttemptError::Transient {
                cause: format!("HTTP {status}"),
                retry_after: parse_retry_after(response.headers()),
            });
        }

        Err(AttemptError::Rejected {
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<RawPage> {
        let max_attempts = self.retry.max_attempts;
        let mut last_cause = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            match self.attempt(url).await {
                Ok(page) => {
                    debug!(
                        url = %url,
                        attempt,
                        items = page.items.len(),
                        total = page.total_results,
                        "Fetched page"
                    );
                    return Ok(page);
                },
                Err(AttemptError::Rejected { status }) => {
                    warn!(url = %url, status, "Upstream rejected request");
                    return Err(SyncError::UpstreamRejected {
                        url: url.to_string(),
                        status,
                    });
                },
                Err(AttemptError::Transient { cause, retry_after }) => {
                    if attempt < max_attempts {
                        let delay = retry_delay(&self.retry, attempt, retry_after);
                        warn!(
                            url = %url,
                            attempt,
                            max_attempts,
                            cause = %cause,
                            delay_ms = delay.as_millis() as u64,
                            "Page fetch failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_cause = cause;
                },
            }
        }

        Err(SyncError::Fetch {
            url: url.to_string(),
            attempts: max_attempts,
            last_cause,
        })
    }
}

/// Delay before retrying after a failed `attempt`; hints are capped at `max_backoff`
fn retry_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(hint) => hint.min(policy.max_backoff),
        None => policy.backoff_for(attempt),
    }
}

/// At most `requests` cells in any rolling `window`
///
/// Cells are spaced evenly with no burst; a burst of N on top of an N/window
/// refill would admit up to 2N-1 requests in one window.
fn build_quota(window: Duration, requests: u32) -> Result<Quota> {
    if requests == 0 {
        return Err(SyncError::configuration("rate limit quota must be positive"));
    }
    Quota::with_period(window / requests)
        .map(|quota| quota.allow_burst(NonZeroU32::MIN))
        .ok_or_else(|| SyncError::configuration("rate limit window is too small"))
}

fn build_limiter(window: Duration, requests: u32) -> Result<DefaultDirectRateLimiter> {
    Ok(RateLimiter::direct(build_quota(window, requests)?))
}

fn describe(err: &reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        format!("request timed out after {}s", timeout.as_secs_f64())
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}

/// Read `Retry-After` as delta-seconds or an HTTP date
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use governor::clock::FakeRelativeClock;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after_past_date_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_missing_or_garbage() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn test_build_limiter_rejects_zero_quota() {
        assert!(build_limiter(Duration::from_secs(30), 0).is_err());
        assert!(build_limiter(Duration::from_secs(30), 5).is_ok());
    }

    #[test]
    fn test_limiter_never_exceeds_quota_in_any_window() {
        let clock = FakeRelativeClock::default();
        let limiter =
            RateLimiter::direct_with_clock(build_quota(Duration::from_secs(1), 5).unwrap(), &clock);
        let step = Duration::from_millis(5);

        let mut admitted_at = Vec::new();
        let mut elapsed = Duration::ZERO;
        while elapsed < Duration::from_secs(3) {
            if limiter.check().is_ok() {
                admitted_at.push(elapsed);
            }
            clock.advance(step);
            elapsed += step;
        }

        assert_eq!(admitted_at.iter().filter(|t| **t < Duration::from_millis(950)).count(), 5);
        for pair in admitted_at.windows(6) {
            assert!(
                pair[5] - pair[0] >= Duration::from_secs(1),
                "6 requests within one window: {pair:?}"
            );
        }
        assert!(admitted_at.len() >= 14);
    }

    #[test]
    fn test_retry_after_is_capped_at_max_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        };
        assert_eq!(
            retry_delay(&policy, 1, Some(Duration::from_secs(86_400))),
            Duration::from_secs(60)
        );
        assert_eq!(
            retry_delay(&policy, 1, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(retry_delay(&policy, 3, None), Duration::from_secs(8));
    }
}
