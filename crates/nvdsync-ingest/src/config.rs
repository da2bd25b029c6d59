//! Validated synchronization configuration
//!
//! [`SyncConfig`] is constructed once at startup through [`SyncConfig::builder`]
//! and shared read-only with the manager and its collaborators. Secrets are
//! resolved before they get here; nothing in the engine reads the environment.

use crate::error::{Result, SyncError};
use chrono::Datelike;
use std::fmt;
use std::time::Duration;
use url::Url;

// ============================================================================
// Defaults
// ============================================================================

/// NVD CVE API 2.0 endpoint
pub const DEFAULT_API_BASE_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

/// Per-request timeout in seconds
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 125;

/// First year of CVE publication that is synchronized by default
pub const DEFAULT_START_YEAR: i32 = 2002;

/// Earliest year the CVE program assigned identifiers for
pub const MIN_START_YEAR: i32 = 1988;

/// Largest page the upstream will serve
pub const MAX_RESULTS_PER_PAGE: u32 = 2000;

/// Upstream limit on the span of a single date-range query
pub const DEFAULT_QUERY_WINDOW_DAYS: i64 = 120;

/// Overlap subtracted from the watermark for modified-since runs
pub const DEFAULT_MODIFIED_OVERLAP_HOURS: i64 = 2;

/// Fraction of failed records above which a run is abandoned
pub const DEFAULT_MAX_FAILURE_RATE: f64 = 0.10;

/// Records that must be processed before the failure rate is enforced
pub const DEFAULT_FAILURE_RATE_MIN_SAMPLE: u64 = 50;

/// Secret API key. Formatting never reveals the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a key, treating an empty or blank value as "no key"
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(********)")
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("********")
    }
}

/// Bounded exponential backoff for transient fetch failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per URL, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Request quota shared by every fetch in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Rolling window the quota applies to
    pub window: Duration,
    /// Requests per window without an API key
    pub anonymous_requests: u32,
    /// Requests per window with an API key
    pub keyed_requests: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            anonymous_requests: 5,
            keyed_requests: 50,
        }
    }
}

impl RateLimitPolicy {
    pub fn requests_per_window(&self, has_api_key: bool) -> u32 {
        if has_api_key {
            self.keyed_requests
        } else {
            self.anonymous_requests
        }
    }
}

/// Immutable configuration for one synchronization engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    api_base_url: Url,
    download_timeout: Duration,
    start_year: i32,
    end_year: Option<i32>,
    api_key: Option<ApiKey>,
    results_per_page: u32,
    query_window_days: i64,
    modified_overlap: chrono::Duration,
    max_failure_rate: f64,
    failure_rate_min_sample: u64,
    retry: RetryPolicy,
    rate_limit: RateLimitPolicy,
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    pub fn api_base_url(&self) -> &Url {
        &self.api_base_url
    }

    pub fn download_timeout(&self) -> Duration {
        self.download_timeout
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    pub fn end_year(&self) -> Option<i32> {
        self.end_year
    }

    pub fn api_key(&self) -> Option<&ApiKey> {
        self.api_key.as_ref()
    }

    pub fn results_per_page(&self) -> u32 {
        self.results_per_page
    }

    pub fn query_window_days(&self) -> i64 {
        self.query_window_days
    }

    pub fn modified_overlap(&self) -> chrono::Duration {
        self.modified_overlap
    }

    pub fn max_failure_rate(&self) -> f64 {
        self.max_failure_rate
    }

    pub fn failure_rate_min_sample(&self) -> u64 {
        self.failure_rate_min_sample
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn rate_limit(&self) -> RateLimitPolicy {
        self.rate_limit
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_base_url(),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            start_year: DEFAULT_START_YEAR,
            end_year: None,
            api_key: None,
            results_per_page: MAX_RESULTS_PER_PAGE,
            query_window_days: DEFAULT_QUERY_WINDOW_DAYS,
            modified_overlap: chrono::Duration::hours(DEFAULT_MODIFIED_OVERLAP_HOURS),
            max_failure_rate: DEFAULT_MAX_FAILURE_RATE,
            failure_rate_min_sample: DEFAULT_FAILURE_RATE_MIN_SAMPLE,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

impl fmt::Display for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end_year = self
            .end_year
            .map(|y| y.to_string())
            .unwrap_or_else(|| "current".to_string());
        let api_key = if self.api_key.is_some() {
            "********"
        } else {
            "<none>"
        };
        write!(
            f,
            "api_base_url={} download_timeout={}s years={}..={} api_key={} \
             results_per_page={} query_window_days={} modified_overlap={}m \
             max_failure_rate={} retry_attempts={}",
            self.api_base_url,
            self.download_timeout.as_secs(),
            self.start_year,
            end_year,
            api_key,
            self.results_per_page,
            self.query_window_days,
            self.modified_overlap.num_minutes(),
            self.max_failure_rate,
            self.retry.max_attempts,
        )
    }
}

#[allow(clippy::expect_used)]
fn default_base_url() -> Url {
    Url::parse(DEFAULT_API_BASE_URL).expect("default API URL is valid")
}

/// Builder for [`SyncConfig`]; validation happens in [`SyncConfigBuilder::build`]
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
    api_base_url: Option<String>,
}

impl SyncConfigBuilder {
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn download_timeout(mut self, timeout: Duration) -> Self {
        self.config.download_timeout = timeout;
        self
    }

    pub fn start_year(mut self, year: i32) -> Self {
        self.config.start_year = year;
        self
    }

    pub fn end_year(mut self, year: Option<i32>) -> Self {
        self.config.end_year = year;
        self
    }

    pub fn api_key(mut self, key: Option<ApiKey>) -> Self {
        self.config.api_key = key;
        self
    }

    pub fn results_per_page(mut self, count: u32) -> Self {
        self.config.results_per_page = count;
        self
    }

    pub fn query_window_days(mut self, days: i64) -> Self {
        self.config.query_window_days = days;
        self
    }

    pub fn modified_overlap(mut self, overlap: chrono::Duration) -> Self {
        self.config.modified_overlap = overlap;
        self
    }

    pub fn max_failure_rate(mut self, rate: f64) -> Self {
        self.config.max_failure_rate = rate;
        self
    }

    pub fn failure_rate_min_sample(mut self, count: u64) -> Self {
        self.config.failure_rate_min_sample = count;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitPolicy) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<SyncConfig> {
        let mut config = self.config;

        if let Some(raw) = self.api_base_url {
            config.api_base_url = Url::parse(&raw).map_err(|e| {
                SyncError::configuration(format!("invalid api_base_url '{raw}': {e}"))
            })?;
        }

        if config.start_year < MIN_START_YEAR {
            return Err(SyncError::configuration(format!(
                "start_year {} is before {}",
                config.start_year, MIN_START_YEAR
            )));
        }

        let effective_end = config
            .end_year
            .unwrap_or_else(|| chrono::Utc::now().year());
        if config.start_year > effective_end {
            return Err(SyncError::configuration(format!(
                "start_year {} is after end_year {}",
                config.start_year, effective_end
            )));
        }

        if config.download_timeout.is_zero() {
            return Err(SyncError::configuration("download_timeout must be positive"));
        }

        if config.results_per_page == 0 || config.results_per_page > MAX_RESULTS_PER_PAGE {
            return Err(SyncError::configuration(format!(
                "results_per_page must be between 1 and {MAX_RESULTS_PER_PAGE}"
            )));
        }

        if !(1..=366).contains(&config.query_window_days) {
            return Err(SyncError::configuration(
                "query_window_days must be between 1 and 366",
            ));
        }

        if config.modified_overlap < chrono::Duration::zero() {
            return Err(SyncError::configuration("modified_overlap cannot be negative"));
        }

        if !(0.0..=1.0).contains(&config.max_failure_rate) {
            return Err(SyncError::configuration(
                "max_failure_rate must be between 0.0 and 1.0",
            ));
        }

        if config.retry.max_attempts == 0 {
            return Err(SyncError::configuration("retry.max_attempts must be at least 1"));
        }

        if config.rate_limit.window.is_zero()
            || config.rate_limit.anonymous_requests == 0
            || config.rate_limit.keyed_requests == 0
        {
            return Err(SyncError::configuration(
                "rate_limit window and request quotas must be positive",
            ));
        }

        Ok(config)
    }
}
