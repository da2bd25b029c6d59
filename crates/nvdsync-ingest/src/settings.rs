//! Startup settings
//!
//! Defaults, an optional TOML file and `NVDSYNC_`-prefixed environment
//! variables are merged with `figment`, in that order of precedence. Nested
//! keys use a double underscore: `NVDSYNC_RETRY__MAX_ATTEMPTS=3`.
//!
//! `api_key` may be written as `env:VAR_NAME`; it is resolved once, when the
//! settings are loaded, and an empty value means "no key".

use crate::config::{
    ApiKey, RateLimitPolicy, RetryPolicy, SyncConfig, DEFAULT_API_BASE_URL,
    DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_FAILURE_RATE_MIN_SAMPLE, DEFAULT_MAX_FAILURE_RATE,
    DEFAULT_MODIFIED_OVERLAP_HOURS, DEFAULT_QUERY_WINDOW_DAYS, DEFAULT_START_YEAR,
    MAX_RESULTS_PER_PAGE,
};
use anyhow::Context;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "NVDSYNC_";

/// Conventional source of the API key
pub const DEFAULT_API_KEY: &str = "env:NVD_API_KEY";

const REDACTED: &str = "********";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_backoff_secs: policy.initial_backoff.as_secs(),
            max_backoff_secs: policy.max_backoff.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub anonymous_requests: u32,
    pub keyed_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let policy = RateLimitPolicy::default();
        Self {
            window_secs: policy.window.as_secs(),
            anonymous_requests: policy.anonymous_requests,
            keyed_requests: policy.keyed_requests,
        }
    }
}

/// Everything the `nvdsync` binary can be configured with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    /// Per-request timeout in seconds
    pub request_timeout: u64,
    pub start_year: i32,
    pub end_year: Option<i32>,
    pub api_key: String,
    pub results_per_page: u32,
    pub query_window_days: i64,
    pub modified_overlap_minutes: i64,
    pub max_failure_rate: f64,
    pub failure_rate_min_sample: u64,
    pub skip_if_exists: bool,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            start_year: DEFAULT_START_YEAR,
            end_year: None,
            api_key: DEFAULT_API_KEY.to_string(),
            results_per_page: MAX_RESULTS_PER_PAGE,
            query_window_days: DEFAULT_QUERY_WINDOW_DAYS,
            modified_overlap_minutes: DEFAULT_MODIFIED_OVERLAP_HOURS * 60,
            max_failure_rate: DEFAULT_MAX_FAILURE_RATE,
            failure_rate_min_sample: DEFAULT_FAILURE_RATE_MIN_SAMPLE,
            skip_if_exists: false,
            retry: RetrySettings::default(),
            rate_limit: RateLimitSettings::default(),
        }
    }
}

impl Settings {
    /// Layered sources, without secret resolution
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load `.env`, merge every source and resolve the API key
    pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        if let Some(path) = config_file {
            anyhow::ensure!(
                path.exists(),
                "config file {} does not exist",
                path.display()
            );
        }

        Self::from_figment(Self::figment(config_file), |name| std::env::var(name).ok())
    }

    /// Extract settings and resolve `env:` references through `lookup`
    pub fn from_figment<F>(figment: Figment, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings: Settings = figment.extract().context("invalid settings")?;
        settings.api_key = resolve_secret(&settings.api_key, lookup);
        Ok(settings)
    }

    pub fn to_sync_config(&self) -> crate::error::Result<SyncConfig> {
        SyncConfig::builder()
            .api_base_url(self.api_base_url.clone())
            .download_timeout(Duration::from_secs(self.request_timeout))
            .start_year(self.start_year)
            .end_year(self.end_year)
            .api_key(ApiKey::new(self.api_key.clone()))
            .results_per_page(self.results_per_page)
            .query_window_days(self.query_window_days)
            .modified_overlap(chrono::Duration::minutes(self.modified_overlap_minutes))
            .max_failure_rate(self.max_failure_rate)
            .failure_rate_min_sample(self.failure_rate_min_sample)
            .retry(RetryPolicy {
                max_attempts: self.retry.max_attempts,
                initial_backoff: Duration::from_secs(self.retry.initial_backoff_secs),
                max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
            })
            .rate_limit(RateLimitPolicy {
                window: Duration::from_secs(self.rate_limit.window_secs),
                anonymous_requests: self.rate_limit.anonymous_requests,
                keyed_requests: self.rate_limit.keyed_requests,
            })
            .build()
    }

    /// Copy safe to print or log
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.api_key.is_empty() {
            copy.api_key = REDACTED.to_string();
        }
        copy
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = serde_json::to_string_pretty(&self.redacted()).map_err(|_| fmt::Error)?;
        f.write_str(&rendered)
    }
}

/// Resolve an `env:VAR` reference; other values are returned as is
fn resolve_secret<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match raw.strip_prefix("env:") {
        Some(var) => lookup(var.trim()).unwrap_or_default(),
        None => raw.to_string(),
    }
}
