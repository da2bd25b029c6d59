//! Error taxonomy for the synchronization engine
//!
//! Errors fall into two groups. Record-level errors ([`SyncError::MalformedRecord`],
//! [`SyncError::SchemaViolation`]) are absorbed by the manager: logged, counted
//! against the failure budget and skipped. Everything else is run-level and
//! terminates the run; the caller must not advance its watermark.

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid configuration, such as a start year after the end year
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient failures persisted past the retry budget
    #[error("Failed to fetch {url} after {attempts} attempt(s): {last_cause}")]
    Fetch {
        url: String,
        attempts: u32,
        last_cause: String,
    },

    /// Non-retryable client error from the upstream API
    #[error("Upstream rejected {url} with HTTP {status}")]
    UpstreamRejected { url: String, status: u16 },

    /// Raw item without a usable CVE identifier
    #[error("Malformed record: {raw_excerpt}")]
    MalformedRecord { raw_excerpt: String },

    /// Normalized record rejected by the schema validator
    #[error("Schema violation for {identifier}: {}", errors.join("; "))]
    SchemaViolation {
        identifier: String,
        errors: Vec<String>,
    },

    /// Too many record-level failures to trust the snapshot
    #[error(
        "Excessive failure rate: {failed} of {processed} records failed (threshold {threshold:.2})"
    )]
    ExcessiveFailureRate {
        failed: u64,
        processed: u64,
        threshold: f64,
    },

    /// Result store lookup or write failed
    #[error("Result store error: {0}")]
    Store(String),

    /// The run was aborted through its cancellation token
    #[error("Sync run cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a malformed-record error, truncating the raw text to a short excerpt
    pub fn malformed(raw: &str) -> Self {
        const MAX_EXCERPT: usize = 160;
        let raw_excerpt = match raw.char_indices().nth(MAX_EXCERPT) {
            Some((idx, _)) => format!("{}...", &raw[..idx]),
            None => raw.to_string(),
        };
        Self::MalformedRecord { raw_excerpt }
    }

    /// Whether this error only affects a single record
    pub fn is_record_level(&self) -> bool {
        matches!(
            self,
            SyncError::MalformedRecord { .. } | SyncError::SchemaViolation { .. }
        )
    }
}
