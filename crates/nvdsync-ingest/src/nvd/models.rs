//! Data model for NVD synchronization

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A single entry of the upstream `vulnerabilities` array, untouched
pub type RawItem = serde_json::Value;

/// How a partition selects upstream records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    /// Records published within `[from, to)`
    YearRange,
    /// Records modified at or after `from`
    ModifiedSince,
}

/// A bounded slice of the upstream feed, processed as a unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
    pub kind: PartitionKind,
    /// Inclusive lower bound
    pub from: DateTime<Utc>,
    /// Exclusive upper bound; open-ended when absent
    pub to: Option<DateTime<Utc>>,
}

impl PartitionSpec {
    /// Partition covering every record published in `year`
    pub fn year(year: i32) -> Option<Self> {
        let from = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()?;
        let to = Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()?;
        Some(Self {
            kind: PartitionKind::YearRange,
            from,
            to: Some(to),
        })
    }

    pub fn modified_since(from: DateTime<Utc>) -> Self {
        Self {
            kind: PartitionKind::ModifiedSince,
            from,
            to: None,
        }
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            PartitionKind::YearRange => write!(f, "year:{}", self.from.year()),
            PartitionKind::ModifiedSince => {
                write!(f, "modified-since:{}", self.from.format("%Y-%m-%dT%H:%M:%SZ"))
            },
        }
    }
}

/// Response envelope of the CVE API 2.0 search endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CveApiResponse {
    pub results_per_page: u64,
    pub start_index: u64,
    pub total_results: u64,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub vulnerabilities: Vec<RawItem>,
}

/// One page of upstream results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPage {
    pub items: Vec<RawItem>,
    /// `startIndex` as reported by the upstream
    pub start_index: u64,
    pub total_results: u64,
}

impl RawPage {
    /// Cursor of the page after the one requested at `requested`
    ///
    /// Advances from the requested index, never from the echoed one, so the
    /// cursor strictly increases. An empty page ends the sequence.
    pub fn next_start_index(&self, requested: u64) -> Option<u64> {
        let next = requested + self.items.len() as u64;
        (!self.items.is_empty() && next < self.total_results).then_some(next)
    }
}

impl From<CveApiResponse> for RawPage {
    fn from(response: CveApiResponse) -> Self {
        Self {
            items: response.vulnerabilities,
            start_index: response.start_index,
            total_results: response.total_results,
        }
    }
}

/// Normalized, schema-validated representation of one CVE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Upstream identifier, e.g. `CVE-2021-44228`
    pub identifier: String,
    /// Canonical document; object keys are sorted
    pub payload: serde_json::Value,
    /// Upstream pages this record was read from
    pub source_urls: BTreeSet<String>,
}

impl CanonicalRecord {
    /// Year component of the identifier
    pub fn year(&self) -> Option<&str> {
        self.identifier.split('-').nth(1)
    }

    /// Lowercase key used by result stores
    pub fn storage_key(&self) -> String {
        self.identifier.to_lowercase()
    }
}

/// Counters describing what a run did with the records it saw
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Records that went through normalization
    pub processed_records: u64,
    /// Records that failed extraction or validation
    pub failed_records: u64,
    /// Repeats of an identifier already handled in this run
    pub duplicates_skipped: u64,
    /// Identifiers skipped because the result store already had them
    pub existing_skipped: u64,
}

/// What a run consulted and produced
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Every upstream URL requested, in request order
    pub urls: Vec<String>,
    /// Number of `(identifier, record)` pairs handed to the caller
    pub emitted_count: u64,
    pub stats: RunStats,
}
