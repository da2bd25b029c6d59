//! Page reader
//!
//! Walks one partition page by page. The upstream caps the span of a date
//! query, so a partition is first cut into consecutive query windows; each
//! window is then paged with `startIndex` until the response reports no more
//! results. Reading is lazy and single-pass: a new reader starts over from
//! the first window.

use super::fetcher::PageFetcher;
use super::models::{PartitionKind, PartitionSpec, RawPage};
use crate::config::SyncConfig;
use crate::error::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::VecDeque;
use tracing::{trace, warn};
use url::Url;

/// Date range of a single upstream query, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A page together with the URL it came from
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub page: RawPage,
}

pub struct PageReader {
    partition: PartitionSpec,
    base_url: Url,
    results_per_page: u32,
    windows: VecDeque<QueryWindow>,
    /// Window being paged and the `startIndex` of its next page
    cursor: Option<(QueryWindow, u64)>,
}

impl PageReader {
    /// Prepare to read `partition`; nothing after `now` is requested
    pub fn new(partition: PartitionSpec, config: &SyncConfig, now: DateTime<Utc>) -> Self {
        let windows = split_windows(&partition, config.query_window_days(), now);
        Self {
            partition,
            base_url: config.api_base_url().clone(),
            results_per_page: config.results_per_page(),
            windows: windows.into(),
            cursor: None,
        }
    }

    pub fn partition(&self) -> &PartitionSpec {
        &self.partition
    }

    /// Fetch the next page of the partition, or `None` once it is exhausted
    ///
    /// The URL is appended to `inventory` before the request is made, so
    /// failed requests are still accounted for. A fetch error ends the
    /// sequence.
    pub async fn next_page(
        &mut self,
        fetcher: &dyn PageFetcher,
        inventory: &mut Vec<String>,
    ) -> Result<Option<FetchedPage>> {
        let (window, start_index) = match self.cursor.take() {
            Some(cursor) => cursor,
            None => match self.windows.pop_front() {
                Some(window) => (window, 0),
                None => return Ok(None),
            },
        };

        let url = self.page_url(&window, start_index);
        inventory.push(url.to_string());
        trace!(url = %url, partition = %self.partition, "Requesting page");

        let page = match fetcher.fetch(&url).await {
            Ok(page) => page,
            Err(e) => {
                self.windows.clear();
                return Err(e);
            },
        };

        if page.start_index != start_index {
            warn!(
                url = %url,
                requested = start_index,
                reported = page.start_index,
                "Upstream reported a different startIndex"
            );
        }
        self.cursor = page
            .next_start_index(start_index)
            .map(|next| (window, next));

        Ok(Some(FetchedPage {
            url: url.to_string(),
            page,
        }))
    }

    /// Build the request URL for one page of a window
    pub fn page_url(&self, window: &QueryWindow, start_index: u64) -> Url {
        let (start_param, end_param) = match self.partition.kind {
            PartitionKind::YearRange => ("pubStartDate", "pubEndDate"),
            PartitionKind::ModifiedSince => ("lastModStartDate", "lastModEndDate"),
        };

        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair(start_param, &format_timestamp(window.start))
            .append_pair(end_param, &format_timestamp(window.end))
            .append_pair("resultsPerPage", &self.results_per_page.to_string())
            .append_pair("startIndex", &start_index.to_string());
        url
    }
}

/// Timestamp format accepted by the upstream date filters
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Cut a partition into query windows of at most `window_days`, clipped at `now`
pub fn split_windows(
    partition: &PartitionSpec,
    window_days: i64,
    now: DateTime<Utc>,
) -> Vec<QueryWindow> {
    let limit = match partition.to {
        Some(to) if to < now => to,
        _ => now,
    };
    let span = chrono::Duration::days(window_days.max(1));
    let last_instant = chrono::Duration::milliseconds(1);

    let mut windows = Vec::new();
    let mut start = partition.from;
    while start < limit {
        let end = (start + span).min(limit);
        windows.push(QueryWindow {
            start,
            end: end - last_instant,
        });
        start = end;
    }
    windows
}
