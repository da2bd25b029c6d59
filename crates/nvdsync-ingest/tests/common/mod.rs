//! Shared helpers for the end-to-end tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use nvdsync_ingest::{RateLimitPolicy, RetryPolicy, SyncConfig};
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

pub const API_PATH: &str = "/rest/json/cves/2.0";

/// A well-formed vulnerability item
pub fn cve(id: &str) -> Value {
    json!({
        "cve": {
            "id": id,
            "sourceIdentifier": "cve@mitre.org",
            "published": "2002-03-01T05:00:00.000",
            "lastModified": "2024-01-01T00:00:00.000",
            "vulnStatus": "Analyzed",
            "descriptions": [{"lang": "en", "value": "Example flaw"}],
            "metrics": {},
            "references": [{"url": "https://example.com/advisory"}]
        }
    })
}

/// Items `CVE-<year>-0001` .. `CVE-<year>-<count>`
pub fn cves(year: i32, count: usize) -> Vec<Value> {
    (1..=count).map(|i| cve(&format!("CVE-{year}-{i:04}"))).collect()
}

/// CVE API response body for one page
pub fn page_body(start_index: usize, per_page: usize, total: usize, items: &[Value]) -> Value {
    json!({
        "resultsPerPage": per_page,
        "startIndex": start_index,
        "totalResults": total,
        "format": "NVD_CVE",
        "version": "2.0",
        "timestamp": "2024-06-15T12:00:00.000",
        "vulnerabilities": items
    })
}

pub fn year_start(year: i32) -> String {
    format!("{year}-01-01T00:00:00.000+00:00")
}

/// Mount one mock per page of `items` for a whole-year query
pub async fn mount_year(server: &MockServer, year: i32, items: &[Value], per_page: usize) {
    let total = items.len();
    let mut start = 0;
    loop {
        let end = (start + per_page).min(total);
        Mock::given(method("GET"))
            .and(path(API_PATH))
            .and(query_param("pubStartDate", year_start(year)))
            .and(query_param("startIndex", start.to_string()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page_body(start, per_page, total, &items[start..end])),
            )
            .mount(server)
            .await;

        if end >= total {
            break;
        }
        start = end;
    }
}

/// Configuration pointing at `server` with fast retries and a loose rate limit
pub fn test_config(server: &MockServer, start_year: i32, end_year: i32) -> SyncConfig {
    SyncConfig::builder()
        .api_base_url(format!("{}{}", server.uri(), API_PATH))
        .start_year(start_year)
        .end_year(Some(end_year))
        .query_window_days(366)
        .results_per_page(50)
        .download_timeout(Duration::from_secs(5))
        .retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        })
        .rate_limit(RateLimitPolicy {
            window: Duration::from_secs(1),
            anonymous_requests: 1000,
            keyed_requests: 1000,
        })
        .build()
        .expect("test configuration is valid")
}
