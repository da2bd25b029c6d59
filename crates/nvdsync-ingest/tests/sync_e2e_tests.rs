//! End-to-end tests for the synchronization manager
//!
//! These drive the real HTTP fetcher against a mock CVE API and cover:
//! - Full first runs and the skip-if-exists policy
//! - Failure mid-run and per-record failures
//! - Retry, throttling and rejection handling

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{cve, cves, mount_year, page_body, test_config, year_start, API_PATH};
use nvdsync_ingest::{Manager, MemoryResultStore, NvdSchema, SyncError};
use std::collections::HashSet;
use std::sync::Arc;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn manager(config: nvdsync_ingest::SyncConfig, store: MemoryResultStore) -> Manager {
    Manager::from_config(Arc::new(config), Arc::new(store), Arc::new(NvdSchema))
        .expect("Failed to build manager")
}

#[tokio::test]
async fn test_first_run_yields_every_distinct_record() {
    let server = MockServer::start().await;
    // 112 items in pages of 50/50/12; CVE-2002-0011 shows up again on page two.
    let mut items = cves(2002, 111);
    items.insert(60, items[10].clone());
    assert_eq!(items.len(), 112);
    mount_year(&server, 2002, &items, 50).await;

    let manager = manager(test_config(&server, 2002, 2002), MemoryResultStore::new());
    let mut run = manager.get(false, None).unwrap();

    let mut identifiers = HashSet::new();
    while let Some((identifier, record)) = run.next().await.unwrap() {
        assert_eq!(record.identifier, identifier);
        assert!(identifiers.insert(identifier));
    }

    let outcome = run.into_outcome();
    assert_eq!(identifiers.len(), 111);
    assert!(identifiers.contains("CVE-2002-0011"));
    assert_eq!(outcome.emitted_count, 111);
    assert_eq!(outcome.stats.duplicates_skipped, 1);
    assert_eq!(outcome.urls.len(), 3);
    assert!(outcome.urls[0].contains("startIndex=0"));
    assert!(outcome.urls[1].contains("startIndex=50"));
    assert!(outcome.urls[2].contains("startIndex=100"));
}

#[tokio::test]
async fn test_skip_if_exists_still_fetches_every_page() {
    let server = MockServer::start().await;
    mount_year(&server, 2002, &cves(2002, 111), 50).await;

    let existing: Vec<String> = (1..=111)
        .step_by(2)
        .take(40)
        .map(|i| format!("cve-2002-{i:04}"))
        .collect();
    let manager = manager(
        test_config(&server, 2002, 2002),
        MemoryResultStore::with_existing(existing),
    );

    let mut run = manager.get(true, None).unwrap();
    let mut yielded = 0;
    while run.next().await.unwrap().is_some() {
        yielded += 1;
    }

    assert_eq!(yielded, 71);
    assert_eq!(run.outcome().emitted_count, 71);
    assert_eq!(run.outcome().urls.len(), 3);
    assert_eq!(run.outcome().stats.existing_skipped, 40);
}

#[tokio::test]
async fn test_fetch_failure_mid_run_keeps_earlier_records() {
    let server = MockServer::start().await;
    mount_year(&server, 2002, &cves(2002, 30), 50).await;

    let items_2003 = cves(2003, 80);
    Mock::given(method("GET"))
        .and(path(API_PATH))
        .and(query_param("pubStartDate", year_start(2003)))
        .and(query_param("startIndex", "0"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(page_body(0, 50, 80, &items_2003[..50])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(API_PATH))
        .and(query_param("pubStartDate", year_start(2003)))
        .and(query_param("startIndex", "50"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let manager = manager(test_config(&server, 2002, 2003), MemoryResultStore::new());
    let mut run = manager.get(false, None).unwrap();

    let mut yielded = Vec::new();
    let err = loop {
        match run.next().await {
            Ok(Some((identifier, _))) => yielded.push(identifier),
            Ok(None) => panic!("run should fail on the second 2003 page"),
            Err(e) => break e,
        }
    };

    match err {
        SyncError::Fetch { url, attempts, .. } => {
            assert_eq!(attempts, 3);
            assert!(url.contains("startIndex=50"));
        },
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(yielded.iter().filter(|id| id.starts_with("CVE-2002-")).count(), 30);
    assert_eq!(run.outcome().urls.len(), 3);
    assert!(run.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_item_is_skipped() {
    let server = MockServer::start().await;
    let mut items = cves(2002, 19);
    items.insert(10, serde_json::json!({"cve": {"published": "2002-03-01T05:00:00.000"}}));
    mount_year(&server, 2002, &items, 50).await;

    let manager = manager(test_config(&server, 2002, 2002), MemoryResultStore::new());
    let mut run = manager.get(false, None).unwrap();

    let mut yielded = 0;
    while run.next().await.unwrap().is_some() {
        yielded += 1;
    }

    assert_eq!(yielded, 19);
    assert_eq!(run.outcome().stats.failed_records, 1);
    assert_eq!(run.outcome().urls.len(), 1);
}

#[tokio::test]
async fn test_transient_error_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(API_PATH))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(2)
        .with_priority(1)
        .expect(2)
        .mount(&server)
        .await;
    mount_year(&server, 2002, &cves(2002, 5), 50).await;

    let manager = manager(test_config(&server, 2002, 2002), MemoryResultStore::new());
    let mut run = manager.get(false, None).unwrap();

    let mut yielded = 0;
    while run.next().await.unwrap().is_some() {
        yielded += 1;
    }

    assert_eq!(yielded, 5);
    assert_eq!(run.outcome().urls.len(), 1);
}

#[tokio::test]
async fn test_rate_limited_response_honors_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(API_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_year(&server, 2002, &[cve("CVE-2002-0001")], 50).await;

    let manager = manager(test_config(&server, 2002, 2002), MemoryResultStore::new());
    let mut run = manager.get(false, None).unwrap();

    let (identifier, _) = run.next().await.unwrap().unwrap();
    assert_eq!(identifier, "CVE-2002-0001");
    assert!(run.next().await.unwrap().is_none());
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(API_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let manager = manager(test_config(&server, 2002, 2002), MemoryResultStore::new());
    let mut run = manager.get(false, None).unwrap();

    match run.next().await.unwrap_err() {
        SyncError::UpstreamRejected { status, .. } => assert_eq!(status, 404),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_api_key_is_sent_as_header_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(API_PATH))
        .and(header("apiKey", "test-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page_body(0, 50, 1, &[cve("CVE-2002-0001")])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = nvdsync_ingest::SyncConfig::builder()
        .api_base_url(format!("{}{}", server.uri(), API_PATH))
        .start_year(2002)
        .end_year(Some(2002))
        .query_window_days(366)
        .api_key(nvdsync_ingest::ApiKey::new("test-key"))
        .build()
        .unwrap();
    let manager = manager(config, MemoryResultStore::new());
    let mut run = manager.get(false, None).unwrap();

    assert!(run.next().await.unwrap().is_some());
    assert!(run.next().await.unwrap().is_none());
    assert!(run.outcome().urls.iter().all(|url| !url.contains("test-key")));
}
