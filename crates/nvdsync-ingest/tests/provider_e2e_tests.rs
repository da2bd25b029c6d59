//! End-to-end tests for the NVD provider
//!
//! These validate workspace handling against a mock CVE API:
//! - Results written to disk with lowercase identifiers
//! - Watermark persistence and incremental follow-up runs
//! - Failed runs leaving the watermark untouched

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{cves, mount_year, test_config, API_PATH};
use nvdsync_ingest::provider::{NvdProvider, SyncState};
use nvdsync_ingest::FsResultStore;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path, query_param_is_missing},
    Mock, MockServer, ResponseTemplate,
};

async fn provider_with_year(server: &MockServer, dir: &TempDir, count: usize) -> NvdProvider {
    mount_year(server, 2002, &cves(2002, count), 50).await;
    NvdProvider::new(dir.path(), Arc::new(test_config(server, 2002, 2002)))
        .expect("Failed to build provider")
}

#[tokio::test]
async fn test_run_writes_results_and_watermark() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let provider = provider_with_year(&server, &dir, 5).await;

    let state = provider
        .run(false, false, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(state.provider, "nvd");
    assert_eq!(state.count, 5);
    assert_eq!(state.urls.len(), 1);
    assert!(state.last_updated.is_some());
    assert_eq!(SyncState::load(dir.path()).await.unwrap(), Some(state));

    let store = FsResultStore::new(dir.path());
    let stored = store.read("cve-2002-0003").await.unwrap().unwrap();
    assert_eq!(stored.identifier, "cve-2002-0003");
    assert_eq!(stored.item["cve"]["id"], "CVE-2002-0003");
    assert!(dir.path().join("results/2002/cve-2002-0005.json").exists());
}

#[tokio::test]
async fn test_failed_run_keeps_previous_watermark() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let provider = provider_with_year(&server, &dir, 3).await;

    let first = provider
        .run(false, false, CancellationToken::new())
        .await
        .unwrap();

    // The follow-up run is incremental and the upstream is down.
    server.reset().await;
    Mock::given(method("GET"))
        .and(path(API_PATH))
        .and(query_param_is_missing("pubStartDate"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let err = provider
        .run(false, false, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, nvdsync_ingest::SyncError::Fetch { .. }));
    assert_eq!(SyncState::load(dir.path()).await.unwrap(), Some(first));
}

#[tokio::test]
async fn test_full_run_with_skip_policy_writes_nothing_new() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let provider = provider_with_year(&server, &dir, 4).await;

    provider
        .run(false, false, CancellationToken::new())
        .await
        .unwrap();
    let second = provider
        .run(true, true, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(second.count, 0);
    assert_eq!(second.urls.len(), 1);
}

#[tokio::test]
async fn test_cancelled_run_does_not_save_state() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let provider = provider_with_year(&server, &dir, 2).await;

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = provider.run(false, false, cancel).await.unwrap_err();
    assert!(matches!(err, nvdsync_ingest::SyncError::Cancelled));
    assert_eq!(SyncState::load(dir.path()).await.unwrap(), None);
}
