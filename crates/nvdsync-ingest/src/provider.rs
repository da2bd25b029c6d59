//! NVD provider
//!
//! Wraps the [`Manager`] with a workspace: results are written through a
//! [`ResultStore`], and `metadata.json` remembers the watermark of the last
//! fully successful run. A failed or cancelled run never moves the watermark.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::nvd::{Manager, RunOptions};
use crate::schema::{NvdSchema, SchemaValidator};
use crate::store::{FsResultStore, ResultStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const PROVIDER_NAME: &str = "nvd";

const METADATA_FILE: &str = "metadata.json";

/// Persisted record of the last successful run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub provider: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub urls: Vec<String>,
    pub count: u64,
}

impl SyncState {
    pub fn path(workspace: &Path) -> PathBuf {
        workspace.join(METADATA_FILE)
    }

    /// Load the state of `workspace`, `None` if no run has succeeded yet
    pub async fn load(workspace: &Path) -> Result<Option<Self>> {
        let path = Self::path(workspace);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::store(format!("{}: {e}", path.display()))),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SyncError::store(format!("{}: {e}", path.display())))
    }

    pub async fn save(&self, workspace: &Path) -> Result<()> {
        let path = Self::path(workspace);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| SyncError::store(format!("{}: {e}", path.display())))?;

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SyncError::store(format!("{}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| SyncError::store(format!("{}: {e}", path.display())))
    }
}

pub struct NvdProvider {
    workspace: PathBuf,
    manager: Manager,
    store: Arc<dyn ResultStore>,
}

impl NvdProvider {
    /// Provider writing to `<workspace>/results` and fetching over HTTP
    pub fn new(workspace: impl Into<PathBuf>, config: Arc<SyncConfig>) -> Result<Self> {
        let workspace = workspace.into();
        let store: Arc<dyn ResultStore> = Arc::new(FsResultStore::new(&workspace));
        let manager = Manager::from_config(config, store.clone(), Arc::new(NvdSchema))?;
        Ok(Self::with_manager(workspace, manager, store))
    }

    pub fn with_manager(
        workspace: impl Into<PathBuf>,
        manager: Manager,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            manager,
            store,
        }
    }

    pub fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Write every record of one run; returns the URL inventory and write count
    pub async fn update(&self, options: RunOptions) -> Result<(Vec<String>, u64)> {
        let schema: &dyn SchemaValidator = self.manager.schema().as_ref();
        let mut run = self.manager.get_with(options)?;
        let mut written = 0u64;

        while let Some((identifier, record)) = run.next().await? {
            self.store
                .write(&identifier.to_lowercase(), schema, &record.payload)
                .await?;
            written += 1;
        }

        Ok((run.into_outcome().urls, written))
    }

    /// Run against the stored watermark and advance it on success
    ///
    /// With `full`, the watermark is ignored and every year is fetched again.
    pub async fn run(
        &self,
        skip_if_exists: bool,
        full: bool,
        cancel: CancellationToken,
    ) -> Result<SyncState> {
        let started = Utc::now();
        tokio::fs::create_dir_all(&self.workspace)
            .await
            .map_err(|e| SyncError::store(format!("{}: {e}", self.workspace.display())))?;

        let previous = SyncState::load(&self.workspace).await?;
        let last_updated = match (&previous, full) {
            (Some(state), false) => state.last_updated,
            _ => None,
        };
        info!(
            provider = PROVIDER_NAME,
            workspace = %self.workspace.display(),
            last_updated = ?last_updated,
            full,
            "Starting provider run"
        );

        let options = RunOptions::new(skip_if_exists, last_updated)
            .at(started)
            .with_cancellation(cancel);

        let (urls, count) = match self.update(options).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Run failed, keeping previous watermark");
                return Err(e);
            },
        };

        let state = SyncState {
            provider: PROVIDER_NAME.to_string(),
            last_updated: Some(started),
            urls,
            count,
        };
        state.save(&self.workspace).await?;

        info!(count = state.count, urls = state.urls.len(), "Provider run complete");
        Ok(state)
    }
}
