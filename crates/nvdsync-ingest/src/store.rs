//! Result stores
//!
//! The manager only needs a point existence check; providers also write
//! through the same trait. Writes are per key and atomic, and rewriting an
//! identical payload is a no-op.

use crate::error::{Result, SyncError};
use crate::schema::SchemaValidator;
use async_trait::async_trait;
use nvdsync_common::checksum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Schema a stored payload was validated against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
    pub version: String,
}

impl SchemaInfo {
    pub fn of(schema: &dyn SchemaValidator) -> Self {
        Self {
            name: schema.name().to_string(),
            version: schema.version().to_string(),
        }
    }
}

/// Stored form of one result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub schema: SchemaInfo,
    pub identifier: String,
    /// SHA-256 of the compact serialization of `item`
    pub digest: String,
    pub item: Value,
}

impl ResultEnvelope {
    pub fn new(identifier: &str, schema: &dyn SchemaValidator, item: &Value) -> Result<Self> {
        let digest =
            checksum::json_digest(item).map_err(|e| SyncError::store(e.to_string()))?;
        Ok(Self {
            schema: SchemaInfo::of(schema),
            identifier: identifier.to_string(),
            digest,
            item: item.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Updated,
    /// Same digest was already stored
    Unchanged,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Whether a successfully written result exists for `identifier`
    async fn exists(&self, identifier: &str) -> Result<bool>;

    /// Atomically store `payload` under `identifier`
    async fn write(
        &self,
        identifier: &str,
        schema: &dyn SchemaValidator,
        payload: &Value,
    ) -> Result<WriteOutcome>;
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryResultStore {
    results: Mutex<HashMap<String, ResultEnvelope>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with placeholder results for `identifiers`
    pub fn with_existing<I, S>(identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let results = identifiers
            .into_iter()
            .map(|id| {
                let id = id.into();
                let envelope = ResultEnvelope {
                    schema: SchemaInfo {
                        name: "placeholder".to_string(),
                        version: "0".to_string(),
                    },
                    identifier: id.clone(),
                    digest: String::new(),
                    item: Value::Null,
                };
                (id, envelope)
            })
            .collect();
        Self {
            results: Mutex::new(results),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ResultEnvelope>>> {
        self.results
            .lock()
            .map_err(|_| SyncError::store("memory store lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, identifier: &str) -> Option<ResultEnvelope> {
        self.lock().ok()?.get(identifier).cloned()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn exists(&self, identifier: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(identifier))
    }

    async fn write(
        &self,
        identifier: &str,
        schema: &dyn SchemaValidator,
        payload: &Value,
    ) -> Result<WriteOutcome> {
        let envelope = ResultEnvelope::new(identifier, schema, payload)?;
        let mut results = self.lock()?;
        let outcome = match results.get(identifier) {
            Some(existing) if existing.digest == envelope.digest => WriteOutcome::Unchanged,
            Some(_) => WriteOutcome::Updated,
            None => WriteOutcome::Created,
        };
        results.insert(identifier.to_string(), envelope);
        Ok(outcome)
    }
}

/// One JSON file per identifier under `<root>/results/<year>/`
#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
}

impl FsResultStore {
    pub fn new(workspace: impl AsRef<Path>) -> Self {
        Self {
            root: workspace.as_ref().join("results"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path for an identifier such as `cve-2002-0001`
    pub fn path_for(&self, identifier: &str) -> Result<PathBuf> {
        let valid = !identifier.is_empty()
            && identifier
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SyncError::store(format!(
                "identifier '{identifier}' is not a safe file name"
            )));
        }

        let year = identifier
            .split('-')
            .nth(1)
            .filter(|y| y.len() == 4 && y.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or("other");

        Ok(self.root.join(year).join(format!("{identifier}.json")))
    }

    /// Read a stored result, verifying its digest
    pub async fn read(&self, identifier: &str) -> Result<Option<ResultEnvelope>> {
        let path = self.path_for(identifier)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };

        let envelope: ResultEnvelope = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::store(format!("{}: {e}", path.display())))?;
        checksum::verify_json_digest(identifier, &envelope.item, &envelope.digest)
            .map_err(|e| SyncError::store(e.to_string()))?;

        Ok(Some(envelope))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> SyncError {
    SyncError::store(format!("{}: {err}", path.display()))
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn exists(&self, identifier: &str) -> Result<bool> {
        let path = self.path_for(identifier)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn write(
        &self,
        identifier: &str,
        schema: &dyn SchemaValidator,
        payload: &Value,
    ) -> Result<WriteOutcome> {
        let path = self.path_for(identifier)?;
        let envelope = ResultEnvelope::new(identifier, schema, payload)?;

        let outcome = match self.read(identifier).await {
            Ok(Some(existing)) if existing.digest == envelope.digest => {
                return Ok(WriteOutcome::Unchanged)
            },
            Ok(Some(_)) => WriteOutcome::Updated,
            Ok(None) => WriteOutcome::Created,
            // A corrupt previous result is simply replaced.
            Err(_) => WriteOutcome::Updated,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }

        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| SyncError::store(format!("{identifier}: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(identifier, path = %path.display(), ?outcome, "Wrote result");
        Ok(outcome)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::NvdSchema;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_write_outcomes() {
        let store = MemoryResultStore::new();
        let payload = json!({"cve": {"id": "CVE-2002-0001"}});

        assert!(!store.exists("cve-2002-0001").await.unwrap());
        assert_eq!(
            store.write("cve-2002-0001", &NvdSchema, &payload).await.unwrap(),
            WriteOutcome::Created
        );
        assert_eq!(
            store.write("cve-2002-0001", &NvdSchema, &payload).await.unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            store
                .write("cve-2002-0001", &NvdSchema, &json!({"cve": {"id": "x"}}))
                .await
                .unwrap(),
            WriteOutcome::Updated
        );
        assert!(store.exists("cve-2002-0001").await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_with_existing() {
        let store = MemoryResultStore::with_existing(["cve-2002-0001", "cve-2002-0002"]);
        assert!(store.exists("cve-2002-0002").await.unwrap());
        assert!(!store.exists("cve-2002-0003").await.unwrap());
    }

    #[test]
    fn test_fs_path_layout() {
        let store = FsResultStore::new("/data/nvd");
        assert_eq!(
            store.path_for("cve-2021-44228").unwrap(),
            PathBuf::from("/data/nvd/results/2021/cve-2021-44228.json")
        );
        assert!(store.path_for("../etc/passwd").is_err());
        assert!(store.path_for("").is_err());
    }

    #[tokio::test]
    async fn test_fs_store_round_trip_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path());
        let payload = json!({"cve": {"id": "CVE-2002-0001"}});

        assert!(!store.exists("cve-2002-0001").await.unwrap());
        assert_eq!(
            store.write("cve-2002-0001", &NvdSchema, &payload).await.unwrap(),
            WriteOutcome::Created
        );
        assert!(store.exists("cve-2002-0001").await.unwrap());
        assert_eq!(
            store.write("cve-2002-0001", &NvdSchema, &payload).await.unwrap(),
            WriteOutcome::Unchanged
        );

        let envelope = store.read("cve-2002-0001").await.unwrap().unwrap();
        assert_eq!(envelope.item, payload);
        assert_eq!(envelope.schema.name, "nvd");
        assert!(!store.path_for("cve-2002-0001").unwrap().with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_fs_store_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path());
        store
            .write("cve-2002-0001", &NvdSchema, &json!({"cve": {"id": "CVE-2002-0001"}}))
            .await
            .unwrap();

        let path = store.path_for("cve-2002-0001").unwrap();
        let mut envelope: ResultEnvelope =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        envelope.item = json!({"cve": {"id": "CVE-2002-9999"}});
        std::fs::write(&path, serde_json::to_vec(&envelope).unwrap()).unwrap();

        assert!(matches!(
            store.read("cve-2002-0001").await.unwrap_err(),
            SyncError::Store(_)
        ));
    }
}
