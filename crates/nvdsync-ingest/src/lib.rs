//! nvdsync ingest library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Incremental synchronization of the NVD CVE feed (API 2.0) into a local
//! result store.
//!
//! # Overview
//!
//! A run is planned from the last successful watermark: the first run walks
//! publication years oldest first, later runs fetch a single modified-since
//! window. Pages are fetched under a shared rate limit with retries, each item
//! is normalized and validated, and surviving `(identifier, record)` pairs are
//! yielded lazily. Identifiers are yielded at most once per run.
//!
//! # Example
//!
//! ```no_run
//! use nvdsync_ingest::{provider::NvdProvider, SyncConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(SyncConfig::builder().start_year(2020).build()?);
//!     let provider = NvdProvider::new("./data/nvd", config)?;
//!     let state = provider.run(true, false, CancellationToken::new()).await?;
//!     println!("wrote {} records", state.count);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod nvd;
pub mod provider;
pub mod schema;
pub mod settings;
pub mod store;

pub use config::{ApiKey, RateLimitPolicy, RetryPolicy, SyncConfig};
pub use error::{Result, SyncError};
pub use nvd::{CanonicalRecord, Manager, RunOptions, RunOutcome, RunState, SyncRun};
pub use schema::{NvdSchema, SchemaValidator};
pub use store::{FsResultStore, MemoryResultStore, ResultStore};
