//! NVD CVE API 2.0 synchronization engine
//!
//! - [`planner`] decides which partitions a run covers
//! - [`fetcher`] performs rate-limited, retried HTTP requests
//! - [`reader`] pages through one partition
//! - [`normalizer`] turns raw items into canonical records
//! - [`manager`] composes the above into a lazy run

pub mod fetcher;
pub mod manager;
pub mod models;
pub mod normalizer;
pub mod planner;
pub mod reader;

pub use fetcher::{HttpFetcher, PageFetcher};
pub use manager::{Manager, RunOptions, RunState, SyncRun};
pub use models::{
    CanonicalRecord, PartitionKind, PartitionSpec, RawItem, RawPage, RunOutcome, RunStats,
};
pub use normalizer::RecordNormalizer;
