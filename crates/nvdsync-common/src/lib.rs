//! nvdsync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the nvdsync workspace members:
//!
//! - **Error Handling**: [`CommonError`] and its [`Result`] alias
//! - **Checksums**: content digests used to make result writes idempotent
//! - **Logging**: `tracing` subscriber setup for binaries
//!
//! # Example
//!
//! ```no_run
//! use nvdsync_common::checksum;
//!
//! let digest = checksum::sha256_hex(br#"{"cve":{"id":"CVE-2002-0001"}}"#);
//! assert_eq!(digest.len(), 64);
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
