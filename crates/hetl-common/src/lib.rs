//! HETL Common Library
//!
//! Shared error handling, logging and checksum utilities for the HETL workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the job-level error taxonomy ([`EtlError`]) and result alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: streaming file digests for job reports
//!
//! # Example
//!
//! ```no_run
//! use hetl_common::{Result, EtlError};
//! use hetl_common::checksum::{compute_file_checksum, ChecksumAlgorithm};
//!
//! fn fingerprint(path: &str) -> Result<()> {
//!     let digest = compute_file_checksum(path, ChecksumAlgorithm::Sha256)?;
//!     println!("{path}: {digest}");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EtlError, Result};
