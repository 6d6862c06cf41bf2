//! Error types for HETL jobs
//!
//! The variants mirror how a failure is handled by a job: per-record and
//! per-chunk failures are counted by the ingestion layer and never abort a
//! job, while configuration, timeout, total read failure and sink write
//! failure abort it and are returned to the caller.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for HETL operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for HETL
#[derive(Error, Debug)]
pub enum EtlError {
    /// Invalid job parameters. Raised before any I/O is performed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading the source failed.
    #[error("Failed to read '{path}': {source}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing an output artifact failed.
    #[error("Failed to write '{path}': {source}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single record could not be decoded. Recovered locally by skipping it.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// A record value does not fit the layout it is encoded against.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Trailing bytes that do not form a whole record. Reported as a warning.
    #[error("Truncated tail: {bytes} trailing bytes in '{path}' do not form a whole record")]
    TruncatedTail { path: PathBuf, bytes: u64 },

    /// The job exceeded its wall-clock ceiling. Partial output is retained.
    #[error("Job exceeded its wall-clock limit of {limit_secs}s after {records_written} records")]
    Timeout {
        limit_secs: u64,
        records_written: u64,
    },

    /// The job was cancelled. Already-written output remains valid.
    #[error("Job cancelled after {records_written} records")]
    Cancelled { records_written: u64 },

    /// Degenerate or unreadable estimation input.
    #[error("Estimation error: {0}")]
    Estimation(String),

    /// Audit trail operation failed
    #[error("Audit trail error: {0}")]
    Audit(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EtlError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a source read failure with the path it happened on
    pub fn read(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::IoRead {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Wrap a sink write failure with the path it happened on
    pub fn write(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::IoWrite {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a malformed record error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRecord(msg.into())
    }

    /// Create an audit error
    pub fn audit(msg: impl Into<String>) -> Self {
        Self::Audit(msg.into())
    }

    /// Short, stable name of the error class, used in reports and audit events
    pub fn kind(&self) -> &'static str {
        match self {
            EtlError::Config(_) => "configuration",
            EtlError::IoRead { .. } => "io_read",
            EtlError::IoWrite { .. } => "io_write",
            EtlError::MalformedRecord(_) => "malformed_record",
            EtlError::InvalidRecord(_) => "invalid_record",
            EtlError::TruncatedTail { .. } => "truncated_tail",
            EtlError::Timeout { .. } => "timeout",
            EtlError::Cancelled { .. } => "cancelled",
            EtlError::Estimation(_) => "estimation",
            EtlError::Audit(_) => "audit",
            EtlError::Serialization(_) => "serialization",
            EtlError::Io(_) => "io",
        }
    }

    /// Whether this error aborts a whole job rather than being counted
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EtlError::MalformedRecord(_)
                | EtlError::TruncatedTail { .. }
                | EtlError::Estimation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors_are_not_fatal() {
        assert!(!EtlError::malformed("bad utf-8").is_fatal());
        assert!(!EtlError::Estimation("empty population".into()).is_fatal());
        assert!(!EtlError::TruncatedTail {
            path: PathBuf::from("a.bin"),
            bytes: 30
        }
        .is_fatal());
    }

    #[test]
    fn test_job_errors_are_fatal() {
        assert!(EtlError::config("workers must be >= 1").is_fatal());
        assert!(EtlError::Timeout {
            limit_secs: 3600,
            records_written: 10
        }
        .is_fatal());
        let err = EtlError::write("out.csv", std::io::Error::other("disk full"));
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "io_write");
        assert!(err.to_string().contains("out.csv"));
    }
}
