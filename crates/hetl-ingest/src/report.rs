//! Job report
//!
//! Aggregates what a job did into one JSON document. Building a report
//! performs no I/O apart from sampling host resources.

use crate::coordinator::IngestionResult;
use crate::estimator::EstimationResult;
use crate::sink::backup_existing;
use chrono::{DateTime, Utc};
use hetl_common::{EtlError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::{MemoryRefreshKind, System};
use tracing::{debug, info};
use uuid::Uuid;

pub const REPORT_FILE_NAME: &str = "job_report.json";

/// Final state of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    /// Stopped early; output written so far is valid
    Incomplete { reason: String },
    Failed { reason: String },
}

impl ReportStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ReportStatus::Completed => "completed",
            ReportStatus::Incomplete { .. } => "incomplete",
            ReportStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ReportStatus::Completed)
    }
}

/// Host snapshot taken when the report is built
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostResources {
    pub hostname: String,
    pub logical_cpus: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub used_memory_bytes: u64,
}

impl HostResources {
    pub fn sample() -> Self {
        let mut sys = System::new();
        sys.refresh_memory_specifics(MemoryRefreshKind::everything());

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let logical_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            hostname,
            logical_cpus,
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            used_memory_bytes: sys.used_memory(),
        }
    }
}

/// The job parameters that shaped the result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub inputs: Vec<PathBuf>,
    pub input_format: String,
    /// Layout in `name:type` form
    pub layout: String,
    pub byte_order: String,
    pub record_size: usize,
    pub header_bytes: u64,
    pub workers: usize,
    pub chunk_bytes: u64,
    pub sample_fraction: f64,
    pub sample_seed: u64,
    pub stratum_field: String,
    pub metrics: Vec<String>,
    pub output_csv: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_parquet: Option<PathBuf>,
    pub job_timeout_secs: u64,
    pub max_chunk_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportError {
    pub kind: String,
    pub message: String,
    /// False for warnings the job carried on past
    pub fatal: bool,
}

impl From<&EtlError> for ReportError {
    fn from(e: &EtlError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
            fatal: e.is_fatal(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub job_name: String,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub config: ConfigSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<IngestionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimation: Option<EstimationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimation_error: Option<String>,
    pub host: HostResources,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ReportError>,
}

impl JobReport {
    pub fn new(
        job_id: Uuid,
        job_name: impl Into<String>,
        config: ConfigSummary,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            job_name: job_name.into(),
            status: ReportStatus::Completed,
            started_at,
            finished_at: started_at,
            elapsed_secs: 0.0,
            config,
            input_checksum: None,
            ingestion: None,
            estimation: None,
            estimation_error: None,
            host: HostResources::sample(),
            errors: Vec::new(),
        }
    }

    /// Attach the ingestion result; each ignored tail becomes a warning
    pub fn with_ingestion(mut self, result: IngestionResult) -> Self {
        for tail in &result.truncated_tails {
            self.push_error(&EtlError::TruncatedTail {
                path: tail.path.clone(),
                bytes: tail.bytes,
            });
        }
        self.ingestion = Some(result);
        self
    }

    pub fn with_estimation(mut self, outcome: Result<EstimationResult>) -> Self {
        match outcome {
            Ok(result) => self.estimation = Some(result),
            Err(e) => {
                self.estimation_error = Some(e.to_string());
                self.errors.push(ReportError::from(&e));
            }
        }
        self
    }

    pub fn with_checksum(mut self, checksum: Option<String>) -> Self {
        self.input_checksum = checksum;
        self
    }

    pub fn push_error(&mut self, error: &EtlError) {
        self.errors.push(ReportError::from(error));
    }

    /// Stamp the end time and final status
    pub fn finish(mut self, status: ReportStatus) -> Self {
        self.finished_at = Utc::now();
        self.elapsed_secs = (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        self.status = status;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write `job_report.json` into `dir`, moving a previous report aside
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| EtlError::write(dir, e))?;
        let path = dir.join(REPORT_FILE_NAME);
        if let Some(backup) = backup_existing(&path)? {
            debug!(backup = %backup.display(), "Moved previous report aside");
        }

        let json = self.to_json()?;
        std::fs::write(&path, json).map_err(|e| EtlError::write(&path, e))?;
        info!(path = %path.display(), status = self.status.as_str(), "Job report written");
        Ok(path)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn summary() -> ConfigSummary {
        ConfigSummary {
            inputs: vec![PathBuf::from("data/sales.bin")],
            input_format: "binary".into(),
            layout: "id:u32, product:text(32)".into(),
            byte_order: "little".into(),
            record_size: 36,
            header_bytes: 0,
            workers: 2,
            chunk_bytes: 1024,
            sample_fraction: 0.005,
            sample_seed: 42,
            stratum_field: "product".into(),
            metrics: vec!["quantity".into()],
            output_csv: PathBuf::from("out.csv"),
            output_parquet: None,
            job_timeout_secs: 3600,
            max_chunk_retries: 1,
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(ReportStatus::Incomplete {
            reason: "timeout".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "incomplete");
        assert_eq!(json["reason"], "timeout");
        assert_eq!(
            serde_json::to_value(ReportStatus::Completed).unwrap()["state"],
            "completed"
        );
    }

    #[test]
    fn test_host_resources_sampled() {
        let host = HostResources::sample();
        assert!(host.logical_cpus >= 1);
        assert!(!host.hostname.is_empty());
    }

    #[test]
    fn test_estimation_error_is_recorded() {
        let report = JobReport::new(Uuid::nil(), "t", summary(), Utc::now())
            .with_estimation(Err(EtlError::Estimation("population changed".into())))
            .finish(ReportStatus::Completed);
        assert!(report.estimation.is_none());
        assert!(report.estimation_error.as_deref().unwrap().contains("population changed"));
        assert_eq!(report.errors[0].kind, "estimation");
        assert!(!report.errors[0].fatal);
    }

    #[test]
    fn test_job_error_is_fatal() {
        let mut report = JobReport::new(Uuid::nil(), "t", summary(), Utc::now());
        report.push_error(&EtlError::write("out.csv", std::io::Error::other("disk full")));
        let json = serde_json::to_value(report.finish(ReportStatus::Failed {
            reason: "disk full".into(),
        }))
        .unwrap();
        assert_eq!(json["errors"][0]["kind"], "io_write");
        assert_eq!(json["errors"][0]["fatal"], true);
    }

    #[test]
    fn test_write_backs_up_previous_report() {
        let dir = TempDir::new().unwrap();
        let first = JobReport::new(Uuid::new_v4(), "first", summary(), Utc::now())
            .finish(ReportStatus::Completed);
        let path = first.write_to(dir.path()).unwrap();
        assert_eq!(path, dir.path().join(REPORT_FILE_NAME));

        let second = JobReport::new(Uuid::new_v4(), "second", summary(), Utc::now()).finish(
            ReportStatus::Failed {
                reason: "disk full".into(),
            },
        );
        second.write_to(dir.path()).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["job_name"], "second");
        assert_eq!(written["status"]["state"], "failed");

        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".bak."))
            .count();
        assert_eq!(backups, 1);
    }
}
