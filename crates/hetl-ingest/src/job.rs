//! Job runner
//!
//! Runs one job end to end:
//! 1. Validate configuration (no I/O before this succeeds)
//! 2. Open the audit trail and record the job start
//! 3. Resolve input files and create the output sinks
//! 4. Ingest through the coordinator
//! 5. Estimate over the re-streamed source if ingestion completed
//! 6. Build and write the job report, then close the audit trail
//!
//! The job timeout and cancellation token bound every step that reads the
//! inputs, including the estimation and checksum passes after ingestion.

use crate::audit::{get_machine_id, AuditLogger, EventType, JsonlAuditLogger};
use crate::config::{InputFormat, JobConfig, ResolvedJob};
use crate::coordinator::{IngestionCoordinator, IngestionResult, SourceFormat};
use crate::estimator::{
    stratum_by_field, BinaryFileSource, ChainedSource, CsvFileSource, EstimationResult, Metric,
    RecordSource, StratifiedEstimator,
};
use crate::reader::TextChunkReader;
use crate::report::{ConfigSummary, JobReport, ReportStatus};
use crate::sink::{CsvSink, ParquetSink, RecordSink};
use chrono::Utc;
use hetl_common::checksum::{compute_checksum, ChecksumAlgorithm};
use hetl_common::{EtlError, Result};
use indicatif::ProgressBar;
use serde_json::json;
use std::future::Future;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const BINARY_EXTENSIONS: &[&str] = &["bin"];
const TEXT_EXTENSIONS: &[&str] = &["csv", "tsv", "txt"];

/// What a finished job produced
#[derive(Debug)]
pub struct JobOutcome {
    pub report: JobReport,
    /// Where the report was written, if writing succeeded
    pub report_path: Option<PathBuf>,
    /// Why the report could not be written
    pub report_error: Option<EtlError>,
    /// The error that stopped the job early, if any
    pub error: Option<EtlError>,
}

impl JobOutcome {
    /// Ingestion finished without a fatal error
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Wall-clock budget shared by ingestion and the passes after it
struct JobBudget {
    deadline: Instant,
    limit_secs: u64,
    /// Fires on job cancellation, or when a bounded pass runs out of time
    token: CancellationToken,
}

impl JobBudget {
    fn new(limit: Duration, parent: &CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + limit,
            limit_secs: limit.as_secs(),
            token: parent.child_token(),
        }
    }

    /// Await `pass` until the job deadline
    ///
    /// On expiry the token is cancelled so blocking work behind `pass`
    /// stops at its next chunk.
    async fn bound<T>(&self, records_written: u64, pass: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout_at(self.deadline, pass).await {
            Ok(Err(EtlError::Cancelled { .. })) => Err(EtlError::Cancelled { records_written }),
            Ok(outcome) => outcome,
            Err(_) => {
                self.token.cancel();
                warn!(limit_secs = self.limit_secs, "Job timeout reached after ingestion");
                Err(EtlError::Timeout {
                    limit_secs: self.limit_secs,
                    records_written,
                })
            }
        }
    }
}

pub struct JobRunner {
    config: JobConfig,
    job_id: Uuid,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
    audit: Option<Arc<dyn AuditLogger>>,
}

impl JobRunner {
    pub fn new(config: JobConfig) -> Self {
        Self {
            config,
            job_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            progress: None,
            audit: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Use `logger` instead of opening the configured audit log
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit = Some(logger);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Run the job
    ///
    /// Returns `Err` only when the job could not start: invalid
    /// configuration or an unusable audit log. Every later failure is
    /// carried in the returned [`JobOutcome`] together with a report.
    pub async fn run(self) -> Result<JobOutcome> {
        let started_at = Utc::now();
        let job = self.config.validate()?;
        let budget = JobBudget::new(job.ingest.job_timeout, &self.cancel);

        let audit = match self.audit.clone() {
            Some(logger) => logger,
            None => open_audit_log(&self.config.audit_log)?,
        };

        info!(
            job_id = %self.job_id,
            job_name = %self.config.job_name,
            input = %job.input.display(),
            format = job.format.as_str(),
            workers = job.ingest.worker_count,
            "Job started"
        );
        audit
            .record(
                EventType::JobStart,
                self.job_id,
                json!({
                    "job_name": self.config.job_name,
                    "input": job.input,
                    "format": job.format.as_str(),
                    "record_size": job.layout.record_size(),
                    "workers": job.ingest.worker_count,
                    "chunk_bytes": job.ingest.chunk_size,
                    "sample_fraction": self.config.sample_fraction,
                    "sample_seed": self.config.sample_seed,
                    "output_csv": job.output_csv,
                    "output_parquet": job.output_parquet,
                }),
            )
            .await;

        let mut inputs = Vec::new();
        let mut report_ingestion = None;
        let mut estimation: Option<Result<EstimationResult>> = None;

        let mut failure = match self.ingest(&job, &audit, &mut inputs).await {
            Err(e) => Some(e),
            Ok(result) => {
                let mut incomplete = result.ensure_complete().err();
                if incomplete.is_none() {
                    let pass = estimate(&job, &self.config, &inputs, budget.token.clone());
                    match budget.bound(result.records_ok, pass).await {
                        Err(e @ (EtlError::Timeout { .. } | EtlError::Cancelled { .. })) => {
                            warn!(job_id = %self.job_id, error = %e, "Estimation stopped");
                            audit
                                .record(
                                    EventType::EstimationFailed,
                                    self.job_id,
                                    json!({"error": e.to_string()}),
                                )
                                .await;
                            incomplete = Some(e);
                        }
                        outcome => {
                            match &outcome {
                                Ok(est) => {
                                    audit
                                        .record(
                                            EventType::EstimationComplete,
                                            self.job_id,
                                            json!({
                                                "status": est.status,
                                                "population": est.population,
                                                "sample_size": est.sample_size,
                                                "sample_fraction": est.sample_fraction,
                                            }),
                                        )
                                        .await
                                }
                                Err(e) => {
                                    warn!(job_id = %self.job_id, error = %e, "Estimation failed");
                                    audit
                                        .record(
                                            EventType::EstimationFailed,
                                            self.job_id,
                                            json!({"error": e.to_string()}),
                                        )
                                        .await
                                }
                            }
                            estimation = Some(outcome);
                        }
                    }
                }
                report_ingestion = Some(result);
                incomplete
            }
        };

        let checksum = if self.config.checksum_input && !inputs.is_empty() && !budget.token.is_cancelled() {
            let records = report_ingestion.as_ref().map(|r| r.records_ok).unwrap_or(0);
            let pass = checksum_inputs(inputs.clone(), budget.token.clone());
            match budget.bound(records, pass).await {
                Ok(digest) => Some(digest),
                Err(e @ (EtlError::Timeout { .. } | EtlError::Cancelled { .. })) if failure.is_none() => {
                    warn!(job_id = %self.job_id, error = %e, "Input checksum stopped");
                    failure = Some(e);
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Input checksum failed");
                    None
                }
            }
        } else {
            None
        };

        let mut report = JobReport::new(
            self.job_id,
            self.config.job_name.clone(),
            config_summary(&self.config, &job, &inputs),
            started_at,
        )
        .with_checksum(checksum);
        if let Some(result) = report_ingestion {
            report = report.with_ingestion(result);
        }
        if let Some(outcome) = estimation {
            report = report.with_estimation(outcome);
        }

        let status = match &failure {
            None => ReportStatus::Completed,
            Some(e @ (EtlError::Timeout { .. } | EtlError::Cancelled { .. })) => {
                ReportStatus::Incomplete {
                    reason: e.to_string(),
                }
            }
            Some(e) => ReportStatus::Failed {
                reason: e.to_string(),
            },
        };
        if let Some(e) = &failure {
            report.push_error(e);
        }
        let report = report.finish(status);

        let (report_path, report_error) = match report.write_to(&self.config.report_dir) {
            Ok(path) => {
                audit
                    .record(EventType::ReportWritten, self.job_id, json!({"path": path}))
                    .await;
                (Some(path), None)
            }
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Failed to write job report");
                audit
                    .record(
                        EventType::ReportFailed,
                        self.job_id,
                        json!({"error": e.to_string()}),
                    )
                    .await;
                (None, Some(e))
            }
        };

        let final_event = match report.status {
            ReportStatus::Completed => EventType::JobComplete,
            ReportStatus::Incomplete { .. } => EventType::JobIncomplete,
            ReportStatus::Failed { .. } => EventType::JobFailed,
        };
        audit
            .record(
                final_event,
                self.job_id,
                json!({
                    "status": report.status,
                    "elapsed_secs": report.elapsed_secs,
                    "records_ok": report.ingestion.as_ref().map(|r| r.records_ok),
                    "records_rejected": report.ingestion.as_ref().map(|r| r.records_rejected),
                }),
            )
            .await;
        if let Err(e) = audit.flush().await {
            warn!(error = %e, "Failed to flush audit log");
        }

        match &failure {
            None => info!(job_id = %self.job_id, elapsed_secs = report.elapsed_secs, "Job completed"),
            Some(e) => error!(job_id = %self.job_id, error = %e, "Job did not complete"),
        }

        Ok(JobOutcome {
            report,
            report_path,
            report_error,
            error: failure,
        })
    }

    async fn ingest(
        &self,
        job: &ResolvedJob,
        audit: &Arc<dyn AuditLogger>,
        inputs: &mut Vec<PathBuf>,
    ) -> Result<IngestionResult> {
        *inputs = resolve_inputs(&job.input, job.format)?;

        let mut sinks: Vec<Box<dyn RecordSink>> = Vec::new();
        sinks.push(Box::new(CsvSink::create(
            &job.output_csv,
            Arc::clone(&job.layout),
            job.delimiter,
        )?));
        if let Some(parquet) = &job.output_parquet {
            sinks.push(Box::new(ParquetSink::create(parquet, Arc::clone(&job.layout))?));
        }
        for sink in &sinks {
            if let Some(backup) = sink.backup() {
                info!(path = %sink.path().display(), backup = %backup.display(), "Existing output moved aside");
                audit
                    .record(
                        EventType::OutputBackup,
                        self.job_id,
                        json!({"path": sink.path(), "backup": backup}),
                    )
                    .await;
            }
        }

        let mut coordinator = IngestionCoordinator::new(job.ingest.clone(), Arc::clone(audit))
            .with_job_id(self.job_id)
            .with_cancellation(self.cancel.clone());
        if let Some(pb) = &self.progress {
            coordinator = coordinator.with_progress(pb.clone());
        }

        let result = coordinator
            .ingest(inputs, Arc::clone(&job.layout), job.format, sinks)
            .await;
        if let Some(pb) = &self.progress {
            pb.finish_and_clear();
        }
        result
    }
}

/// Open the JSON-lines audit log, keeping the machine id beside it
pub fn open_audit_log(path: &Path) -> Result<Arc<dyn AuditLogger>> {
    let state_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let machine_id = get_machine_id(state_dir)?;
    Ok(Arc::new(JsonlAuditLogger::open(path, machine_id)?))
}

/// Expand a directory input into its data files, sorted by name
pub fn resolve_inputs(input: &Path, format: SourceFormat) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(input).map_err(|e| EtlError::read(input, e))?;
    if !metadata.is_dir() {
        return Ok(vec![input.to_path_buf()]);
    }

    let extensions = match format {
        SourceFormat::Binary => BINARY_EXTENSIONS,
        SourceFormat::Csv { .. } => TEXT_EXTENSIONS,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(input).map_err(|e| EtlError::read(input, e))? {
        let path = entry.map_err(|e| EtlError::read(input, e))?.path();
        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(EtlError::read(
            input,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no *.{} files in directory", extensions.join(", *.")),
            ),
        ));
    }
    Ok(files)
}

async fn estimate(
    job: &ResolvedJob,
    config: &JobConfig,
    inputs: &[PathBuf],
    cancel: CancellationToken,
) -> Result<EstimationResult> {
    let layout = Arc::clone(&job.layout);
    let format = job.format;
    let chunk_size = job.ingest.chunk_size;
    let base_offset = job.ingest.base_offset;
    let inputs = inputs.to_vec();
    let stratum_index = job.stratum_index;
    let resolved = job.metrics.clone();
    let estimator = StratifiedEstimator::new(config.sample_fraction)
        .with_seed(config.sample_seed)
        .with_cancellation(cancel);

    tokio::task::spawn_blocking(move || {
        let sources: Vec<Box<dyn RecordSource + Send + Sync>> = inputs
            .into_iter()
            .map(|path| -> Box<dyn RecordSource + Send + Sync> {
                match format {
                    SourceFormat::Binary => Box::new(BinaryFileSource::new(
                        path,
                        Arc::clone(&layout),
                        chunk_size,
                        base_offset,
                    )),
                    SourceFormat::Csv { delimiter } => Box::new(CsvFileSource::new(
                        path,
                        Arc::clone(&layout),
                        delimiter,
                        TextChunkReader::rows_for_budget(chunk_size, layout.record_size()),
                    )),
                }
            })
            .collect();
        let metrics: Vec<Metric> = resolved
            .iter()
            .map(|m| Metric::field(m.name.clone(), m.field_index, m.scale))
            .collect();

        estimator.estimate(
            &ChainedSource::new(sources),
            stratum_by_field(stratum_index),
            &metrics,
        )
    })
    .await
    .map_err(|e| EtlError::Estimation(format!("estimation task failed: {e}")))?
}

/// Reader that fails once its token fires
struct CancellableRead<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> Read for CancellableRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(std::io::Error::other("checksum cancelled"));
        }
        self.inner.read(buf)
    }
}

/// SHA-256 over the inputs' bytes, concatenated in ingestion order
async fn checksum_inputs(inputs: Vec<PathBuf>, cancel: CancellationToken) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        let mut chained: Box<dyn Read> = Box::new(std::io::empty());
        for path in &inputs {
            let file = std::fs::File::open(path).map_err(|e| EtlError::read(path, e))?;
            chained = Box::new(chained.chain(file));
        }
        let mut reader = CancellableRead {
            inner: chained,
            cancel: cancel.clone(),
        };
        compute_checksum(&mut reader, ChecksumAlgorithm::Sha256).map_err(|e| {
            if cancel.is_cancelled() {
                EtlError::Cancelled { records_written: 0 }
            } else {
                e
            }
        })
    })
    .await
    .map_err(|e| EtlError::Io(std::io::Error::other(e)))?
}

fn config_summary(config: &JobConfig, job: &ResolvedJob, inputs: &[PathBuf]) -> ConfigSummary {
    let layout = job
        .layout
        .fields()
        .iter()
        .map(|f| format!("{}:{}", f.name, f.field_type))
        .collect::<Vec<_>>()
        .join(", ");
    let input_format = match config.effective_format() {
        InputFormat::Csv => "csv",
        _ => "binary",
    };

    ConfigSummary {
        inputs: if inputs.is_empty() {
            vec![job.input.clone()]
        } else {
            inputs.to_vec()
        },
        input_format: input_format.to_string(),
        layout,
        byte_order: job.layout.byte_order().to_string(),
        record_size: job.layout.record_size(),
        header_bytes: job.ingest.base_offset,
        workers: job.ingest.worker_count,
        chunk_bytes: job.ingest.chunk_size,
        sample_fraction: config.sample_fraction,
        sample_seed: config.sample_seed,
        stratum_field: config.stratum_field.clone(),
        metrics: job.metrics.iter().map(|m| m.name.clone()).collect(),
        output_csv: job.output_csv.clone(),
        output_parquet: job.output_parquet.clone(),
        job_timeout_secs: job.ingest.job_timeout.as_secs(),
        max_chunk_retries: job.ingest.max_chunk_retries,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::codec::{FieldValue, Record};
    use crate::estimator::ScanStats;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_resolve_inputs_sorts_directory() {
        let dir = TempDir::new().unwrap();
        for name in ["b.bin", "a.bin", "notes.md", "c.BIN"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = resolve_inputs(dir.path(), SourceFormat::Binary).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.bin", "b.bin", "c.BIN"]);
    }

    #[test]
    fn test_resolve_inputs_errors() {
        let dir = TempDir::new().unwrap();
        let err = resolve_inputs(dir.path(), SourceFormat::Csv { delimiter: b',' }).unwrap_err();
        assert_eq!(err.kind(), "io_read");

        let err = resolve_inputs(&dir.path().join("missing.bin"), SourceFormat::Binary).unwrap_err();
        assert_eq!(err.kind(), "io_read");
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_io() {
        let dir = TempDir::new().unwrap();
        let config = JobConfig {
            input: Some(dir.path().join("in.bin")),
            output_csv: Some(dir.path().join("out.csv")),
            audit_log: dir.path().join("state/audit.jsonl"),
            workers: 0,
            ..Default::default()
        };
        let err = JobRunner::new(config).run().await.unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(!dir.path().join("state").exists());
    }

    #[tokio::test]
    async fn test_missing_input_yields_failed_report() {
        let dir = TempDir::new().unwrap();
        let config = JobConfig {
            input: Some(dir.path().join("absent.bin")),
            output_csv: Some(dir.path().join("out.csv")),
            audit_log: dir.path().join("audit.jsonl"),
            report_dir: dir.path().join("report"),
            ..Default::default()
        };
        let outcome = JobRunner::new(config).run().await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.report.status.as_str(), "failed");
        assert!(outcome.report_path.unwrap().exists());
        assert!(crate::audit::verify_chain(dir.path().join("audit.jsonl"))
            .unwrap()
            .valid);
    }

    #[tokio::test]
    async fn test_checksum_concatenates_inputs() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, b"hello ").unwrap();
        std::fs::write(&b, b"world").unwrap();
        let digest = checksum_inputs(vec![a.clone(), b.clone()], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(digest, hetl_common::checksum::sha256_hex(b"hello world"));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = checksum_inputs(vec![a, b], cancelled).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }

    /// Sleeps before every record and stops when cancelled
    struct SlowSource {
        records: Vec<Record>,
        delay: Duration,
        visited: Arc<AtomicU64>,
    }

    impl RecordSource for SlowSource {
        fn scan(&self, cancel: &CancellationToken, visit: &mut dyn FnMut(&Record)) -> Result<ScanStats> {
            let mut stats = ScanStats::default();
            for record in &self.records {
                if cancel.is_cancelled() {
                    return Err(EtlError::Cancelled {
                        records_written: stats.records,
                    });
                }
                std::thread::sleep(self.delay);
                visit(record);
                self.visited.fetch_add(1, Ordering::SeqCst);
                stats.records += 1;
            }
            Ok(stats)
        }
    }

    fn slow_estimation(
        token: CancellationToken,
        visited: Arc<AtomicU64>,
    ) -> impl Future<Output = Result<EstimationResult>> {
        let source = SlowSource {
            records: (0..1000u64)
                .map(|i| Record::new(vec![FieldValue::Text("a".into()), FieldValue::Unsigned(i)]))
                .collect(),
            delay: Duration::from_millis(5),
            visited,
        };
        let task = tokio::task::spawn_blocking(move || {
            StratifiedEstimator::new(0.1)
                .with_cancellation(token)
                .estimate(&source, stratum_by_field(0), &[Metric::field("v", 1, 1.0)])
        });
        async move {
            task.await
                .map_err(|e| EtlError::Estimation(e.to_string()))
                .and_then(|outcome| outcome)
        }
    }

    #[tokio::test]
    async fn test_estimation_stops_at_job_deadline() {
        let budget = JobBudget::new(Duration::from_millis(100), &CancellationToken::new());
        let visited = Arc::new(AtomicU64::new(0));
        let started = std::time::Instant::now();

        let err = budget
            .bound(7, slow_estimation(budget.token.clone(), Arc::clone(&visited)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("after 7 records"));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(budget.token.is_cancelled());

        // The blocking scan notices the token and stops reading
        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = visited.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(visited.load(Ordering::SeqCst), settled);
        assert!(settled < 1000);
    }

    #[tokio::test]
    async fn test_estimation_stops_on_job_cancellation() {
        let job_token = CancellationToken::new();
        let budget = JobBudget::new(Duration::from_secs(60), &job_token);
        let visited = Arc::new(AtomicU64::new(0));

        let trigger = job_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = budget
            .bound(12, slow_estimation(budget.token.clone(), Arc::clone(&visited)))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Cancelled { records_written: 12 }));
        assert!(visited.load(Ordering::SeqCst) < 1000);
    }
}
