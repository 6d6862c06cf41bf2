//! Parallel ingestion coordinator
//!
//! Coordinates one ingestion run:
//! 1. Enumerate record-aligned chunks (or row batches for text input)
//! 2. Load and decode at most `worker_count` chunks at a time on the
//!    blocking pool, retrying a failed chunk before giving up on it
//! 3. Hand decoded batches to a single writer task that owns every sink
//!
//! Records keep their order inside a chunk; chunks reach the sinks in
//! completion order.

use crate::audit::{AuditLogger, EventType};
use crate::chunk::Chunk;
use crate::codec::Record;
use crate::layout::RecordLayout;
use crate::parser::{BinaryChunkParser, ChunkParser, ChunkPayload, CsvRowParser, ParsedChunk};
use crate::reader::{StreamReader, TextChunkReader};
use crate::sink::RecordSink;
use csv::ByteRecord;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use hetl_common::{EtlError, Result};
use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default chunk size: 64 MiB
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Default job wall-clock limit: 1 hour
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default time in-flight chunks get to finish after a timeout
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// One less than the number of logical CPUs, at least one
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

/// Ingestion tuning
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub worker_count: usize,
    /// Desired chunk size in bytes
    pub chunk_size: u64,
    /// Header bytes before the first record of every binary input
    pub base_offset: u64,
    /// Retries for a chunk whose read or decode failed
    pub max_chunk_retries: u32,
    pub job_timeout: Duration,
    pub drain_grace: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            base_offset: 0,
            max_chunk_retries: 1,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count < 1 {
            return Err(EtlError::config("worker_count must be at least 1"));
        }
        if self.chunk_size < 1 {
            return Err(EtlError::config("chunk_size must be at least 1 byte"));
        }
        if self.job_timeout.is_zero() {
            return Err(EtlError::config("job timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// How input files are decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Binary,
    Csv { delimiter: u8 },
}

impl SourceFormat {
    pub fn as_str(&self) -> &str {
        match self {
            SourceFormat::Binary => "binary",
            SourceFormat::Csv { .. } => "csv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Completed,
    Cancelled,
    TimedOut,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            IngestionStatus::Completed => "completed",
            IngestionStatus::Cancelled => "cancelled",
            IngestionStatus::TimedOut => "timed_out",
        }
    }
}

/// Trailing bytes of an input that were not ingested
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TailWarning {
    pub path: PathBuf,
    pub offset: u64,
    pub bytes: u64,
}

/// A sink's file after the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// Outcome of an ingestion run
#[derive(Debug, Clone, Serialize)]
pub struct IngestionResult {
    pub job_id: Uuid,
    pub status: IngestionStatus,
    pub files: Vec<PathBuf>,
    /// Records durably appended to the sinks
    pub records_ok: u64,
    pub records_rejected: u64,
    pub bytes_processed: u64,
    pub chunks_total: u64,
    pub chunks_ok: u64,
    pub chunks_failed: u64,
    pub chunk_retries: u64,
    pub truncated_tails: Vec<TailWarning>,
    pub peak_inflight_bytes: u64,
    pub worker_count: usize,
    pub chunk_size: u64,
    pub timeout_secs: u64,
    pub elapsed_secs: f64,
    pub outputs: Vec<OutputFile>,
}

impl IngestionResult {
    pub fn is_complete(&self) -> bool {
        self.status == IngestionStatus::Completed
    }

    /// Turn an incomplete run into the matching error
    pub fn ensure_complete(&self) -> Result<()> {
        match self.status {
            IngestionStatus::Completed => Ok(()),
            IngestionStatus::TimedOut => Err(EtlError::Timeout {
                limit_secs: self.timeout_secs,
                records_written: self.records_ok,
            }),
            IngestionStatus::Cancelled => Err(EtlError::Cancelled {
                records_written: self.records_ok,
            }),
        }
    }

    pub fn tail_bytes_ignored(&self) -> u64 {
        self.truncated_tails.iter().map(|t| t.bytes).sum()
    }
}

/// Tracks bytes of chunk data held between load and write
#[derive(Debug, Default)]
pub struct MemoryGauge {
    current: AtomicU64,
    peak: AtomicU64,
}

impl MemoryGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Account for `bytes` until the returned guard is dropped
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> GaugeReservation {
        let now = self.current.fetch_add(bytes, Ordering::SeqCst) + bytes;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeReservation {
            gauge: Arc::clone(self),
            bytes,
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct GaugeReservation {
    gauge: Arc<MemoryGauge>,
    bytes: u64,
}

impl Drop for GaugeReservation {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

#[derive(Clone)]
enum WorkUnit {
    Range {
        reader: Arc<StreamReader>,
        chunk: Chunk,
    },
    Rows {
        chunk: Chunk,
        rows: Arc<Vec<ByteRecord>>,
    },
}

impl WorkUnit {
    fn chunk(&self) -> Chunk {
        match self {
            WorkUnit::Range { chunk, .. } | WorkUnit::Rows { chunk, .. } => *chunk,
        }
    }

    fn load(&self) -> Result<ChunkPayload> {
        match self {
            WorkUnit::Range { reader, chunk } => Ok(ChunkPayload::Bytes(reader.read_chunk(chunk)?)),
            WorkUnit::Rows { rows, .. } => Ok(ChunkPayload::Rows(Arc::clone(rows))),
        }
    }
}

enum UnitOutcome {
    Parsed {
        parsed: ParsedChunk,
        reservation: GaugeReservation,
        retries: u32,
        last_error: Option<String>,
    },
    Failed {
        chunk: Chunk,
        attempts: u32,
        error: String,
    },
    /// The unit stream itself failed; nothing past this point can be read
    Source(EtlError),
}

struct WriteBatch {
    records: Vec<Record>,
    _reservation: GaugeReservation,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    chunks_total: u64,
    chunks_ok: u64,
    chunks_failed: u64,
    retries: u64,
    rejected: u64,
    decoded: u64,
    bytes: u64,
}

enum Planner {
    Binary {
        record_size: usize,
        parser: Arc<dyn ChunkParser>,
    },
    Csv {
        layout: Arc<RecordLayout>,
        delimiter: u8,
    },
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Per-run state shared by the files of one ingestion
struct RunState {
    tx: mpsc::Sender<WriteBatch>,
    gauge: Arc<MemoryGauge>,
    cancel: CancellationToken,
    hard_deadline: Instant,
    tally: Tally,
    tails: Vec<TailWarning>,
    files: Vec<PathBuf>,
    abandoned: bool,
    writer_closed: bool,
}

/// Runs parallel decode with a single writer
pub struct IngestionCoordinator {
    config: IngestConfig,
    audit: Arc<dyn AuditLogger>,
    job_id: Uuid,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
}

impl IngestionCoordinator {
    pub fn new(config: IngestConfig, audit: Arc<dyn AuditLogger>) -> Self {
        Self {
            config,
            audit,
            job_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = job_id;
        self
    }

    /// Use an externally owned token, e.g. one wired to Ctrl-C
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingest `inputs` in order into `sinks`
    pub async fn ingest(
        &self,
        inputs: &[PathBuf],
        layout: Arc<RecordLayout>,
        format: SourceFormat,
        sinks: Vec<Box<dyn RecordSink>>,
    ) -> Result<IngestionResult> {
        let planner = match format {
            SourceFormat::Binary => Planner::Binary {
                record_size: layout.record_size(),
                parser: Arc::new(BinaryChunkParser::new(layout)),
            },
            SourceFormat::Csv { delimiter } => Planner::Csv { layout, delimiter },
        };
        self.run(inputs, planner, sinks).await
    }

    /// Ingest binary `inputs` with a caller-supplied chunk parser
    pub async fn ingest_with_parser(
        &self,
        inputs: &[PathBuf],
        record_size: usize,
        parser: Arc<dyn ChunkParser>,
        sinks: Vec<Box<dyn RecordSink>>,
    ) -> Result<IngestionResult> {
        self.run(inputs, Planner::Binary { record_size, parser }, sinks)
            .await
    }

    async fn run(
        &self,
        inputs: &[PathBuf],
        planner: Planner,
        sinks: Vec<Box<dyn RecordSink>>,
    ) -> Result<IngestionResult> {
        self.config.validate()?;
        let started = Instant::now();
        let worker_count = self.config.worker_count;

        info!(
            job_id = %self.job_id,
            files = inputs.len(),
            worker_count,
            chunk_size = self.config.chunk_size,
            "Starting ingestion"
        );

        let job_cancel = self.cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let token = job_cancel.clone();
            let flag = Arc::clone(&timed_out);
            let limit = self.config.job_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        flag.store(true, Ordering::SeqCst);
                        warn!(limit_secs = limit.as_secs_f64(), "Job timeout reached, no new chunks will be dispatched");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        };

        let outputs_meta: Vec<(PathBuf, Option<PathBuf>)> = sinks
            .iter()
            .map(|s| (s.path().to_path_buf(), s.backup().map(Path::to_path_buf)))
            .collect();
        let written = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel::<WriteBatch>(worker_count);
        let writer = {
            let written = Arc::clone(&written);
            tokio::task::spawn_blocking(move || run_writer(sinks, rx, written))
        };

        let mut state = RunState {
            tx,
            gauge: MemoryGauge::new(),
            cancel: job_cancel.clone(),
            hard_deadline: started + self.config.job_timeout + self.config.drain_grace,
            tally: Tally::default(),
            tails: Vec::new(),
            files: Vec::new(),
            abandoned: false,
            writer_closed: false,
        };

        let mut fatal: Option<EtlError> = None;
        for path in inputs {
            if job_cancel.is_cancelled() {
                break;
            }
            match self.ingest_file(path, &planner, &mut state).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break,
                Err(e) => {
                    error!(job_id = %self.job_id, path = %path.display(), error = %e, "Ingestion aborted");
                    fatal = Some(e);
                    break;
                }
            }
        }

        let RunState {
            tx,
            gauge,
            tally,
            tails,
            files,
            mut abandoned,
            writer_closed,
            ..
        } = state;
        drop(tx);
        watchdog.abort();

        let writer_result =
            match tokio::time::timeout(self.config.drain_grace, writer).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(EtlError::write(
                    outputs_meta.first().map(|(p, _)| p.as_path()).unwrap_or(Path::new("")),
                    std::io::Error::other(format!("writer task failed: {join_error}")),
                )),
                Err(_) => {
                    error!(job_id = %self.job_id, "Writer did not drain within the grace period");
                    abandoned = true;
                    Ok(Vec::new())
                }
            };

        let per_sink = match writer_result {
            Ok(counts) => counts,
            Err(e) => {
                error!(job_id = %self.job_id, error = %e, "Sink write failed");
                return Err(e);
            }
        };
        if writer_closed && fatal.is_none() {
            fatal = Some(EtlError::write(
                outputs_meta.first().map(|(p, _)| p.as_path()).unwrap_or(Path::new("")),
                std::io::Error::other("writer stopped accepting batches"),
            ));
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let status = if timed_out.load(Ordering::SeqCst) || abandoned {
            IngestionStatus::TimedOut
        } else if self.cancel.is_cancelled() {
            IngestionStatus::Cancelled
        } else {
            IngestionStatus::Completed
        };

        let outputs = outputs_meta
            .into_iter()
            .enumerate()
            .map(|(i, (path, backup))| OutputFile {
                path,
                records: per_sink.get(i).copied().unwrap_or(0),
                backup,
            })
            .collect();

        let result = IngestionResult {
            job_id: self.job_id,
            status,
            files,
            records_ok: written.load(Ordering::SeqCst),
            records_rejected: tally.rejected,
            bytes_processed: tally.bytes,
            chunks_total: tally.chunks_total,
            chunks_ok: tally.chunks_ok,
            chunks_failed: tally.chunks_failed,
            chunk_retries: tally.retries,
            truncated_tails: tails,
            peak_inflight_bytes: gauge.peak(),
            worker_count,
            chunk_size: self.config.chunk_size,
            timeout_secs: self.config.job_timeout.as_secs(),
            elapsed_secs: started.elapsed().as_secs_f64(),
            outputs,
        };

        info!(
            job_id = %self.job_id,
            status = result.status.as_str(),
            records_ok = result.records_ok,
            records_rejected = result.records_rejected,
            chunks_failed = result.chunks_failed,
            elapsed_secs = result.elapsed_secs,
            "Ingestion finished"
        );

        Ok(result)
    }

    async fn ingest_file(&self, path: &Path, planner: &Planner, state: &mut RunState) -> Result<Flow> {
        let before = state.tally;

        let (units, parser, planned): (BoxStream<'static, Result<WorkUnit>>, Arc<dyn ChunkParser>, Option<usize>) =
            match planner {
                Planner::Binary { record_size, parser } => {
                    let reader = Arc::new(StreamReader::open(
                        path,
                        *record_size,
                        self.config.chunk_size,
                        self.config.base_offset,
                    )?);
                    let plan = *reader.plan();

                    if let Some(tail) = plan.truncated_tail() {
                        warn!(
                            path = %path.display(),
                            offset = tail.offset,
                            bytes = tail.bytes,
                            "Input ends with a partial record; trailing bytes are ignored"
                        );
                        state.tails.push(TailWarning {
                            path: path.to_path_buf(),
                            offset: tail.offset,
                            bytes: tail.bytes,
                        });
                        self.audit
                            .record(
                                EventType::TruncatedTail,
                                self.job_id,
                                json!({"path": path, "offset": tail.offset, "bytes": tail.bytes}),
                            )
                            .await;
                    }

                    let units = stream::iter(plan.chunks().map(move |chunk| {
                        Ok(WorkUnit::Range {
                            reader: Arc::clone(&reader),
                            chunk,
                        })
                    }))
                    .boxed();
                    (units, Arc::clone(parser), Some(plan.len()))
                }
                Planner::Csv { layout, delimiter } => {
                    let rows = TextChunkReader::rows_for_budget(self.config.chunk_size, layout.record_size());
                    let reader = TextChunkReader::open(path, *delimiter, rows)?;
                    let parser: Arc<dyn ChunkParser> =
                        Arc::new(CsvRowParser::new(Arc::clone(layout), reader.headers())?);
                    (self.spawn_text_producer(reader, state.cancel.clone()), parser, None)
                }
            };

        info!(
            job_id = %self.job_id,
            path = %path.display(),
            format = parser.source_kind(),
            chunks = ?planned,
            "Ingesting file"
        );
        self.audit
            .record(
                EventType::FileStart,
                self.job_id,
                json!({"path": path, "format": parser.source_kind(), "chunks": planned}),
            )
            .await;
        if let (Some(pb), Some(n)) = (&self.progress, planned) {
            pb.inc_length(n as u64);
        }
        state.files.push(path.to_path_buf());

        let cancel = state.cancel.clone();
        let gauge = Arc::clone(&state.gauge);
        let max_retries = self.config.max_chunk_retries;
        let mut outcomes = units
            .take_while(move |_| future::ready(!cancel.is_cancelled()))
            .map(move |unit| process_unit(unit, Arc::clone(&parser), Arc::clone(&gauge), max_retries))
            .buffer_unordered(self.config.worker_count);

        let mut flow = Flow::Continue;
        let mut last_failure: Option<String> = None;
        loop {
            let outcome = tokio::select! {
                biased;
                next = outcomes.next() => match next {
                    Some(outcome) => outcome,
                    None => break,
                },
                _ = tokio::time::sleep_until(state.hard_deadline) => {
                    error!(job_id = %self.job_id, "Drain grace period exhausted, abandoning in-flight chunks");
                    state.abandoned = true;
                    flow = Flow::Stop;
                    break;
                }
            };

            match outcome {
                UnitOutcome::Parsed {
                    parsed,
                    reservation,
                    retries,
                    last_error,
                } => {
                    let tally = &mut state.tally;
                    tally.chunks_total += 1;
                    tally.chunks_ok += 1;
                    tally.retries += u64::from(retries);
                    tally.rejected += parsed.rejected;
                    tally.decoded += parsed.records.len() as u64;
                    tally.bytes += parsed.bytes;

                    if retries > 0 {
                        self.audit
                            .record(
                                EventType::ChunkRetry,
                                self.job_id,
                                json!({
                                    "path": path,
                                    "chunk": parsed.chunk.index,
                                    "retries": retries,
                                    "error": last_error,
                                }),
                            )
                            .await;
                    }
                    if let Some(pb) = &self.progress {
                        pb.inc(1);
                    }

                    if parsed.records.is_empty() {
                        continue;
                    }
                    let batch = WriteBatch {
                        records: parsed.records,
                        _reservation: reservation,
                    };
                    match tokio::time::timeout_at(state.hard_deadline, state.tx.send(batch)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            state.writer_closed = true;
                            state.cancel.cancel();
                            flow = Flow::Stop;
                            break;
                        }
                        Err(_) => {
                            state.abandoned = true;
                            flow = Flow::Stop;
                            break;
                        }
                    }
                }
                UnitOutcome::Failed {
                    chunk,
                    attempts,
                    error,
                } => {
                    state.tally.chunks_total += 1;
                    state.tally.chunks_failed += 1;
                    state.tally.retries += u64::from(attempts.saturating_sub(1));
                    error!(
                        path = %path.display(),
                        chunk = chunk.index,
                        start = chunk.start,
                        end = chunk.end,
                        attempts,
                        error = %error,
                        "Chunk failed after max retries"
                    );
                    self.audit
                        .record(
                            EventType::ChunkFailed,
                            self.job_id,
                            json!({
                                "path": path,
                                "chunk": chunk.index,
                                "start": chunk.start,
                                "end": chunk.end,
                                "attempts": attempts,
                                "error": error,
                            }),
                        )
                        .await;
                    if let Some(pb) = &self.progress {
                        pb.inc(1);
                    }
                    last_failure = Some(error);
                }
                UnitOutcome::Source(e) => return Err(e),
            }
        }

        let t = state.tally;
        let file_chunks = t.chunks_total - before.chunks_total;
        if file_chunks > 0 && t.chunks_ok == before.chunks_ok {
            error!(job_id = %self.job_id, path = %path.display(), chunks = file_chunks, "Every chunk of the file failed");
            return Err(EtlError::read(
                path,
                std::io::Error::other(format!(
                    "all {file_chunks} chunks failed; last error: {}",
                    last_failure.unwrap_or_default()
                )),
            ));
        }
        debug!(
            path = %path.display(),
            chunks_ok = t.chunks_ok - before.chunks_ok,
            chunks_failed = t.chunks_failed - before.chunks_failed,
            "File done"
        );
        self.audit
            .record(
                EventType::FileComplete,
                self.job_id,
                json!({
                    "path": path,
                    "chunks_ok": t.chunks_ok - before.chunks_ok,
                    "chunks_failed": t.chunks_failed - before.chunks_failed,
                    "records_decoded": t.decoded - before.decoded,
                    "records_rejected": t.rejected - before.rejected,
                    "bytes": t.bytes - before.bytes,
                }),
            )
            .await;

        Ok(flow)
    }

    /// Read row batches on the blocking pool, at most `worker_count` ahead
    fn spawn_text_producer(
        &self,
        reader: TextChunkReader,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<WorkUnit>> {
        let (tx, rx) = mpsc::channel(self.config.worker_count);
        tokio::task::spawn_blocking(move || {
            for item in reader {
                if cancel.is_cancelled() {
                    break;
                }
                let failed = item.is_err();
                let unit = item.map(|(chunk, rows)| WorkUnit::Rows {
                    chunk,
                    rows: Arc::new(rows),
                });
                if tx.blocking_send(unit).is_err() || failed {
                    break;
                }
            }
        });
        ReceiverStream::new(rx).boxed()
    }
}

/// Load and parse one unit on the blocking pool, retrying on failure
async fn process_unit(
    unit: Result<WorkUnit>,
    parser: Arc<dyn ChunkParser>,
    gauge: Arc<MemoryGauge>,
    max_retries: u32,
) -> UnitOutcome {
    let unit = match unit {
        Ok(unit) => unit,
        Err(e) => return UnitOutcome::Source(e),
    };
    let chunk = unit.chunk();
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        attempts += 1;
        let task_unit = unit.clone();
        let task_parser = Arc::clone(&parser);
        let task_gauge = Arc::clone(&gauge);
        let handle = tokio::task::spawn_blocking(move || -> Result<(ParsedChunk, GaugeReservation)> {
            let payload = task_unit.load()?;
            let reservation = task_gauge.reserve(payload.resident_bytes());
            let parsed = task_parser.parse_chunk(&task_unit.chunk(), &payload)?;
            Ok((parsed, reservation))
        });

        let error = match handle.await {
            Ok(Ok((parsed, reservation))) => {
                return UnitOutcome::Parsed {
                    parsed,
                    reservation,
                    retries: attempts - 1,
                    last_error,
                }
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_error) if join_error.is_panic() => {
                format!("worker panicked: {}", panic_message(join_error.into_panic()))
            }
            Err(join_error) => join_error.to_string(),
        };

        if attempts > max_retries {
            return UnitOutcome::Failed {
                chunk,
                attempts,
                error,
            };
        }
        warn!(
            chunk = chunk.index,
            retry_count = attempts,
            max_retries,
            error = %error,
            "Chunk failed, will retry"
        );
        last_error = Some(error);
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Owns every sink; returns records written per sink
fn run_writer(
    mut sinks: Vec<Box<dyn RecordSink>>,
    mut rx: mpsc::Receiver<WriteBatch>,
    written: Arc<AtomicU64>,
) -> Result<Vec<u64>> {
    while let Some(batch) = rx.blocking_recv() {
        for sink in sinks.iter_mut() {
            sink.append(&batch.records)?;
        }
        written.fetch_add(batch.records.len() as u64, Ordering::SeqCst);
    }
    for sink in sinks.iter_mut() {
        sink.finish()?;
    }
    Ok(sinks.iter().map(|s| s.records_written()).collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_tracks_peak() {
        let gauge = MemoryGauge::new();
        let a = gauge.reserve(100);
        let b = gauge.reserve(50);
        assert_eq!(gauge.current(), 150);
        drop(a);
        let _c = gauge.reserve(20);
        assert_eq!(gauge.current(), 70);
        assert_eq!(gauge.peak(), 150);
        drop(b);
        assert_eq!(gauge.current(), 20);
    }

    #[test]
    fn test_config_validation() {
        assert!(IngestConfig::default().validate().is_ok());
        let zero_workers = IngestConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert_eq!(zero_workers.validate().unwrap_err().kind(), "configuration");
        let zero_chunk = IngestConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(zero_chunk.validate().is_err());
    }

    #[test]
    fn test_incomplete_results_map_to_errors() {
        let mut result = IngestionResult {
            job_id: Uuid::nil(),
            status: IngestionStatus::TimedOut,
            files: vec![],
            records_ok: 12,
            records_rejected: 0,
            bytes_processed: 0,
            chunks_total: 0,
            chunks_ok: 0,
            chunks_failed: 0,
            chunk_retries: 0,
            truncated_tails: vec![],
            peak_inflight_bytes: 0,
            worker_count: 1,
            chunk_size: 1,
            timeout_secs: 3600,
            elapsed_secs: 0.0,
            outputs: vec![],
        };
        let err = result.ensure_complete().unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("12 records"));

        result.status = IngestionStatus::Cancelled;
        assert_eq!(result.ensure_complete().unwrap_err().kind(), "cancelled");

        result.status = IngestionStatus::Completed;
        assert!(result.ensure_complete().is_ok());
    }

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }
}
