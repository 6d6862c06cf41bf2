//! Retry, cancellation and timeout behaviour of the ingestion coordinator

mod common;

use common::*;
use hetl_ingest::audit::EventType;
use hetl_ingest::chunk::Chunk;
use hetl_ingest::coordinator::{IngestConfig, IngestionCoordinator, IngestionStatus, SourceFormat};
use hetl_ingest::parser::{BinaryChunkParser, ChunkParser, ChunkPayload, ParsedChunk};
use hetl_ingest::sink::CsvSink;
use hetl_ingest::EtlError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Wraps the binary parser and fails selected chunks
struct FaultyParser {
    inner: BinaryChunkParser,
    attempts: Mutex<HashMap<usize, u32>>,
    /// Chunks that fail on their first attempt only
    flaky: Vec<usize>,
    /// Chunks that panic on their first attempt only
    panicky: Vec<usize>,
    /// Chunks that always fail
    broken: Vec<usize>,
}

impl FaultyParser {
    fn new(flaky: Vec<usize>, panicky: Vec<usize>, broken: Vec<usize>) -> Self {
        Self {
            inner: BinaryChunkParser::new(test_layout()),
            attempts: Mutex::new(HashMap::new()),
            flaky,
            panicky,
            broken,
        }
    }

    fn attempts(&self, index: usize) -> u32 {
        self.attempts.lock().unwrap().get(&index).copied().unwrap_or(0)
    }
}

impl ChunkParser for FaultyParser {
    fn parse_chunk(&self, chunk: &Chunk, payload: &ChunkPayload) -> hetl_ingest::Result<ParsedChunk> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(chunk.index).or_insert(0);
            *n += 1;
            *n
        };
        if self.broken.contains(&chunk.index) {
            return Err(EtlError::read(
                "faulty.bin",
                std::io::Error::other(format!("chunk {} unreadable", chunk.index)),
            ));
        }
        if attempt == 1 && self.flaky.contains(&chunk.index) {
            return Err(EtlError::read("faulty.bin", std::io::Error::other("transient")));
        }
        if attempt == 1 && self.panicky.contains(&chunk.index) {
            panic!("decoder crashed on chunk {}", chunk.index);
        }
        self.inner.parse_chunk(chunk, payload)
    }

    fn source_kind(&self) -> &str {
        "binary"
    }
}

/// Sleeps before every chunk
struct SlowParser {
    inner: BinaryChunkParser,
    delay: Duration,
}

impl ChunkParser for SlowParser {
    fn parse_chunk(&self, chunk: &Chunk, payload: &ChunkPayload) -> hetl_ingest::Result<ParsedChunk> {
        std::thread::sleep(self.delay);
        self.inner.parse_chunk(chunk, payload)
    }

    fn source_kind(&self) -> &str {
        "binary"
    }
}

/// Fails every chunk whose bytes are all 0xAB
struct JunkRejectingParser {
    inner: BinaryChunkParser,
}

impl ChunkParser for JunkRejectingParser {
    fn parse_chunk(&self, chunk: &Chunk, payload: &ChunkPayload) -> hetl_ingest::Result<ParsedChunk> {
        if let ChunkPayload::Bytes(bytes) = payload {
            if bytes.iter().all(|b| *b == 0xAB) {
                return Err(EtlError::read("junk.bin", std::io::Error::other("unreadable block")));
            }
        }
        self.inner.parse_chunk(chunk, payload)
    }

    fn source_kind(&self) -> &str {
        "binary"
    }
}

/// Slow parser that cancels the job once `after` chunks have been parsed
struct CancellingParser {
    inner: BinaryChunkParser,
    delay: Duration,
    after: usize,
    parsed: AtomicUsize,
    token: CancellationToken,
}

impl ChunkParser for CancellingParser {
    fn parse_chunk(&self, chunk: &Chunk, payload: &ChunkPayload) -> hetl_ingest::Result<ParsedChunk> {
        std::thread::sleep(self.delay);
        let parsed = self.inner.parse_chunk(chunk, payload)?;
        if self.parsed.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(parsed)
    }

    fn source_kind(&self) -> &str {
        "binary"
    }
}

fn config(workers: usize) -> IngestConfig {
    IngestConfig {
        worker_count: workers,
        chunk_size: 256,
        max_chunk_retries: 1,
        job_timeout: Duration::from_secs(60),
        drain_grace: Duration::from_secs(10),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_failed_chunk_is_retried_once_then_counted() {
    let dir = TempDir::new().unwrap();
    let input = write_binary(&dir.path().join("in.bin"), 1000, 0);
    let parser = Arc::new(FaultyParser::new(vec![3], vec![7], vec![5]));
    let audit = MemoryAudit::new();
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();

    let result = IngestionCoordinator::new(config(4), audit.clone())
        .ingest_with_parser(&[input], RECORD_SIZE, parser.clone(), vec![Box::new(sink)])
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.chunks_total, 250);
    assert_eq!(result.chunks_failed, 1);
    assert_eq!(result.chunks_ok, 249);
    // chunk 3 and chunk 7 recovered on retry; chunk 5 used its one retry
    assert_eq!(result.chunk_retries, 3);
    assert_eq!(result.records_ok, 996);
    assert_eq!(csv_rows(&dir.path().join("out.csv")).len(), 996);

    assert_eq!(parser.attempts(3), 2);
    assert_eq!(parser.attempts(5), 2);
    assert_eq!(parser.attempts(7), 2);
    assert_eq!(parser.attempts(0), 1);

    assert_eq!(audit.count(EventType::ChunkFailed), 1);
    assert_eq!(audit.count(EventType::ChunkRetry), 2);
    let failed = audit
        .events()
        .into_iter()
        .find(|e| e.event_type == EventType::ChunkFailed)
        .unwrap();
    assert_eq!(failed.details["chunk"], 5);
    assert_eq!(failed.details["attempts"], 2);
}

#[tokio::test]
async fn test_zero_retries_fails_immediately() {
    let dir = TempDir::new().unwrap();
    let input = write_binary(&dir.path().join("in.bin"), 100, 0);
    let parser = Arc::new(FaultyParser::new(vec![0], vec![], vec![]));
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();

    let result = IngestionCoordinator::new(
        IngestConfig {
            max_chunk_retries: 0,
            ..config(2)
        },
        MemoryAudit::new(),
    )
    .ingest_with_parser(&[input], RECORD_SIZE, parser.clone(), vec![Box::new(sink)])
    .await
    .unwrap();

    assert_eq!(result.chunks_failed, 1);
    assert_eq!(result.chunk_retries, 0);
    assert_eq!(parser.attempts(0), 1);
}

#[tokio::test]
async fn test_every_chunk_failing_is_fatal() {
    let dir = TempDir::new().unwrap();
    let input = write_binary(&dir.path().join("in.bin"), 16, 0);
    let parser = Arc::new(FaultyParser::new(vec![], vec![], vec![0, 1, 2, 3]));
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();

    let err = IngestionCoordinator::new(config(2), MemoryAudit::new())
        .ingest_with_parser(&[input], RECORD_SIZE, parser, vec![Box::new(sink)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "io_read");
    assert!(err.to_string().contains("all 4 chunks failed"));
}

#[tokio::test]
async fn test_one_unreadable_file_among_several_is_fatal() {
    let dir = TempDir::new().unwrap();
    let good = write_binary(&dir.path().join("good.bin"), 100, 0);
    let junk = dir.path().join("junk.bin");
    std::fs::write(&junk, vec![0xAB; 100 * RECORD_SIZE]).unwrap();
    let parser = Arc::new(JunkRejectingParser {
        inner: BinaryChunkParser::new(test_layout()),
    });
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();

    let err = IngestionCoordinator::new(config(2), MemoryAudit::new())
        .ingest_with_parser(&[good, junk.clone()], RECORD_SIZE, parser, vec![Box::new(sink)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "io_read");
    assert!(err.to_string().contains("junk.bin"));
    assert!(err.to_string().contains("all 25 chunks failed"));
}

#[tokio::test]
async fn test_missing_input_is_fatal() {
    let dir = TempDir::new().unwrap();
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();
    let err = IngestionCoordinator::new(config(2), MemoryAudit::new())
        .ingest(
            &[dir.path().join("missing.bin")],
            test_layout(),
            SourceFormat::Binary,
            vec![Box::new(sink)],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "io_read");
}

#[tokio::test]
async fn test_cancellation_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let input = write_binary(&dir.path().join("in.bin"), 1000, 0);
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();

    let coordinator = IngestionCoordinator::new(config(4), MemoryAudit::new());
    coordinator.cancellation_token().cancel();

    let result = coordinator
        .ingest(&[input], test_layout(), SourceFormat::Binary, vec![Box::new(sink)])
        .await
        .unwrap();

    assert_eq!(result.status, IngestionStatus::Cancelled);
    assert_eq!(result.records_ok, 0);
    assert_eq!(result.chunks_total, 0);
    let err = result.ensure_complete().unwrap_err();
    assert_eq!(err.kind(), "cancelled");

    // The output is a valid, empty CSV
    assert!(csv_rows(&dir.path().join("out.csv")).is_empty());
}

#[tokio::test]
async fn test_cancellation_drains_in_flight_chunks() {
    let dir = TempDir::new().unwrap();
    let input = write_binary(&dir.path().join("in.bin"), 1000, 0);
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();

    let coordinator = IngestionCoordinator::new(config(2), MemoryAudit::new());
    let parser = Arc::new(CancellingParser {
        inner: BinaryChunkParser::new(test_layout()),
        delay: Duration::from_millis(20),
        after: 3,
        parsed: AtomicUsize::new(0),
        token: coordinator.cancellation_token(),
    });

    let result = coordinator
        .ingest_with_parser(&[input], RECORD_SIZE, parser.clone(), vec![Box::new(sink)])
        .await
        .unwrap();

    assert_eq!(result.status, IngestionStatus::Cancelled);
    assert!(result.chunks_total >= 3);
    assert!(result.chunks_total < 250);
    assert_eq!(result.chunks_failed, 0);
    // Every chunk that started was parsed and written
    assert_eq!(result.chunks_ok as usize, parser.parsed.load(Ordering::SeqCst));
    assert_eq!(result.records_ok, result.chunks_ok * 4);
    assert_eq!(csv_rows(&dir.path().join("out.csv")).len() as u64, result.records_ok);
    assert_eq!(result.ensure_complete().unwrap_err().kind(), "cancelled");
}

#[tokio::test]
async fn test_timeout_keeps_partial_output() {
    let dir = TempDir::new().unwrap();
    let input = write_binary(&dir.path().join("in.bin"), 1000, 0);
    let parser = Arc::new(SlowParser {
        inner: BinaryChunkParser::new(test_layout()),
        delay: Duration::from_millis(40),
    });
    let sink = CsvSink::create(dir.path().join("out.csv"), test_layout(), b',').unwrap();

    let result = IngestionCoordinator::new(
        IngestConfig {
            job_timeout: Duration::from_millis(150),
            drain_grace: Duration::from_secs(5),
            ..config(2)
        },
        MemoryAudit::new(),
    )
    .ingest_with_parser(&[input], RECORD_SIZE, parser, vec![Box::new(sink)])
    .await
    .unwrap();

    assert_eq!(result.status, IngestionStatus::TimedOut);
    assert!(result.records_ok < 1000);
    assert!(result.chunks_total < 250);
    let err = result.ensure_complete().unwrap_err();
    assert_eq!(err.kind(), "timeout");

    // Everything reported as written is in the file
    let rows = csv_rows(&dir.path().join("out.csv"));
    assert_eq!(rows.len() as u64, result.records_ok);
}
