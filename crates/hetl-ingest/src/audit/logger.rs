//! Audit logger trait and the JSON-lines implementation

use crate::audit::types::{AuditEvent, EventType};
use async_trait::async_trait;
use hetl_common::{EtlError, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

/// Trait for audit logging (dependency injection)
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Append an event, returning its sequence number
    async fn log_event(&self, event: AuditEvent) -> Result<u64>;

    /// Verify audit chain integrity
    async fn verify_integrity(&self) -> Result<bool>;

    /// Force appended events to stable storage
    async fn flush(&self) -> Result<()>;

    /// Get machine ID
    fn machine_id(&self) -> &str;

    /// Build and append an event, logging instead of failing on error
    ///
    /// Audit failures never abort the work being audited.
    async fn record(&self, event_type: EventType, job_id: Uuid, details: JsonValue) {
        let event = AuditEvent::new(
            event_type,
            Some(job_id),
            details,
            self.machine_id().to_string(),
        );
        if let Err(e) = self.log_event(event).await {
            warn!(event_type = %event_type, error = %e, "Failed to append audit event");
        }
    }
}

struct ChainState {
    file: File,
    last_hash: Option<String>,
    next_seq: u64,
}

/// Append-only JSON-lines audit log
pub struct JsonlAuditLogger {
    path: PathBuf,
    state: Arc<Mutex<ChainState>>,
    machine_id: String,
}

impl JsonlAuditLogger {
    /// Open (or create) the log at `path` and resume its chain
    pub fn open(path: impl AsRef<Path>, machine_id: String) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| EtlError::write(&path, e))?;
        }

        let (last_hash, next_seq) = match File::open(&path) {
            Ok(file) => {
                let mut last = None;
                let mut count = 0u64;
                for line in BufReader::new(file).lines() {
                    let line = line.map_err(|e| EtlError::read(&path, e))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: AuditEvent = serde_json::from_str(&line).map_err(|e| {
                        EtlError::audit(format!(
                            "Audit log '{}' has an unreadable entry: {e}",
                            path.display()
                        ))
                    })?;
                    count += 1;
                    last = event.event_hash;
                }
                (last, count + 1)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, 1),
            Err(e) => return Err(EtlError::read(&path, e)),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EtlError::write(&path, e))?;

        Ok(Self {
            path,
            state: Arc::new(Mutex::new(ChainState {
                file,
                last_hash,
                next_seq,
            })),
            machine_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditLogger for JsonlAuditLogger {
    async fn log_event(&self, mut event: AuditEvent) -> Result<u64> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| EtlError::audit(format!("Failed to acquire audit lock: {e}")))?;

        let seq = state.next_seq;
        event.seq = Some(seq);
        event.previous_hash = state.last_hash.clone();
        let hash = event.compute_hash();
        event.event_hash = Some(hash.clone());

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        state
            .file
            .write_all(&line)
            .map_err(|e| EtlError::write(&self.path, e))?;

        state.last_hash = Some(hash);
        state.next_seq += 1;
        Ok(seq)
    }

    async fn verify_integrity(&self) -> Result<bool> {
        Ok(verify_chain(&self.path)?.valid)
    }

    async fn flush(&self) -> Result<()> {
        let state = self
            .state
            .lock()
            .map_err(|e| EtlError::audit(format!("Failed to acquire audit lock: {e}")))?;
        state
            .file
            .sync_data()
            .map_err(|e| EtlError::write(&self.path, e))
    }

    fn machine_id(&self) -> &str {
        &self.machine_id
    }
}

/// Outcome of checking an audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub events: u64,
    pub valid: bool,
    /// Line number (1-based) of the first entry that breaks the chain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid_line: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Check sequence numbers, hash links and event hashes of a log file
///
/// A missing file is an empty, valid chain.
pub fn verify_chain(path: impl AsRef<Path>) -> Result<ChainReport> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ChainReport {
                events: 0,
                valid: true,
                first_invalid_line: None,
                reason: None,
            })
        }
        Err(e) => return Err(EtlError::read(path, e)),
    };

    let broken = |events: u64, line: u64, reason: String| ChainReport {
        events,
        valid: false,
        first_invalid_line: Some(line),
        reason: Some(reason),
    };

    let mut previous: Option<String> = None;
    let mut events = 0u64;
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line_no = i as u64 + 1;
        let line = line.map_err(|e| EtlError::read(path, e))?;
        if line.trim().is_empty() {
            continue;
        }

        let event: AuditEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => return Ok(broken(events, line_no, format!("unparseable entry: {e}"))),
        };
        events += 1;

        if event.seq != Some(events) {
            return Ok(broken(events, line_no, "sequence gap".to_string()));
        }
        if event.previous_hash != previous {
            return Ok(broken(events, line_no, "previous hash mismatch".to_string()));
        }
        if event.event_hash.as_deref() != Some(event.compute_hash().as_str()) {
            return Ok(broken(events, line_no, "event hash mismatch".to_string()));
        }
        previous = event.event_hash;
    }

    Ok(ChainReport {
        events,
        valid: true,
        first_invalid_line: None,
        reason: None,
    })
}
