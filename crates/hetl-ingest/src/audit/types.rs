//! Audit event types and structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Job accepted after configuration validation
    JobStart,
    /// Job finished with complete output
    JobComplete,
    /// Job stopped early (timeout or cancellation)
    JobIncomplete,
    /// Job aborted by a fatal error
    JobFailed,
    /// Ingestion of one input file started
    FileStart,
    /// Ingestion of one input file finished
    FileComplete,
    /// Input ends with a partial record
    TruncatedTail,
    /// A chunk failed and is being retried
    ChunkRetry,
    /// A chunk failed after all retries
    ChunkFailed,
    /// A pre-existing output was moved aside
    OutputBackup,
    EstimationComplete,
    EstimationFailed,
    ReportWritten,
    ReportFailed,
}

impl EventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &str {
        match self {
            EventType::JobStart => "job_start",
            EventType::JobComplete => "job_complete",
            EventType::JobIncomplete => "job_incomplete",
            EventType::JobFailed => "job_failed",
            EventType::FileStart => "file_start",
            EventType::FileComplete => "file_complete",
            EventType::TruncatedTail => "truncated_tail",
            EventType::ChunkRetry => "chunk_retry",
            EventType::ChunkFailed => "chunk_failed",
            EventType::OutputBackup => "output_backup",
            EventType::EstimationComplete => "estimation_complete",
            EventType::EstimationFailed => "estimation_failed",
            EventType::ReportWritten => "report_written",
            EventType::ReportFailed => "report_failed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit event structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Position in the log (assigned on append)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,

    pub timestamp: DateTime<Utc>,

    pub event_type: EventType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,

    /// Event details (JSON)
    pub details: JsonValue,

    pub machine_id: String,

    /// Event hash (computed on append)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_hash: Option<String>,

    /// Previous event hash (for chain)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(
        event_type: EventType,
        job_id: Option<Uuid>,
        details: JsonValue,
        machine_id: String,
    ) -> Self {
        Self {
            seq: None,
            timestamp: Utc::now(),
            event_type,
            job_id,
            details,
            machine_id,
            event_hash: None,
            previous_hash: None,
        }
    }

    /// Compute hash of this event
    ///
    /// Covers every field except `event_hash` itself.
    pub fn compute_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let data = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.seq.unwrap_or(0),
            self.timestamp.to_rfc3339(),
            self.event_type.as_str(),
            self.job_id.map(|id| id.to_string()).unwrap_or_default(),
            self.details,
            self.machine_id,
            self.previous_hash.as_deref().unwrap_or_default()
        );

        hex::encode(Sha256::digest(data.as_bytes()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_as_str() {
        assert_eq!(EventType::JobStart.as_str(), "job_start");
        assert_eq!(EventType::ChunkFailed.to_string(), "chunk_failed");
        assert_eq!(
            serde_json::to_string(&EventType::OutputBackup).unwrap(),
            "\"output_backup\""
        );
    }

    #[test]
    fn test_compute_hash_covers_details() {
        let mut event = AuditEvent::new(
            EventType::ChunkFailed,
            Some(Uuid::new_v4()),
            json!({"chunk": 3}),
            "machine-123".to_string(),
        );
        event.seq = Some(1);
        let original = event.compute_hash();
        assert_eq!(original.len(), 64);
        assert_eq!(original, event.compute_hash());

        event.details = json!({"chunk": 4});
        assert_ne!(original, event.compute_hash());
    }

    #[test]
    fn test_hash_survives_json_round_trip() {
        let mut event = AuditEvent::new(
            EventType::JobStart,
            None,
            json!({"workers": 4, "fraction": 0.005, "input": "data/sales.bin"}),
            "machine-123".to_string(),
        );
        event.seq = Some(7);
        event.previous_hash = Some("ab".repeat(32));
        let hash = event.compute_hash();

        let line = serde_json::to_string(&event).unwrap();
        let parsed: AuditEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.compute_hash(), hash);
    }
}
