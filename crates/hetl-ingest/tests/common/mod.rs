//! Shared fixtures for hetl-ingest integration tests
//!
//! Test data uses a 64-byte layout:
//! `id:u64, timestamp:u64, quantity:u32, flags:u32, value_cents:i64, product:text(32)`
//! with products interleaved so that every 10 records hold
//! 5 `alpha`, 3 `beta` and 2 `gamma`.

#![allow(dead_code)]

use async_trait::async_trait;
use hetl_ingest::audit::{AuditEvent, AuditLogger, EventType};
use hetl_ingest::config::{FieldConfig, JobConfig, LayoutConfig, MetricConfig};
use hetl_ingest::{ByteOrder, FieldType, FieldValue, Record, RecordCodec, RecordLayout};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const RECORD_SIZE: usize = 64;

pub const FIELDS: &[(&str, FieldType)] = &[
    ("id", FieldType::U64),
    ("timestamp", FieldType::U64),
    ("quantity", FieldType::U32),
    ("flags", FieldType::U32),
    ("value_cents", FieldType::I64),
    ("product", FieldType::Text(32)),
];

pub fn test_layout() -> Arc<RecordLayout> {
    Arc::new(RecordLayout::new(ByteOrder::Little, FIELDS.iter().copied()).expect("valid layout"))
}

pub fn layout_config() -> LayoutConfig {
    LayoutConfig {
        byte_order: Some(ByteOrder::Little),
        fields: FIELDS
            .iter()
            .map(|(name, field_type)| FieldConfig {
                name: name.to_string(),
                field_type: *field_type,
            })
            .collect(),
        ..Default::default()
    }
}

pub fn product_for(i: u64) -> &'static str {
    match i % 10 {
        0..=4 => "alpha",
        5..=7 => "beta",
        _ => "gamma",
    }
}

pub fn quantity_for(i: u64) -> u64 {
    i % 7 + 1
}

pub fn record(i: u64) -> Record {
    Record::new(vec![
        FieldValue::Unsigned(i),
        FieldValue::Unsigned(1_700_000_000 + i * 60),
        FieldValue::Unsigned(quantity_for(i)),
        FieldValue::Unsigned(0),
        FieldValue::Signed((i as i64 * 37) % 1000 - 200),
        FieldValue::Text(product_for(i).to_string()),
    ])
}

/// Write `count` records followed by `tail` junk bytes
pub fn write_binary(path: &Path, count: u64, tail: usize) -> PathBuf {
    let codec = RecordCodec::new(test_layout());
    let mut file = std::fs::File::create(path).expect("create input");
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    for i in 0..count {
        buf.clear();
        codec.encode_into(&record(i), &mut buf).expect("encode");
        file.write_all(&buf).expect("write record");
    }
    file.write_all(&vec![0xAB; tail]).expect("write tail");
    path.to_path_buf()
}

/// Job config over the test layout with small chunks
pub fn job_config(dir: &Path, input: &Path) -> JobConfig {
    JobConfig {
        job_name: "integration".to_string(),
        input: Some(input.to_path_buf()),
        layout: layout_config(),
        workers: 4,
        chunk_bytes: 256,
        sample_fraction: 0.1,
        stratum_field: "product".to_string(),
        metrics: vec![MetricConfig {
            name: "quantity".to_string(),
            field: "quantity".to_string(),
            scale: 1.0,
        }],
        output_csv: Some(dir.join("out/records.csv")),
        report_dir: dir.join("report"),
        audit_log: dir.join("state/audit.jsonl"),
        ..Default::default()
    }
}

/// Data rows of a CSV file (header excluded)
pub fn csv_rows(path: &Path) -> Vec<csv::StringRecord> {
    let mut reader = csv::Reader::from_path(path).expect("open csv");
    reader
        .records()
        .collect::<Result<Vec<_>, _>>()
        .expect("read csv")
}

/// Audit logger that keeps events in memory
#[derive(Default)]
pub struct MemoryAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAudit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("audit lock")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit lock").clone()
    }
}

#[async_trait]
impl AuditLogger for MemoryAudit {
    async fn log_event(&self, event: AuditEvent) -> hetl_ingest::Result<u64> {
        let mut events = self.events.lock().expect("audit lock");
        events.push(event);
        Ok(events.len() as u64)
    }

    async fn verify_integrity(&self) -> hetl_ingest::Result<bool> {
        Ok(true)
    }

    async fn flush(&self) -> hetl_ingest::Result<()> {
        Ok(())
    }

    fn machine_id(&self) -> &str {
        "test-machine"
    }
}
