//! Chunk parsers
//!
//! A [`ChunkParser`] turns the raw payload of one chunk into records.
//! Implement this trait to plug a new source format into the coordinator.

use crate::chunk::Chunk;
use crate::codec::{FieldValue, Record, RecordCodec};
use crate::layout::{FieldType, RecordLayout};
use csv::ByteRecord;
use hetl_common::{EtlError, Result};
use std::sync::Arc;
use tracing::debug;

/// Raw data of one chunk as loaded by a worker
#[derive(Debug, Clone)]
pub enum ChunkPayload {
    /// Record-aligned bytes of a binary source
    Bytes(Vec<u8>),
    /// Data rows of a delimited text source
    Rows(Arc<Vec<ByteRecord>>),
}

impl ChunkPayload {
    /// Bytes held in memory by this payload
    pub fn resident_bytes(&self) -> u64 {
        match self {
            ChunkPayload::Bytes(b) => b.len() as u64,
            ChunkPayload::Rows(rows) => rows.iter().map(|r| r.as_slice().len() as u64).sum(),
        }
    }
}

/// Records decoded from one chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    pub chunk: Chunk,
    /// Decoded records in source order
    pub records: Vec<Record>,
    /// Records that failed to decode and were skipped
    pub rejected: u64,
    /// Source bytes consumed
    pub bytes: u64,
}

/// Parser for one source format
///
/// Record-level problems are counted in [`ParsedChunk::rejected`]. An `Err`
/// means the whole chunk failed and is eligible for retry.
pub trait ChunkParser: Send + Sync {
    fn parse_chunk(&self, chunk: &Chunk, payload: &ChunkPayload) -> Result<ParsedChunk>;

    /// Name of the source format, e.g. "binary" or "csv"
    fn source_kind(&self) -> &str;
}

/// Decodes fixed-width binary records
#[derive(Debug, Clone)]
pub struct BinaryChunkParser {
    codec: RecordCodec,
}

impl BinaryChunkParser {
    pub fn new(layout: Arc<RecordLayout>) -> Self {
        Self {
            codec: RecordCodec::new(layout),
        }
    }
}

impl ChunkParser for BinaryChunkParser {
    fn parse_chunk(&self, chunk: &Chunk, payload: &ChunkPayload) -> Result<ParsedChunk> {
        let ChunkPayload::Bytes(bytes) = payload else {
            return Err(EtlError::malformed("binary parser received a row payload"));
        };

        let record_size = self.codec.record_size();
        if bytes.len() % record_size != 0 {
            return Err(EtlError::malformed(format!(
                "chunk {} holds {} bytes, not a multiple of the record size {record_size}",
                chunk.index,
                bytes.len()
            )));
        }

        let mut records = Vec::with_capacity(bytes.len() / record_size);
        let mut rejected = 0u64;
        for (i, span) in bytes.chunks_exact(record_size).enumerate() {
            match self.codec.decode(span) {
                Ok(record) => records.push(record),
                Err(e) => {
                    rejected += 1;
                    debug!(
                        offset = chunk.start + (i * record_size) as u64,
                        error = %e,
                        "Skipping malformed record"
                    );
                }
            }
        }

        Ok(ParsedChunk {
            chunk: *chunk,
            records,
            rejected,
            bytes: bytes.len() as u64,
        })
    }

    fn source_kind(&self) -> &str {
        "binary"
    }
}

/// Converts delimited text rows into records of a layout
///
/// Columns are matched to layout fields by header name. Integer cells are
/// parsed as decimal, text cells must fit their field width and bytes cells
/// are hex encoded.
#[derive(Debug, Clone)]
pub struct CsvRowParser {
    layout: Arc<RecordLayout>,
    columns: Vec<usize>,
}

impl CsvRowParser {
    /// Map layout fields onto `headers`
    ///
    /// A layout field without a matching column is a configuration error.
    pub fn new(layout: Arc<RecordLayout>, headers: &[String]) -> Result<Self> {
        let columns = layout
            .fields()
            .iter()
            .map(|field| {
                headers
                    .iter()
                    .position(|h| h == &field.name)
                    .ok_or_else(|| {
                        EtlError::config(format!(
                            "CSV input has no column '{}' (columns: {})",
                            field.name,
                            headers.join(", ")
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { layout, columns })
    }

    /// Convert one row into a record
    pub fn convert_row(&self, row: &ByteRecord) -> Result<Record> {
        let mut values = Vec::with_capacity(self.columns.len());
        for (field, &column) in self.layout.fields().iter().zip(&self.columns) {
            let raw = row.get(column).ok_or_else(|| {
                EtlError::malformed(format!("row has no value for column '{}'", field.name))
            })?;
            let cell = std::str::from_utf8(raw).map_err(|e| {
                EtlError::malformed(format!("column '{}' is not valid UTF-8: {e}", field.name))
            })?;
            values.push(convert_cell(&field.name, field.field_type, cell)?);
        }
        Ok(Record::new(values))
    }
}

fn convert_cell(name: &str, field_type: FieldType, cell: &str) -> Result<FieldValue> {
    let bad = |what: &str| EtlError::malformed(format!("column '{name}': {what} '{cell}'"));

    match field_type {
        FieldType::Text(width) => {
            if cell.len() > width || cell.ends_with('\0') {
                Err(bad("text does not fit the field"))
            } else {
                Ok(FieldValue::Text(cell.to_string()))
            }
        }
        FieldType::Bytes(width) => {
            let bytes = hex::decode(cell.trim()).map_err(|_| bad("invalid hex"))?;
            if bytes.len() != width {
                return Err(bad("wrong byte length"));
            }
            Ok(FieldValue::Bytes(bytes))
        }
        t if t.is_signed() => {
            let v: i64 = cell.trim().parse().map_err(|_| bad("invalid integer"))?;
            let shift = 64 - t.width() * 8;
            if v < (i64::MIN >> shift) || v > (i64::MAX >> shift) {
                return Err(bad("integer out of range"));
            }
            Ok(FieldValue::Signed(v))
        }
        t => {
            let v: u64 = cell.trim().parse().map_err(|_| bad("invalid integer"))?;
            if t.width() < 8 && v >> (t.width() * 8) != 0 {
                return Err(bad("integer out of range"));
            }
            Ok(FieldValue::Unsigned(v))
        }
    }
}

impl ChunkParser for CsvRowParser {
    fn parse_chunk(&self, chunk: &Chunk, payload: &ChunkPayload) -> Result<ParsedChunk> {
        let ChunkPayload::Rows(rows) = payload else {
            return Err(EtlError::malformed("csv parser received a byte payload"));
        };

        let mut records = Vec::with_capacity(rows.len());
        let mut rejected = 0u64;
        for (i, row) in rows.iter().enumerate() {
            match self.convert_row(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    rejected += 1;
                    debug!(row = chunk.start + i as u64, error = %e, "Skipping malformed row");
                }
            }
        }

        Ok(ParsedChunk {
            chunk: *chunk,
            records,
            rejected,
            bytes: payload.resident_bytes(),
        })
    }

    fn source_kind(&self) -> &str {
        "csv"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::layout::ByteOrder;

    fn layout() -> Arc<RecordLayout> {
        Arc::new(
            RecordLayout::new(
                ByteOrder::Little,
                [
                    ("id", FieldType::U16),
                    ("delta", FieldType::I8),
                    ("name", FieldType::Text(4)),
                ],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_binary_parser_skips_malformed_records() {
        let parser = BinaryChunkParser::new(layout());
        let mut bytes = vec![1, 0, 0xff, b'a', b'b', 0, 0];
        bytes.extend_from_slice(&[2, 0, 1, 0xc3, 0x28, 0, 0]);
        bytes.extend_from_slice(&[3, 0, 2, b'z', 0, 0, 0]);
        let chunk = Chunk { index: 0, start: 0, end: 21 };

        let parsed = parser
            .parse_chunk(&chunk, &ChunkPayload::Bytes(bytes))
            .unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.rejected, 1);
        assert_eq!(parsed.bytes, 21);
        assert_eq!(parsed.records[0].get(1), Some(&FieldValue::Signed(-1)));
        assert_eq!(parsed.records[1].get(2), Some(&FieldValue::Text("z".into())));
    }

    #[test]
    fn test_binary_parser_rejects_unaligned_chunk() {
        let parser = BinaryChunkParser::new(layout());
        let chunk = Chunk { index: 4, start: 0, end: 8 };
        assert!(parser
            .parse_chunk(&chunk, &ChunkPayload::Bytes(vec![0; 8]))
            .is_err());
    }

    #[test]
    fn test_csv_parser_matches_columns_by_name() {
        let headers = vec!["name".to_string(), "id".to_string(), "delta".to_string()];
        let parser = CsvRowParser::new(layout(), &headers).unwrap();
        let rows = Arc::new(vec![
            ByteRecord::from(vec!["ab", "7", "-3"]),
            ByteRecord::from(vec!["toolong", "8", "1"]),
            ByteRecord::from(vec!["ok", "70000", "1"]),
            ByteRecord::from(vec!["ok", "9", "x"]),
        ]);
        let chunk = Chunk { index: 0, start: 0, end: 4 };

        let parsed = parser.parse_chunk(&chunk, &ChunkPayload::Rows(rows)).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.rejected, 3);
        assert_eq!(
            parsed.records[0].values(),
            &[
                FieldValue::Unsigned(7),
                FieldValue::Signed(-3),
                FieldValue::Text("ab".into())
            ]
        );
    }

    #[test]
    fn test_csv_parser_requires_every_column() {
        let headers = vec!["id".to_string(), "name".to_string()];
        let err = CsvRowParser::new(layout(), &headers).unwrap_err();
        assert_eq!(err.kind(), "configuration");
        assert!(err.to_string().contains("delta"));
    }
}
