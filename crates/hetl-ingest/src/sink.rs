//! Output sinks
//!
//! Sinks are owned by the single writer task of a job and only ever see
//! whole decoded batches. A sink never overwrites an existing file: the
//! previous file is first renamed to a timestamped backup.

use crate::codec::{FieldValue, Record};
use crate::layout::{FieldType, RecordLayout};
use arrow::array::{
    ArrayRef, BinaryBuilder, Int16Builder, Int32Builder, Int64Builder, Int8Builder,
    StringBuilder, UInt16Builder, UInt32Builder, UInt64Builder, UInt8Builder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use hetl_common::{EtlError, Result};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Destination for decoded records
pub trait RecordSink: Send {
    /// Append a batch in order
    fn append(&mut self, records: &[Record]) -> Result<()>;

    /// Flush and close the sink
    fn finish(&mut self) -> Result<()>;

    fn path(&self) -> &Path;

    /// Where a pre-existing file at `path` was moved, if there was one
    fn backup(&self) -> Option<&Path>;

    fn records_written(&self) -> u64;
}

/// Move an existing file out of the way
///
/// The file is renamed to `<path>.bak.<YYYYmmddTHHMMSSZ>`, with a numeric
/// suffix when that name is taken. Returns the backup path, or `None` when
/// nothing existed at `path`.
pub fn backup_existing(path: &Path) -> Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let base = format!("{}.bak.{stamp}", path.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{base}.{n}"));
        n += 1;
    }

    std::fs::rename(path, &candidate).map_err(|e| EtlError::write(path, e))?;
    info!(
        path = %path.display(),
        backup = %candidate.display(),
        "Backed up existing output"
    );
    Ok(Some(candidate))
}

/// Neutralise spreadsheet formula injection
///
/// Text starting with `=`, `@`, `+` or `-` gets a leading `'`.
pub fn sanitize_csv_field(value: &str) -> Cow<'_, str> {
    match value.as_bytes().first() {
        Some(b'=' | b'@' | b'+' | b'-') => Cow::Owned(format!("'{value}")),
        _ => Cow::Borrowed(value),
    }
}

fn create_fresh(path: &Path) -> Result<(File, Option<PathBuf>)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| EtlError::write(path, e))?;
    }
    let backup = backup_existing(path)?;
    let file = OpenOptions::new()
        .append(true)
        .create_new(true)
        .open(path)
        .map_err(|e| EtlError::write(path, e))?;
    Ok((file, backup))
}

/// Append-only delimited text sink
pub struct CsvSink {
    path: PathBuf,
    backup: Option<PathBuf>,
    layout: Arc<RecordLayout>,
    writer: csv::Writer<File>,
    rows: u64,
    finished: bool,
}

impl CsvSink {
    /// Create the output file and write its header row
    pub fn create(path: impl AsRef<Path>, layout: Arc<RecordLayout>, delimiter: u8) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, backup) = create_fresh(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .from_writer(file);

        writer
            .write_record(layout.field_names().map(|n| sanitize_csv_field(n).into_owned()))
            .map_err(|e| EtlError::write(&path, e.into()))?;
        writer.flush().map_err(|e| EtlError::write(&path, e))?;

        debug!(path = %path.display(), "Created CSV sink");
        Ok(Self {
            path,
            backup,
            layout,
            writer,
            rows: 0,
            finished: false,
        })
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, records: &[Record]) -> Result<()> {
        let path = &self.path;
        let io_err = |e: csv::Error| EtlError::write(path, e.into());

        for record in records {
            for (field, value) in self.layout.fields().iter().zip(record.values()) {
                let written = match (field.field_type, value) {
                    (FieldType::Text(_), FieldValue::Text(s)) => {
                        self.writer.write_field(sanitize_csv_field(s).as_bytes())
                    }
                    (_, other) => self.writer.write_field(other.to_string()),
                };
                written.map_err(io_err)?;
            }
            self.writer.write_record(None::<&[u8]>).map_err(io_err)?;
        }
        self.writer
            .flush()
            .map_err(|e| EtlError::write(&self.path, e))?;
        self.rows += records.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.writer
            .flush()
            .and_then(|_| self.writer.get_ref().sync_all())
            .map_err(|e| EtlError::write(&self.path, e))?;
        self.finished = true;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    fn records_written(&self) -> u64 {
        self.rows
    }
}

/// Arrow schema equivalent of a layout
pub fn arrow_schema(layout: &RecordLayout) -> SchemaRef {
    let fields: Vec<Field> = layout
        .fields()
        .iter()
        .map(|f| {
            let data_type = match f.field_type {
                FieldType::U8 => DataType::UInt8,
                FieldType::U16 => DataType::UInt16,
                FieldType::U32 => DataType::UInt32,
                FieldType::U64 => DataType::UInt64,
                FieldType::I8 => DataType::Int8,
                FieldType::I16 => DataType::Int16,
                FieldType::I32 => DataType::Int32,
                FieldType::I64 => DataType::Int64,
                FieldType::Text(_) => DataType::Utf8,
                FieldType::Bytes(_) => DataType::Binary,
            };
            Field::new(&f.name, data_type, false)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

enum ColumnBuilder {
    U8(UInt8Builder),
    U16(UInt16Builder),
    U32(UInt32Builder),
    U64(UInt64Builder),
    I8(Int8Builder),
    I16(Int16Builder),
    I32(Int32Builder),
    I64(Int64Builder),
    Text(StringBuilder),
    Bytes(BinaryBuilder),
}

impl ColumnBuilder {
    fn for_type(field_type: FieldType) -> Self {
        match field_type {
            FieldType::U8 => Self::U8(UInt8Builder::new()),
            FieldType::U16 => Self::U16(UInt16Builder::new()),
            FieldType::U32 => Self::U32(UInt32Builder::new()),
            FieldType::U64 => Self::U64(UInt64Builder::new()),
            FieldType::I8 => Self::I8(Int8Builder::new()),
            FieldType::I16 => Self::I16(Int16Builder::new()),
            FieldType::I32 => Self::I32(Int32Builder::new()),
            FieldType::I64 => Self::I64(Int64Builder::new()),
            FieldType::Text(_) => Self::Text(StringBuilder::new()),
            FieldType::Bytes(_) => Self::Bytes(BinaryBuilder::new()),
        }
    }

    /// Returns false when the value does not match the column type
    fn push(&mut self, value: &FieldValue) -> bool {
        match (self, value) {
            (Self::U8(b), FieldValue::Unsigned(v)) => u8::try_from(*v).map(|v| b.append_value(v)).is_ok(),
            (Self::U16(b), FieldValue::Unsigned(v)) => u16::try_from(*v).map(|v| b.append_value(v)).is_ok(),
            (Self::U32(b), FieldValue::Unsigned(v)) => u32::try_from(*v).map(|v| b.append_value(v)).is_ok(),
            (Self::U64(b), FieldValue::Unsigned(v)) => {
                b.append_value(*v);
                true
            }
            (Self::I8(b), FieldValue::Signed(v)) => i8::try_from(*v).map(|v| b.append_value(v)).is_ok(),
            (Self::I16(b), FieldValue::Signed(v)) => i16::try_from(*v).map(|v| b.append_value(v)).is_ok(),
            (Self::I32(b), FieldValue::Signed(v)) => i32::try_from(*v).map(|v| b.append_value(v)).is_ok(),
            (Self::I64(b), FieldValue::Signed(v)) => {
                b.append_value(*v);
                true
            }
            (Self::Text(b), FieldValue::Text(s)) => {
                b.append_value(s);
                true
            }
            (Self::Bytes(b), FieldValue::Bytes(v)) => {
                b.append_value(v);
                true
            }
            _ => false,
        }
    }

    fn finish(&mut self) -> ArrayRef {
        match self {
            Self::U8(b) => Arc::new(b.finish()),
            Self::U16(b) => Arc::new(b.finish()),
            Self::U32(b) => Arc::new(b.finish()),
            Self::U64(b) => Arc::new(b.finish()),
            Self::I8(b) => Arc::new(b.finish()),
            Self::I16(b) => Arc::new(b.finish()),
            Self::I32(b) => Arc::new(b.finish()),
            Self::I64(b) => Arc::new(b.finish()),
            Self::Text(b) => Arc::new(b.finish()),
            Self::Bytes(b) => Arc::new(b.finish()),
        }
    }
}

/// Parquet mirror of the output, one row group per appended batch
pub struct ParquetSink {
    path: PathBuf,
    backup: Option<PathBuf>,
    layout: Arc<RecordLayout>,
    schema: SchemaRef,
    writer: Option<ArrowWriter<File>>,
    rows: u64,
}

impl ParquetSink {
    pub fn create(path: impl AsRef<Path>, layout: Arc<RecordLayout>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (file, backup) = create_fresh(&path)?;
        let schema = arrow_schema(&layout);
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(file, schema.clone(), Some(props))
            .map_err(|e| EtlError::write(&path, std::io::Error::other(e)))?;

        debug!(path = %path.display(), "Created Parquet sink");
        Ok(Self {
            path,
            backup,
            layout,
            schema,
            writer: Some(writer),
            rows: 0,
        })
    }
}

impl RecordSink for ParquetSink {
    fn append(&mut self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(EtlError::write(
                &self.path,
                std::io::Error::other("parquet sink already finished"),
            ));
        };

        let mut columns: Vec<ColumnBuilder> = self
            .layout
            .fields()
            .iter()
            .map(|f| ColumnBuilder::for_type(f.field_type))
            .collect();
        for record in records {
            for (i, (column, value)) in columns.iter_mut().zip(record.values()).enumerate() {
                if !column.push(value) {
                    return Err(EtlError::InvalidRecord(format!(
                        "value {value:?} does not fit parquet column '{}'",
                        self.layout.fields()[i].name
                    )));
                }
            }
        }

        let arrays: Vec<ArrayRef> = columns.iter_mut().map(ColumnBuilder::finish).collect();
        let batch = RecordBatch::try_new(self.schema.clone(), arrays)
            .map_err(|e| EtlError::write(&self.path, std::io::Error::other(e)))?;
        writer
            .write(&batch)
            .and_then(|_| writer.flush())
            .map_err(|e| EtlError::write(&self.path, std::io::Error::other(e)))?;
        self.rows += records.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .close()
                .map_err(|e| EtlError::write(&self.path, std::io::Error::other(e)))?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn backup(&self) -> Option<&Path> {
        self.backup.as_deref()
    }

    fn records_written(&self) -> u64 {
        self.rows
    }
}
