//! Job configuration
//!
//! A [`JobConfig`] is loaded from TOML (every key optional) and then
//! overridden by command-line flags. [`JobConfig::validate`] checks it
//! without touching the filesystem and resolves it into a [`ResolvedJob`].

use crate::coordinator::{default_worker_count, IngestConfig, SourceFormat, DEFAULT_CHUNK_SIZE};
use crate::layout::{ByteOrder, FieldType, RecordLayout};
use clap::ValueEnum;
use hetl_common::{EtlError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_JOB_NAME: &str = "hetl";
pub const DEFAULT_SAMPLE_FRACTION: f64 = 0.005;
pub const DEFAULT_REPORT_DIR: &str = "./report";
pub const DEFAULT_AUDIT_LOG: &str = ".hetl/audit.jsonl";
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_DRAIN_GRACE_SECS: u64 = 30;

/// Extensions treated as delimited text when the format is `auto`
const TEXT_EXTENSIONS: &[&str] = &["csv", "tsv", "txt"];

/// Requested input format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// Decide from the input's extension
    #[default]
    Auto,
    Binary,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// Record layout as written in a config file
///
/// Either a typed `fields` list or a compact `format` string with
/// `field_names`. When neither is given the sales layout is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LayoutConfig {
    /// Byte order for a `fields` list
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_order: Option<ByteOrder>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub field_names: Vec<String>,
}

impl LayoutConfig {
    pub fn resolve(&self) -> Result<RecordLayout> {
        match (&self.format, self.fields.is_empty()) {
            (Some(_), false) => Err(EtlError::config(
                "layout: give either `fields` or `format`, not both",
            )),
            (Some(format), true) => {
                let layout = RecordLayout::from_format(format, &self.field_names)?;
                match self.byte_order {
                    Some(order) if order != layout.byte_order() => Err(EtlError::config(format!(
                        "layout: byte_order '{order}' contradicts format '{format}'"
                    ))),
                    _ => Ok(layout),
                }
            }
            (None, false) => RecordLayout::new(
                self.byte_order.unwrap_or_default(),
                self.fields.iter().map(|f| (f.name.clone(), f.field_type)),
            ),
            (None, true) => {
                if !self.field_names.is_empty() {
                    return Err(EtlError::config("layout: `field_names` requires `format`"));
                }
                Ok(RecordLayout::sales_default())
            }
        }
    }
}

/// A metric summed over the population
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    /// Name in the report
    pub name: String,
    /// Integer field the metric is read from
    pub field: String,
    /// Multiplier applied to the raw value, e.g. 0.01 for cents
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

/// Everything a job needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub job_name: String,
    /// Input file, or directory of input files
    pub input: Option<PathBuf>,
    pub input_format: InputFormat,
    /// Treat the input as CSV regardless of format and extension
    pub force_text: bool,
    pub layout: LayoutConfig,
    pub workers: usize,
    pub chunk_bytes: u64,
    /// Bytes to skip at the start of every binary input
    pub header_bytes: u64,
    pub sample_fraction: f64,
    pub sample_seed: u64,
    pub stratum_field: String,
    pub metrics: Vec<MetricConfig>,
    pub output_csv: Option<PathBuf>,
    pub output_parquet: Option<PathBuf>,
    pub no_parquet: bool,
    pub delimiter: char,
    pub report_dir: PathBuf,
    pub audit_log: PathBuf,
    pub job_timeout_secs: u64,
    pub drain_grace_secs: u64,
    pub max_chunk_retries: u32,
    /// Add a SHA-256 of the input to the report (an extra full read)
    pub checksum_input: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_name: DEFAULT_JOB_NAME.to_string(),
            input: None,
            input_format: InputFormat::Auto,
            force_text: false,
            layout: LayoutConfig::default(),
            workers: default_worker_count(),
            chunk_bytes: DEFAULT_CHUNK_SIZE,
            header_bytes: 0,
            sample_fraction: DEFAULT_SAMPLE_FRACTION,
            sample_seed: crate::estimator::DEFAULT_SEED,
            stratum_field: "product".to_string(),
            metrics: vec![
                MetricConfig {
                    name: "quantity".to_string(),
                    field: "quantity".to_string(),
                    scale: 1.0,
                },
                MetricConfig {
                    name: "value".to_string(),
                    field: "value_cents".to_string(),
                    scale: 0.01,
                },
            ],
            output_csv: None,
            output_parquet: None,
            no_parquet: false,
            delimiter: ',',
            report_dir: PathBuf::from(DEFAULT_REPORT_DIR),
            audit_log: PathBuf::from(DEFAULT_AUDIT_LOG),
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            drain_grace_secs: DEFAULT_DRAIN_GRACE_SECS,
            max_chunk_retries: 1,
            checksum_input: false,
        }
    }
}

/// Metric bound to a layout field
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMetric {
    pub name: String,
    pub field_index: usize,
    pub scale: f64,
}

/// A validated job
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub input: PathBuf,
    pub layout: Arc<RecordLayout>,
    pub format: SourceFormat,
    pub stratum_index: usize,
    pub metrics: Vec<ResolvedMetric>,
    pub ingest: IngestConfig,
    pub output_csv: PathBuf,
    pub output_parquet: Option<PathBuf>,
    pub delimiter: u8,
}

impl JobConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| EtlError::config(format!("Invalid job config: {e}")))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| EtlError::read(path, e))?;
        Self::from_toml_str(&content).map_err(|e| match e {
            EtlError::Config(msg) => EtlError::config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Input format after applying `force_text` and extension detection
    pub fn effective_format(&self) -> InputFormat {
        if self.force_text {
            return InputFormat::Csv;
        }
        match self.input_format {
            InputFormat::Auto => {
                let is_text = self
                    .input
                    .as_deref()
                    .and_then(Path::extension)
                    .and_then(|e| e.to_str())
                    .map(|e| TEXT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false);
                if is_text {
                    InputFormat::Csv
                } else {
                    InputFormat::Binary
                }
            }
            other => other,
        }
    }

    /// Check every parameter and bind names to layout positions
    pub fn validate(&self) -> Result<ResolvedJob> {
        let input = self
            .input
            .clone()
            .ok_or_else(|| EtlError::config("An input path is required"))?;
        let output_csv = self
            .output_csv
            .clone()
            .ok_or_else(|| EtlError::config("An output CSV path is required"))?;

        if self.workers < 1 {
            return Err(EtlError::config("workers must be at least 1"));
        }
        if self.chunk_bytes < 1 {
            return Err(EtlError::config("chunk_bytes must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.sample_fraction) {
            return Err(EtlError::config(format!(
                "sample_fraction must be within [0, 1], got {}",
                self.sample_fraction
            )));
        }
        if self.job_timeout_secs == 0 {
            return Err(EtlError::config("job_timeout_secs must be greater than zero"));
        }
        if !self.delimiter.is_ascii() || matches!(self.delimiter, '"' | '\n' | '\r') {
            return Err(EtlError::config(format!(
                "delimiter must be a single ASCII character other than quote, CR or LF, got {:?}",
                self.delimiter
            )));
        }

        let output_parquet = if self.no_parquet {
            None
        } else {
            self.output_parquet.clone()
        };
        if output_csv == input || output_parquet.as_ref() == Some(&input) {
            return Err(EtlError::config("Output path must differ from the input path"));
        }
        if output_parquet.as_ref() == Some(&output_csv) {
            return Err(EtlError::config("CSV and Parquet outputs must be different files"));
        }

        let layout = self.layout.resolve()?;

        let (stratum_index, _) = layout.field(&self.stratum_field).ok_or_else(|| {
            EtlError::config(format!(
                "stratum_field '{}' is not a layout field",
                self.stratum_field
            ))
        })?;

        if self.metrics.is_empty() {
            return Err(EtlError::config("At least one metric is required"));
        }
        let mut metrics = Vec::with_capacity(self.metrics.len());
        for metric in &self.metrics {
            let (index, def) = layout.field(&metric.field).ok_or_else(|| {
                EtlError::config(format!(
                    "metric '{}' refers to unknown field '{}'",
                    metric.name, metric.field
                ))
            })?;
            if !def.field_type.is_integer() {
                return Err(EtlError::config(format!(
                    "metric '{}' needs a numeric field, '{}' is {}",
                    metric.name, metric.field, def.field_type
                )));
            }
            if !metric.scale.is_finite() {
                return Err(EtlError::config(format!(
                    "metric '{}' has a non-finite scale",
                    metric.name
                )));
            }
            if metrics.iter().any(|m: &ResolvedMetric| m.name == metric.name) {
                return Err(EtlError::config(format!(
                    "metric '{}' is defined twice",
                    metric.name
                )));
            }
            metrics.push(ResolvedMetric {
                name: metric.name.clone(),
                field_index: index,
                scale: metric.scale,
            });
        }

        let delimiter = self.delimiter as u8;
        let format = match self.effective_format() {
            InputFormat::Csv => SourceFormat::Csv { delimiter },
            _ => SourceFormat::Binary,
        };

        let ingest = IngestConfig {
            worker_count: self.workers,
            chunk_size: self.chunk_bytes,
            base_offset: self.header_bytes,
            max_chunk_retries: self.max_chunk_retries,
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            drain_grace: Duration::from_secs(self.drain_grace_secs),
        };

        Ok(ResolvedJob {
            input,
            layout: Arc::new(layout),
            format,
            stratum_index,
            metrics,
            ingest,
            output_csv,
            output_parquet,
            delimiter,
        })
    }
}
