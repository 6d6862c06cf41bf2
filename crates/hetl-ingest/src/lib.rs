//! HETL Ingest Library
//!
//! Memory-bounded, parallel ingestion of fixed-layout binary records (or
//! CSV) followed by stratified-sample estimation of population totals.
//!
//! # Overview
//!
//! - **Layouts and codec**: [`layout::RecordLayout`], [`codec::RecordCodec`]
//! - **Chunking**: [`chunk::align`] and [`reader::StreamReader`]
//! - **Ingestion**: [`coordinator::IngestionCoordinator`] with CSV and Parquet sinks
//! - **Estimation**: [`estimator::StratifiedEstimator`]
//! - **Jobs**: [`job::JobRunner`] producing a [`report::JobReport`] and an audit trail
//!
//! # Example
//!
//! ```no_run
//! use hetl_ingest::config::JobConfig;
//! use hetl_ingest::job::JobRunner;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = JobConfig {
//!         input: Some("data/sales.bin".into()),
//!         output_csv: Some("output/sales.csv".into()),
//!         ..Default::default()
//!     };
//!     let outcome = JobRunner::new(config).run().await?;
//!     println!("{}", outcome.report.status.as_str());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod audit;
pub mod chunk;
pub mod codec;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod estimator;
pub mod job;
pub mod layout;
pub mod parser;
pub mod progress;
pub mod reader;
pub mod report;
pub mod sink;

// Re-export commonly used types
pub use codec::{FieldValue, Record, RecordCodec};
pub use config::JobConfig;
pub use hetl_common::{EtlError, Result};
pub use layout::{ByteOrder, FieldType, RecordLayout};

use clap::{Args, Parser, Subcommand};
use config::InputFormat;
use std::path::PathBuf;

/// HETL - hybrid batch ingestion with stratified estimation
#[derive(Parser, Debug)]
#[command(name = "hetl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print the CLI reference as markdown
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest input files, estimate totals and write a job report
    Run(RunArgs),

    /// Audit trail management
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },

    /// Print the resolved record layout
    Layout(LayoutArgs),
}

/// Options of `hetl run`; each overrides the matching key of `--config`
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Job configuration file (TOML)
    #[arg(short, long, env = "HETL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Input file or directory (binary or CSV)
    #[arg(short, long, env = "HETL_INPUT")]
    pub input: Option<PathBuf>,

    /// Output CSV path
    #[arg(short = 'o', long, env = "HETL_OUTPUT_CSV")]
    pub output_csv: Option<PathBuf>,

    /// Output Parquet path
    #[arg(short = 'p', long, env = "HETL_PARQUET_OUT")]
    pub parquet_out: Option<PathBuf>,

    /// Skip Parquet output
    #[arg(long)]
    pub no_parquet: bool,

    /// Number of concurrent chunk workers (default: logical CPUs - 1)
    #[arg(short, long, env = "HETL_WORKERS")]
    pub workers: Option<usize>,

    /// Chunk size in bytes (default: 64 MiB)
    #[arg(long, env = "HETL_CHUNK_BYTES")]
    pub chunk_bytes: Option<u64>,

    /// Header bytes to skip at the start of each binary input
    #[arg(long)]
    pub header_bytes: Option<u64>,

    /// Sample fraction for estimation (default: 0.005)
    #[arg(long, env = "HETL_SAMPLE_FRACTION")]
    pub sample_frac: Option<f64>,

    /// Sampling seed
    #[arg(long, env = "HETL_SEED")]
    pub seed: Option<u64>,

    /// Record layout as a struct format string, e.g. "<IQIq32s"
    #[arg(long)]
    pub record_struct: Option<String>,

    /// Field names for --record-struct, comma separated
    #[arg(long, value_delimiter = ',')]
    pub field_names: Vec<String>,

    /// Input format
    #[arg(long, value_enum)]
    pub format: Option<InputFormat>,

    /// Force CSV fallback (skip binary parsing)
    #[arg(long)]
    pub force_text: bool,

    /// CSV delimiter for input and output
    #[arg(long)]
    pub delimiter: Option<char>,

    /// Field used to form strata
    #[arg(long)]
    pub stratum_field: Option<String>,

    /// Report output directory (default: ./report)
    #[arg(long, env = "HETL_REPORT_DIR")]
    pub report_dir: Option<PathBuf>,

    /// Audit log path (default: .hetl/audit.jsonl)
    #[arg(long, env = "HETL_AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Job wall-clock limit in seconds (default: 3600)
    #[arg(long, env = "HETL_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Retries for a failed chunk (default: 1)
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Include a SHA-256 of the input in the report
    #[arg(long)]
    pub checksum: bool,

    /// Job name recorded in the report and audit trail
    #[arg(long)]
    pub job_name: Option<String>,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

/// Options of `hetl layout`
#[derive(Args, Debug, Clone, Default)]
pub struct LayoutArgs {
    /// Job configuration file (TOML)
    #[arg(short, long, env = "HETL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Record layout as a struct format string
    #[arg(long)]
    pub record_struct: Option<String>,

    /// Field names for --record-struct, comma separated
    #[arg(long, value_delimiter = ',')]
    pub field_names: Vec<String>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Audit trail subcommands
#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Verify audit trail integrity
    Verify {
        /// Audit log path
        #[arg(long, env = "HETL_AUDIT_LOG", default_value = config::DEFAULT_AUDIT_LOG)]
        log: PathBuf,
    },
}
