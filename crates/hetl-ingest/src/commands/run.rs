//! `hetl run` command implementation

use crate::config::JobConfig;
use crate::job::{JobOutcome, JobRunner};
use crate::progress::{create_chunk_progress, format_bytes};
use crate::RunArgs;
use colored::Colorize;
use hetl_common::Result;
use tokio_util::sync::CancellationToken;

/// Field names of the sales layout, used when `--record-struct` comes alone
const SALES_FIELD_NAMES: &[&str] = &["id", "timestamp", "quantity", "value_cents", "product"];

/// Run a job and print its summary
///
/// Fails when the job could not start or stopped with a fatal error.
/// Rejected records and failed chunks only show up in the summary.
pub async fn run(args: &RunArgs, cancel: CancellationToken) -> Result<()> {
    let config = job_config(args)?;
    let progress = create_chunk_progress("Ingesting chunks", !args.no_progress);

    println!("{} Starting job '{}'", "→".cyan(), config.job_name);
    let outcome = JobRunner::new(config)
        .with_cancellation(cancel)
        .with_progress(progress)
        .run()
        .await?;

    print_summary(&outcome);

    match outcome.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Merge `--config` with the command-line overrides
pub fn job_config(args: &RunArgs) -> Result<JobConfig> {
    let mut config = match &args.config {
        Some(path) => JobConfig::from_toml_file(path)?,
        None => JobConfig::default(),
    };

    if let Some(input) = &args.input {
        config.input = Some(input.clone());
    }
    if let Some(output) = &args.output_csv {
        config.output_csv = Some(output.clone());
    }
    if let Some(parquet) = &args.parquet_out {
        config.output_parquet = Some(parquet.clone());
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(chunk) = args.chunk_bytes {
        config.chunk_bytes = chunk;
    }
    if let Some(header) = args.header_bytes {
        config.header_bytes = header;
    }
    if let Some(fraction) = args.sample_frac {
        config.sample_fraction = fraction;
    }
    if let Some(seed) = args.seed {
        config.sample_seed = seed;
    }
    if let Some(format) = args.format {
        config.input_format = format;
    }
    if let Some(delimiter) = args.delimiter {
        config.delimiter = delimiter;
    }
    if let Some(field) = &args.stratum_field {
        config.stratum_field = field.clone();
    }
    if let Some(dir) = &args.report_dir {
        config.report_dir = dir.clone();
    }
    if let Some(log) = &args.audit_log {
        config.audit_log = log.clone();
    }
    if let Some(secs) = args.timeout_secs {
        config.job_timeout_secs = secs;
    }
    if let Some(retries) = args.max_retries {
        config.max_chunk_retries = retries;
    }
    if let Some(name) = &args.job_name {
        config.job_name = name.clone();
    }
    config.force_text |= args.force_text;
    config.no_parquet |= args.no_parquet;
    config.checksum_input |= args.checksum;
    apply_record_struct(&mut config, args.record_struct.as_deref(), &args.field_names);

    Ok(config)
}

/// Replace the configured layout with a struct format string
pub fn apply_record_struct(config: &mut JobConfig, record_struct: Option<&str>, names: &[String]) {
    let Some(format) = record_struct else {
        return;
    };
    config.layout.fields.clear();
    config.layout.byte_order = None;
    config.layout.format = Some(format.to_string());
    config.layout.field_names = if names.is_empty() {
        SALES_FIELD_NAMES.iter().map(|s| s.to_string()).collect()
    } else {
        names.to_vec()
    };
}

fn print_summary(outcome: &JobOutcome) {
    let report = &outcome.report;
    println!();
    match report.status.as_str() {
        "completed" => println!("{} Job completed", "✓".green().bold()),
        "incomplete" => println!("{} Job incomplete", "!".yellow().bold()),
        _ => println!("{} Job failed", "✗".red().bold()),
    }

    if let Some(ingestion) = &report.ingestion {
        println!("  Records written:  {}", ingestion.records_ok);
        if ingestion.records_rejected > 0 {
            println!(
                "  Records rejected: {}",
                ingestion.records_rejected.to_string().yellow()
            );
        }
        println!("  Bytes processed:  {}", format_bytes(ingestion.bytes_processed));
        println!(
            "  Chunks:           {} ok, {} failed, {} retries",
            ingestion.chunks_ok, ingestion.chunks_failed, ingestion.chunk_retries
        );
        for tail in &ingestion.truncated_tails {
            println!(
                "  {} {} trailing bytes ignored in {}",
                "→".yellow(),
                tail.bytes,
                tail.path.display()
            );
        }
        for output in &ingestion.outputs {
            println!("  Output:           {}", output.path.display());
            if let Some(backup) = &output.backup {
                println!("  {} previous file kept as {}", "→".cyan(), backup.display());
            }
        }
    }

    if let Some(estimation) = &report.estimation {
        println!(
            "  Sample:           {} of {} records ({:.4}%)",
            estimation.sample_size,
            estimation.population,
            estimation.sample_fraction * 100.0
        );
        for metric in &estimation.metrics {
            println!(
                "  {:<17} {:.2} ± {:.2} (95% CI {:.2} .. {:.2})",
                format!("{}:", metric.name),
                metric.estimate,
                metric.standard_error,
                metric.ci95_low,
                metric.ci95_high
            );
        }
    }
    if let Some(error) = &report.estimation_error {
        println!("  {} estimation failed: {error}", "→".yellow());
    }

    println!("  Elapsed:          {:.2}s", report.elapsed_secs);
    match (&outcome.report_path, &outcome.report_error) {
        (Some(path), _) => println!("  Report:           {}", path.display()),
        (None, Some(e)) => println!("  {} report not written: {e}", "✗".red()),
        (None, None) => {}
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            "input = \"a.bin\"\noutput_csv = \"a.csv\"\nworkers = 2\nsample_fraction = 0.1\n",
        )
        .unwrap();

        let args = RunArgs {
            config: Some(path),
            workers: Some(6),
            checksum: true,
            ..Default::default()
        };
        let config = job_config(&args).unwrap();
        assert_eq!(config.input, Some(PathBuf::from("a.bin")));
        assert_eq!(config.workers, 6);
        assert_eq!(config.sample_fraction, 0.1);
        assert!(config.checksum_input);
    }

    #[test]
    fn test_record_struct_defaults_to_sales_names() {
        let mut config = JobConfig::default();
        apply_record_struct(&mut config, Some("<IQIq32s"), &[]);
        let layout = config.layout.resolve().unwrap();
        assert_eq!(layout.record_size(), 56);
        assert!(layout.field("value_cents").is_some());
    }
}
