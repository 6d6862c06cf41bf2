//! Stratified sample estimation
//!
//! Totals are estimated from a stratified random sample instead of a full
//! aggregation pass. The source is read twice:
//!
//! 1. count the population of every stratum;
//! 2. draw a uniform sample without replacement from each stratum with a
//!    seeded reservoir.
//!
//! Sample sizes follow square-root allocation: a stratum of `N_s` records
//! gets a share of the sample budget proportional to `sqrt(N_s)`, with at
//! least one record per stratum and never more than `N_s`. Each sampled
//! record is weighted by the expansion factor `N_s / n_s`.

use crate::codec::{FieldValue, Record, RecordCodec};
use crate::layout::RecordLayout;
use crate::parser::CsvRowParser;
use crate::reader::{StreamReader, TextChunkReader};
use hetl_common::{EtlError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// z-score of a two-sided 95% interval
pub const Z_95: f64 = 1.96;

/// Seed used when none is configured
pub const DEFAULT_SEED: u64 = 42;

/// Records read by one pass over a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub records: u64,
    /// Records that could not be decoded and were skipped
    pub rejected: u64,
}

/// A restartable, deterministic sequence of records
///
/// Every call to `scan` must visit the same records in the same order.
/// File-backed sources check `cancel` between chunks and stop with
/// [`EtlError::Cancelled`] once it fires.
pub trait RecordSource {
    fn scan(&self, cancel: &CancellationToken, visit: &mut dyn FnMut(&Record)) -> Result<ScanStats>;
}

fn check_cancelled(cancel: &CancellationToken, stats: &ScanStats) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(EtlError::Cancelled {
            records_written: stats.records,
        });
    }
    Ok(())
}

impl RecordSource for [Record] {
    fn scan(&self, cancel: &CancellationToken, visit: &mut dyn FnMut(&Record)) -> Result<ScanStats> {
        check_cancelled(cancel, &ScanStats::default())?;
        self.iter().for_each(|r| visit(r));
        Ok(ScanStats {
            records: self.len() as u64,
            rejected: 0,
        })
    }
}

impl RecordSource for Vec<Record> {
    fn scan(&self, cancel: &CancellationToken, visit: &mut dyn FnMut(&Record)) -> Result<ScanStats> {
        self.as_slice().scan(cancel, visit)
    }
}

/// Binary records re-read from disk chunk by chunk
pub struct BinaryFileSource {
    path: PathBuf,
    codec: RecordCodec,
    chunk_size: u64,
    base_offset: u64,
}

impl BinaryFileSource {
    pub fn new(path: impl Into<PathBuf>, layout: Arc<RecordLayout>, chunk_size: u64, base_offset: u64) -> Self {
        Self {
            path: path.into(),
            codec: RecordCodec::new(layout),
            chunk_size,
            base_offset,
        }
    }
}

impl RecordSource for BinaryFileSource {
    fn scan(&self, cancel: &CancellationToken, visit: &mut dyn FnMut(&Record)) -> Result<ScanStats> {
        let reader = StreamReader::open(
            &self.path,
            self.codec.record_size(),
            self.chunk_size,
            self.base_offset,
        )?;
        let mut stats = ScanStats::default();
        for item in reader {
            check_cancelled(cancel, &stats)?;
            let (_, bytes) = item?;
            for span in bytes.chunks_exact(self.codec.record_size()) {
                match self.codec.decode(span) {
                    Ok(record) => {
                        stats.records += 1;
                        visit(&record);
                    }
                    Err(_) => stats.rejected += 1,
                }
            }
        }
        Ok(stats)
    }
}

/// Delimited text rows re-read from disk
pub struct CsvFileSource {
    path: PathBuf,
    layout: Arc<RecordLayout>,
    delimiter: u8,
    rows_per_chunk: usize,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>, layout: Arc<RecordLayout>, delimiter: u8, rows_per_chunk: usize) -> Self {
        Self {
            path: path.into(),
            layout,
            delimiter,
            rows_per_chunk,
        }
    }
}

impl RecordSource for CsvFileSource {
    fn scan(&self, cancel: &CancellationToken, visit: &mut dyn FnMut(&Record)) -> Result<ScanStats> {
        let reader = TextChunkReader::open(&self.path, self.delimiter, self.rows_per_chunk)?;
        let parser = CsvRowParser::new(self.layout.clone(), reader.headers())?;
        let mut stats = ScanStats::default();
        for item in reader {
            check_cancelled(cancel, &stats)?;
            let (_, rows) = item?;
            for row in &rows {
                match parser.convert_row(row) {
                    Ok(record) => {
                        stats.records += 1;
                        visit(&record);
                    }
                    Err(_) => stats.rejected += 1,
                }
            }
        }
        Ok(stats)
    }
}

/// Several sources scanned back to back
#[derive(Default)]
pub struct ChainedSource {
    sources: Vec<Box<dyn RecordSource + Send + Sync>>,
}

impl ChainedSource {
    pub fn new(sources: Vec<Box<dyn RecordSource + Send + Sync>>) -> Self {
        Self { sources }
    }
}

impl RecordSource for ChainedSource {
    fn scan(&self, cancel: &CancellationToken, visit: &mut dyn FnMut(&Record)) -> Result<ScanStats> {
        let mut total = ScanStats::default();
        for source in &self.sources {
            let stats = source.scan(cancel, visit)?;
            total.records += stats.records;
            total.rejected += stats.rejected;
        }
        Ok(total)
    }
}

/// A named numeric quantity extracted from each record
pub struct Metric {
    name: String,
    extract: Box<dyn Fn(&Record) -> Option<f64> + Send + Sync>,
}

impl Metric {
    pub fn new(
        name: impl Into<String>,
        extract: impl Fn(&Record) -> Option<f64> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            extract: Box::new(extract),
        }
    }

    /// Numeric field at `index`, multiplied by `scale`
    pub fn field(name: impl Into<String>, index: usize, scale: f64) -> Self {
        Self::new(name, move |r: &Record| {
            r.get(index).and_then(FieldValue::as_f64).map(|v| v * scale)
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extract(&self, record: &Record) -> Option<f64> {
        (self.extract)(record)
    }
}

impl std::fmt::Debug for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric").field("name", &self.name).finish()
    }
}

/// Stratum key taken from the field at `index`
pub fn stratum_by_field(index: usize) -> impl Fn(&Record) -> Option<String> + Send + Sync {
    move |r: &Record| r.get(index).map(|v| v.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationStatus {
    Complete,
    /// No eligible records: nothing was estimated
    Degenerate,
}

/// Population and sample of one stratum
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumSummary {
    pub key: String,
    pub population: u64,
    pub sample_size: u64,
    pub expansion_factor: f64,
}

/// Estimated population total of one metric
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricEstimate {
    pub name: String,
    pub estimate: f64,
    pub standard_error: f64,
    pub ci95_low: f64,
    pub ci95_high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimationResult {
    pub status: EstimationStatus,
    pub target_sample_fraction: f64,
    /// Sample size divided by population size
    pub sample_fraction: f64,
    pub population: u64,
    pub sample_size: u64,
    /// Records without a usable stratum key or metric value
    pub records_skipped: u64,
    pub seed: u64,
    pub strata: Vec<StratumSummary>,
    pub metrics: Vec<MetricEstimate>,
}

impl EstimationResult {
    pub fn metric(&self, name: &str) -> Option<&MetricEstimate> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Square-root allocation of a sample budget across strata
///
/// `budget = max(1, round(f * N))` and
/// `n_s = max(1, round(budget * sqrt(N_s) / sum_k sqrt(N_k)))`, capped at
/// `N_s`. With `f >= 1` every stratum is taken whole.
pub fn allocate(populations: &BTreeMap<String, u64>, fraction: f64) -> BTreeMap<String, u64> {
    let total: u64 = populations.values().sum();
    if fraction >= 1.0 {
        return populations.clone();
    }

    let budget = ((fraction * total as f64).round() as u64).max(1) as f64;
    let sqrt_sum: f64 = populations.values().map(|&n| (n as f64).sqrt()).sum();

    populations
        .iter()
        .map(|(key, &n)| {
            let share = budget * (n as f64).sqrt() / sqrt_sum;
            let size = (share.round() as u64).max(1).min(n);
            (key.clone(), size)
        })
        .collect()
}

struct Reservoir {
    capacity: usize,
    seen: u64,
    items: Vec<Vec<f64>>,
}

impl Reservoir {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: 0,
            items: Vec::with_capacity(capacity),
        }
    }

    // Algorithm R
    fn offer(&mut self, values: Vec<f64>, rng: &mut StdRng) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(values);
        } else {
            let j = rng.random_range(0..self.seen);
            if (j as usize) < self.capacity {
                self.items[j as usize] = values;
            }
        }
    }
}

/// Two-pass stratified estimator
#[derive(Debug, Clone)]
pub struct StratifiedEstimator {
    target_sample_fraction: f64,
    seed: u64,
    cancel: CancellationToken,
}

impl StratifiedEstimator {
    pub fn new(target_sample_fraction: f64) -> Self {
        Self {
            target_sample_fraction,
            seed: DEFAULT_SEED,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop scanning sources once `token` fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Estimate population totals of `metrics`
    ///
    /// Records for which the stratum key or any metric is `None` are
    /// skipped in both passes.
    pub fn estimate<S, K>(
        &self,
        source: &S,
        stratum_key: K,
        metrics: &[Metric],
    ) -> Result<EstimationResult>
    where
        S: RecordSource + ?Sized,
        K: Fn(&Record) -> Option<String>,
    {
        let f = self.target_sample_fraction;
        if !f.is_finite() || f < 0.0 {
            return Err(EtlError::config(format!(
                "sample fraction must be within [0, 1], got {f}"
            )));
        }

        let eligible = |record: &Record| -> Option<(String, Vec<f64>)> {
            let key = stratum_key(record)?;
            let values = metrics
                .iter()
                .map(|m| m.extract(record))
                .collect::<Option<Vec<f64>>>()?;
            Some((key, values))
        };

        // Pass 1: population per stratum
        let mut populations: BTreeMap<String, u64> = BTreeMap::new();
        let mut skipped = 0u64;
        let first = source.scan(&self.cancel, &mut |record| match eligible(record) {
            Some((key, _)) => *populations.entry(key).or_insert(0) += 1,
            None => skipped += 1,
        })?;

        let population: u64 = populations.values().sum();
        debug!(
            population,
            strata = populations.len(),
            skipped,
            rejected = first.rejected,
            "Counted strata"
        );

        if population == 0 {
            info!("No eligible records; estimation is degenerate");
            return Ok(EstimationResult {
                status: EstimationStatus::Degenerate,
                target_sample_fraction: f,
                sample_fraction: 0.0,
                population: 0,
                sample_size: 0,
                records_skipped: skipped,
                seed: self.seed,
                strata: Vec::new(),
                metrics: Vec::new(),
            });
        }

        let allocation = allocate(&populations, f);

        // Pass 2: per-stratum reservoirs
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut reservoirs: BTreeMap<&str, Reservoir> = allocation
            .iter()
            .map(|(k, &n)| (k.as_str(), Reservoir::new(n as usize)))
            .collect();
        source.scan(&self.cancel, &mut |record| {
            if let Some((key, values)) = eligible(record) {
                if let Some(reservoir) = reservoirs.get_mut(key.as_str()) {
                    reservoir.offer(values, &mut rng);
                }
            }
        })?;

        let mut strata = Vec::with_capacity(populations.len());
        let mut totals = vec![0.0f64; metrics.len()];
        let mut variances = vec![0.0f64; metrics.len()];

        for (key, &n_pop) in &populations {
            let reservoir = reservoirs
                .get(key.as_str())
                .ok_or_else(|| EtlError::Estimation(format!("stratum '{key}' has no reservoir")))?;
            if reservoir.seen != n_pop {
                return Err(EtlError::Estimation(format!(
                    "source changed between passes: stratum '{key}' had {n_pop} records, then {}",
                    reservoir.seen
                )));
            }

            let n = reservoir.items.len() as u64;
            let expansion = n_pop as f64 / n as f64;
            let fpc = 1.0 - n as f64 / n_pop as f64;

            for m in 0..metrics.len() {
                let sum: f64 = reservoir.items.iter().map(|v| v[m]).sum();
                totals[m] += expansion * sum;

                if n >= 2 {
                    let mean = sum / n as f64;
                    let ss: f64 = reservoir
                        .items
                        .iter()
                        .map(|v| (v[m] - mean).powi(2))
                        .sum();
                    let s2 = ss / (n - 1) as f64;
                    variances[m] += (n_pop as f64).powi(2) * fpc * s2 / n as f64;
                }
            }

            strata.push(StratumSummary {
                key: key.clone(),
                population: n_pop,
                sample_size: n,
                expansion_factor: expansion,
            });
        }

        let sample_size: u64 = strata.iter().map(|s| s.sample_size).sum();
        let estimates = metrics
            .iter()
            .zip(totals.iter().zip(&variances))
            .map(|(metric, (&estimate, &variance))| {
                let standard_error = variance.max(0.0).sqrt();
                MetricEstimate {
                    name: metric.name().to_string(),
                    estimate,
                    standard_error,
                    ci95_low: estimate - Z_95 * standard_error,
                    ci95_high: estimate + Z_95 * standard_error,
                }
            })
            .collect();

        info!(
            population,
            sample_size,
            strata = strata.len(),
            "Stratified estimation complete"
        );

        Ok(EstimationResult {
            status: EstimationStatus::Complete,
            target_sample_fraction: f,
            sample_fraction: sample_size as f64 / population as f64,
            population,
            sample_size,
            records_skipped: skipped,
            seed: self.seed,
            strata,
            metrics: estimates,
        })
    }
}
