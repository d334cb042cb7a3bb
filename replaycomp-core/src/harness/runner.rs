//! Batch replay and benchmarking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{LoadedUnit, TraceLoader, UnitReplayer};
use crate::error::{ReplayCompError, Result};

/// Outcome of replaying one trace file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ReplayStatus {
    Success,
    /// The trace is incomplete, typically because recording was cut short
    Skipped(String),
    Failed(String),
}

/// Result of replaying one trace file
#[derive(Debug, Clone)]
pub struct ReplayFileResult {
    pub path: PathBuf,
    pub status: ReplayStatus,
    pub duration: Duration,
}

impl ReplayFileResult {
    pub fn passed(&self) -> bool {
        self.status == ReplayStatus::Success
    }
}

/// Results of a batch replay
#[derive(Debug, Clone, Default)]
pub struct ReplaySummary {
    pub results: Vec<ReplayFileResult>,

    /// Why the batch stopped early, if it did
    pub aborted: Option<String>,
}

impl ReplaySummary {
    /// Whether every file replayed successfully and the batch ran to the end
    pub fn passed(&self) -> bool {
        self.aborted.is_none() && self.results.iter().all(ReplayFileResult::passed)
    }

    pub fn successes(&self) -> usize {
        self.count(|s| matches!(s, ReplayStatus::Success))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, ReplayStatus::Skipped(_)))
    }

    pub fn failures(&self) -> usize {
        self.count(|s| matches!(s, ReplayStatus::Failed(_)))
    }

    fn count(&self, predicate: impl Fn(&ReplayStatus) -> bool) -> usize {
        self.results.iter().filter(|r| predicate(&r.status)).count()
    }
}

/// Load and replay one file; the artifact comparison only runs when the
/// replayer produced an artifact
fn replay_file(
    loader: &TraceLoader,
    replayer: &dyn UnitReplayer,
    path: &Path,
    compare_artifacts: bool,
) -> Result<LoadedUnit> {
    let loaded = loader.load(path)?;
    let produced = replayer.replay(&loaded)?;
    if compare_artifacts
        && let Some(produced) = produced
        && loaded.unit.final_artifact.as_deref() != Some(produced.as_str())
    {
        return Err(ReplayCompError::Other(format!(
            "artifact of unit {} differs from the recorded one",
            loaded.unit.unit_id
        )));
    }
    Ok(loaded)
}

/// Replay every file in `paths`
///
/// Incomplete traces are skipped. A trace recorded on another platform
/// aborts the batch, since every later trace will most likely fail the same
/// way.
pub fn run_replay(
    loader: &TraceLoader,
    replayer: &dyn UnitReplayer,
    paths: &[PathBuf],
    compare_artifacts: bool,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for path in paths {
        let start = Instant::now();
        let status = match replay_file(loader, replayer, path, compare_artifacts) {
            Ok(_) => ReplayStatus::Success,
            Err(e) if e.is_incomplete_trace() => {
                warn!(path = %path.display(), error = %e, "Skipping incomplete trace");
                ReplayStatus::Skipped(e.to_string())
            }
            Err(e) if e.is_incompatibility() => {
                summary.results.push(ReplayFileResult {
                    path: path.clone(),
                    status: ReplayStatus::Failed(e.to_string()),
                    duration: start.elapsed(),
                });
                summary.aborted = Some(e.to_string());
                break;
            }
            Err(e) => ReplayStatus::Failed(e.to_string()),
        };
        summary.results.push(ReplayFileResult {
            path: path.clone(),
            status,
            duration: start.elapsed(),
        });
    }
    info!(
        files = summary.results.len(),
        successes = summary.successes(),
        skipped = summary.skipped(),
        failures = summary.failures(),
        "Replay finished"
    );
    summary
}

/// Configuration for a benchmark run
#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Replays per file
    pub iterations: usize,

    /// Write the report as JSON to this file
    pub results_file: Option<PathBuf>,

    pub compare_artifacts: bool,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            results_file: None,
            compare_artifacts: false,
        }
    }
}

/// Timings of one trace file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub path: PathBuf,

    /// SHA-256 of the trace file
    pub digest: String,

    pub iterations: usize,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
}

/// Results of a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub timestamp: DateTime<Utc>,
    pub results: Vec<BenchmarkResult>,

    /// Files that failed or were skipped, with the reason
    pub failures: Vec<(PathBuf, String)>,
}

impl BenchmarkReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

fn file_digest(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Replay every file `iterations` times, loading it afresh each time
///
/// Fails only when the report cannot be written; per-file problems are
/// collected in [`BenchmarkReport::failures`].
pub fn run_benchmark(
    loader: &TraceLoader,
    replayer: &dyn UnitReplayer,
    paths: &[PathBuf],
    config: &BenchmarkConfig,
) -> Result<BenchmarkReport> {
    if config.iterations == 0 {
        return Err(ReplayCompError::Configuration(
            "benchmark needs at least one iteration".into(),
        ));
    }
    let mut report = BenchmarkReport {
        timestamp: Utc::now(),
        results: Vec::new(),
        failures: Vec::new(),
    };

    'files: for path in paths {
        let digest = match file_digest(path) {
            Ok(digest) => digest,
            Err(e) => {
                report.failures.push((path.clone(), e.to_string()));
                continue;
            }
        };
        let mut timings = Vec::with_capacity(config.iterations);
        for _ in 0..config.iterations {
            let start = Instant::now();
            if let Err(e) = replay_file(loader, replayer, path, config.compare_artifacts) {
                warn!(path = %path.display(), error = %e, "Benchmark replay failed");
                report.failures.push((path.clone(), e.to_string()));
                continue 'files;
            }
            timings.push(start.elapsed());
        }
        let total: Duration = timings.iter().sum();
        report.results.push(BenchmarkResult {
            path: path.clone(),
            digest,
            iterations: timings.len(),
            min_ms: timings.iter().copied().map(millis).fold(f64::INFINITY, f64::min),
            mean_ms: millis(total) / timings.len() as f64,
            max_ms: timings.iter().copied().map(millis).fold(0.0, f64::max),
        });
    }

    if let Some(results_file) = &config.results_file {
        report.save(results_file)?;
        info!(path = %results_file.display(), "Wrote benchmark results");
    }
    Ok(report)
}
