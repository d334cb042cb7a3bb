//! Offline replay harness
//!
//! The harness coordinates:
//! - Finding trace files
//! - Loading each trace into fresh replay proxies
//! - Handing the loaded unit to a [`UnitReplayer`]
//! - Reporting per-file outcomes and benchmark timings
//!
//! # Example
//!
//! ```rust,no_run
//! use replaycomp_core::harness::{TraceLoader, TraceVerifier, discover_traces, run_replay};
//! # fn example(declarations: std::sync::Arc<replaycomp_core::declarations::Declarations>) -> replaycomp_core::Result<()> {
//! let loader = TraceLoader::new(declarations)?;
//! let traces = discover_traces("traces/", "json")?;
//! let summary = run_replay(&loader, &TraceVerifier, &traces, false);
//! assert!(summary.passed());
//! # Ok(())
//! # }
//! ```

mod loader;
mod runner;
mod verifier;

pub use loader::{LoadedUnit, TraceLoader};
pub use runner::{
    BenchmarkConfig, BenchmarkReport, BenchmarkResult, ReplayFileResult, ReplayStatus,
    ReplaySummary, run_benchmark, run_replay,
};
pub use verifier::{TraceVerifier, UnitReplayer};

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{ReplayCompError, Result};

/// Trace files under `path`, sorted
///
/// A file is returned as-is whatever its extension; a directory is walked
/// recursively for files ending in `.extension`.
pub fn discover_traces(path: impl AsRef<Path>, extension: &str) -> Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(ReplayCompError::Configuration(format!(
            "{} is neither a trace file nor a directory",
            path.display()
        )));
    }
    let extension = extension.trim_start_matches('.');
    let mut traces = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|e| e == extension)
        {
            traces.push(entry.into_path());
        }
    }
    traces.sort();
    Ok(traces)
}
