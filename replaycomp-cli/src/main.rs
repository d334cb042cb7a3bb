//! Replaycomp CLI - replay and benchmark recorded traces

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replaycomp_core::config::ReplayCompConfig;
use replaycomp_core::harness::{
    BenchmarkConfig, ReplayStatus, TraceLoader, TraceVerifier, discover_traces, run_benchmark,
    run_replay,
};
use replaycomp_core::manifest::DeclarationManifest;
use replaycomp_core::proxy::ReplayOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "replaycomp")]
#[command(about = "Replay recorded compilation traces offline", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a trace file or every trace in a directory
    Replay {
        /// Trace file or directory
        path: PathBuf,

        /// Declaration manifest (toml, yaml or json)
        #[arg(short, long, env = "REPLAYCOMP_DECLARATIONS")]
        declarations: PathBuf,

        /// Compare produced artifacts with the recorded ones
        #[arg(long)]
        compare_artifacts: bool,

        /// Treat calls without a recorded result as failures
        #[arg(long)]
        strict: bool,
    },
    /// Replay traces repeatedly and report timings
    Bench {
        /// Trace file or directory
        path: PathBuf,

        /// Declaration manifest (toml, yaml or json)
        #[arg(short, long, env = "REPLAYCOMP_DECLARATIONS")]
        declarations: PathBuf,

        /// Replays per trace
        #[arg(short, long, default_value_t = 10)]
        iterations: usize,

        /// Write results as JSON to this file
        #[arg(long)]
        results_file: Option<PathBuf>,

        /// Treat calls without a recorded result as failures
        #[arg(long)]
        strict: bool,
    },
    /// Version information
    Version,
}

fn build_loader(declarations: &Path, strict: bool) -> Result<TraceLoader> {
    let manifest = DeclarationManifest::load(declarations)
        .with_context(|| format!("loading declarations from {}", declarations.display()))?;
    let declarations = Arc::new(manifest.to_declarations()?);
    let options = ReplayOptions {
        divergence_is_failure: strict,
    };
    Ok(TraceLoader::new(declarations)?.with_options(options))
}

fn traces(path: &Path, config: &ReplayCompConfig) -> Result<Vec<PathBuf>> {
    let traces = discover_traces(path, &config.replay.trace_extension)?;
    if traces.is_empty() {
        anyhow::bail!("no traces found under {}", path.display());
    }
    Ok(traces)
}

fn replay(
    config: ReplayCompConfig,
    path: PathBuf,
    declarations: PathBuf,
    compare_artifacts: bool,
    strict: bool,
) -> Result<bool> {
    let loader = build_loader(&declarations, strict || config.replay.divergence_is_failure)?;
    let traces = traces(&path, &config)?;
    let summary = run_replay(
        &loader,
        &TraceVerifier,
        &traces,
        compare_artifacts || config.replay.compare_artifacts,
    );

    for result in &summary.results {
        match &result.status {
            ReplayStatus::Success => println!(
                "ok       {} ({} ms)",
                result.path.display(),
                result.duration.as_millis()
            ),
            ReplayStatus::Skipped(reason) => {
                println!("skipped  {}: {}", result.path.display(), reason)
            }
            ReplayStatus::Failed(reason) => {
                println!("FAILED   {}: {}", result.path.display(), reason)
            }
        }
    }
    if let Some(reason) = &summary.aborted {
        println!("aborted: {}", reason);
    }
    println!(
        "{} traces: {} succeeded, {} skipped, {} failed",
        summary.results.len(),
        summary.successes(),
        summary.skipped(),
        summary.failures()
    );
    Ok(summary.passed())
}

fn bench(
    config: ReplayCompConfig,
    path: PathBuf,
    declarations: PathBuf,
    iterations: usize,
    results_file: Option<PathBuf>,
    strict: bool,
) -> Result<bool> {
    let loader = build_loader(&declarations, strict || config.replay.divergence_is_failure)?;
    let traces = traces(&path, &config)?;
    let bench_config = BenchmarkConfig {
        iterations,
        results_file,
        compare_artifacts: config.replay.compare_artifacts,
    };
    let report = run_benchmark(&loader, &TraceVerifier, &traces, &bench_config)?;

    for result in &report.results {
        println!(
            "{}  min {:.3} ms  mean {:.3} ms  max {:.3} ms  ({} runs, sha256 {})",
            result.path.display(),
            result.min_ms,
            result.mean_ms,
            result.max_ms,
            result.iterations,
            &result.digest[..12.min(result.digest.len())]
        );
    }
    for (path, reason) in &report.failures {
        println!("FAILED   {}: {}", path.display(), reason);
    }
    println!(
        "{} traces benchmarked, {} failed",
        report.results.len(),
        report.failures.len()
    );
    Ok(report.passed())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let passed = match cli.command {
        Commands::Version => {
            println!("replaycomp {}", env!("CARGO_PKG_VERSION"));
            println!("replaycomp-core {}", replaycomp_core::VERSION);
            true
        }
        Commands::Replay {
            path,
            declarations,
            compare_artifacts,
            strict,
        } => {
            let config = ReplayCompConfig::load()?;
            tokio::task::spawn_blocking(move || {
                replay(config, path, declarations, compare_artifacts, strict)
            })
            .await??
        }
        Commands::Bench {
            path,
            declarations,
            iterations,
            results_file,
            strict,
        } => {
            let config = ReplayCompConfig::load()?;
            tokio::task::spawn_blocking(move || {
                bench(config, path, declarations, iterations, results_file, strict)
            })
            .await??
        }
    };

    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
