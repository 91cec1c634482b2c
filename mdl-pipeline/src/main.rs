//! mdl-pipeline - incremental media processing pipeline
//!
//! Subcommands:
//! - `run`: execute the phase sequence over a project directory
//! - `status`: print the stored per-phase completion counts
//! - `analyze-worker` (hidden): analyze one file and print the report as
//!   JSON, used by the process-scheduled analysis sweep

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdl_common::config::{LoggingConfig, PipelineConfig, STATS_FILE_NAME, STATE_FILE_NAME};
use mdl_pipeline::models::StateSummary;
use mdl_pipeline::processors::SignalStatsAnalyzer;
use mdl_pipeline::services::analysis_sweep::WORKER_SUBCOMMAND;
use mdl_pipeline::services::{ChunkedAnalysisRunner, FileStateStore, SystemMemoryProbe};
use mdl_pipeline::{PipelineOrchestrator, Step};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ", ",
    env!("BUILD_PROFILE"),
    ")"
);

#[derive(Parser)]
#[command(name = "mdl-pipeline", version, long_version = LONG_VERSION)]
#[command(about = "Incremental audio collection processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline phases
    Run {
        /// Configuration file (relative paths resolve against the project directory)
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,

        /// Project root holding the collection, state and statistics
        #[arg(long, env = "MDL_PROJECT_DIR", default_value = ".")]
        project_dir: PathBuf,

        /// Steps to skip: download, validate, features, metadata
        #[arg(long, value_delimiter = ',')]
        skip: Vec<Step>,
    },

    /// Print stored processing state
    Status {
        #[arg(long, env = "MDL_PROJECT_DIR", default_value = ".")]
        project_dir: PathBuf,
    },

    /// Analyze one file and print the report as JSON
    #[command(name = WORKER_SUBCOMMAND, hide = true)]
    AnalyzeWorker {
        file: PathBuf,

        #[arg(long, default_value_t = 30.0)]
        chunk_seconds: f64,

        #[arg(long, default_value_t = 1024)]
        memory_ceiling_mb: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Run {
            config,
            project_dir,
            skip,
        } => run(&config, &project_dir, &skip).await,
        Command::Status { project_dir } => status(&project_dir),
        Command::AnalyzeWorker {
            file,
            chunk_seconds,
            memory_ceiling_mb,
        } => analyze_worker(&file, chunk_seconds, memory_ceiling_mb),
    }
}

async fn run(config_path: &Path, project_dir: &Path, skip: &[Step]) -> Result<()> {
    let config_path = if config_path.is_absolute() {
        config_path.to_path_buf()
    } else {
        project_dir.join(config_path)
    };
    let config = PipelineConfig::load(&config_path)?;

    init_logging(&config.logging, project_dir)?;
    info!(
        version = LONG_VERSION,
        project = %project_dir.display(),
        config = %config_path.display(),
        "Starting pipeline"
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight files");
            ctrl_c.cancel();
        }
    });

    let orchestrator = PipelineOrchestrator::new(config, project_dir)?.with_cancellation(cancel);
    let stats = orchestrator.run(skip).await?;

    for (phase, phase_stats) in &stats.phases {
        info!(phase = %phase, result = %phase_stats.display_string(), "Phase summary");
    }
    if !stats.errors.is_empty() {
        warn!(errors = stats.errors.len(), "Some files failed, see {}", STATS_FILE_NAME);
    }
    Ok(())
}

fn status(project_dir: &Path) -> Result<()> {
    let state = FileStateStore::load_read_only(&project_dir.join(STATE_FILE_NAME));
    let summary = StateSummary::from_state(&state);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Child side of the process-scheduled sweep
///
/// Logging stays off so stdout carries only the report.
fn analyze_worker(file: &Path, chunk_seconds: f64, memory_ceiling_mb: u64) -> Result<()> {
    let runner = ChunkedAnalysisRunner::new(
        chunk_seconds,
        memory_ceiling_mb.saturating_mul(1024 * 1024),
        Arc::new(SystemMemoryProbe::new()),
    );
    let report = runner
        .analyze_file(file, &SignalStatsAnalyzer)
        .with_context(|| format!("Failed to analyze {}", file.display()))?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

/// Console output plus an optional log file
///
/// `RUST_LOG` overrides the configured level.
fn init_logging(logging: &LoggingConfig, project_dir: &Path) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let file_layer = match &logging.file {
        Some(file) => {
            let path = project_dir.join(file);
            let writer = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(writer)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(())
}
