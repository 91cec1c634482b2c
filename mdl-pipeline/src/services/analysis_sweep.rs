//! Parallel analysis sweep
//!
//! Runs memory-heavy chunked analysis over many files with a fixed worker
//! pool, one group of files at a time, forcing a reclaim pass between
//! groups.
//!
//! # Scheduling
//! - **Threads:** each file analyzed in-process on a rayon pool worker
//! - **Processes:** each file analyzed by a child `analyze-worker` process of
//!   the pipeline binary; its memory is returned to the OS when it exits.
//!   Pool threads only wait on children.
//!
//! Per-file reports are merged into a [`SweepSummary`] with running sums
//! and counts, so dataset means are weighted by chunk count.

use crate::services::chunked_analysis::{
    AnalysisError, AnalysisReport, ChunkAnalyzer, ChunkedAnalysisRunner, MetricTotals,
};
use mdl_common::config::{AnalysisConfig, Scheduling};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Subcommand the pipeline binary answers in worker mode
pub const WORKER_SUBCOMMAND: &str = "analyze-worker";

/// Default pool size: all cores but one, at least one
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// How to launch child analysis processes
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    /// Pipeline binary
    pub program: PathBuf,
    pub chunk_seconds: f64,
    pub memory_ceiling_mb: u64,
}

impl WorkerCommand {
    /// Worker command re-invoking the running executable
    pub fn current_exe(config: &AnalysisConfig) -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            chunk_seconds: config.chunk_seconds,
            memory_ceiling_mb: config.memory_ceiling_mb,
        })
    }

    fn command_for(&self, file: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(WORKER_SUBCOMMAND)
            .arg(file)
            .arg("--chunk-seconds")
            .arg(self.chunk_seconds.to_string())
            .arg("--memory-ceiling-mb")
            .arg(self.memory_ceiling_mb.to_string());
        cmd
    }
}

/// Dataset-level aggregate of a sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub files: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub groups: usize,
    pub total_samples: u64,
    pub clipped_samples: u64,
    pub total_duration_secs: f64,
    /// Chunk-level totals merged across every analyzed file
    pub metrics: MetricTotals,
    pub elapsed_secs: f64,
}

impl SweepSummary {
    /// Fold one file's report into the running totals
    pub fn merge_report(&mut self, report: &AnalysisReport) {
        self.analyzed += 1;
        self.total_samples += report.total_samples;
        self.clipped_samples += report.clipped_samples;
        self.total_duration_secs += report.duration_secs;
        self.metrics.merge(&report.metrics);
    }

    /// Chunk-weighted means across the dataset
    pub fn means(&self) -> BTreeMap<String, f64> {
        self.metrics.means()
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} analyzed, {} failed in {} groups ({:.1}s of audio, {:.2}s)",
            self.analyzed, self.failed, self.groups, self.total_duration_secs, self.elapsed_secs
        )
    }
}

/// Result of one sweep
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    /// One entry per input file, in input order
    pub reports: Vec<(PathBuf, Result<AnalysisReport, String>)>,
    pub summary: SweepSummary,
}

/// Grouped, pool-bounded analysis over many files
#[derive(Clone)]
pub struct AnalysisSweep {
    runner: ChunkedAnalysisRunner,
    workers: usize,
    group_size: usize,
    scheduling: Scheduling,
    worker_command: Option<WorkerCommand>,
}

impl AnalysisSweep {
    pub fn new(runner: ChunkedAnalysisRunner, workers: usize, group_size: usize) -> Self {
        Self {
            runner,
            workers: workers.max(1),
            group_size: group_size.max(1),
            scheduling: Scheduling::Threads,
            worker_command: None,
        }
    }

    /// Sweep sized and scheduled from `[analysis]`
    ///
    /// Process scheduling re-invokes the current executable; when that
    /// cannot be located the sweep falls back to threads.
    pub fn from_config(config: &AnalysisConfig, runner: ChunkedAnalysisRunner) -> Self {
        let workers = config.workers.unwrap_or_else(default_worker_count);
        let sweep = Self::new(runner, workers, config.group_size);

        match config.scheduling {
            Scheduling::Threads => sweep,
            Scheduling::Processes => match WorkerCommand::current_exe(config) {
                Ok(command) => sweep.with_worker_processes(command),
                Err(e) => {
                    warn!(error = %e, "Cannot locate executable, analyzing in threads");
                    sweep
                }
            },
        }
    }

    /// Analyze each file in a child process launched by `command`
    pub fn with_worker_processes(mut self, command: WorkerCommand) -> Self {
        self.scheduling = Scheduling::Processes;
        self.worker_command = Some(command);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn scheduling(&self) -> Scheduling {
        self.scheduling
    }

    /// Analyze `files`
    ///
    /// `analyzer` is used in thread mode; child processes run the worker's
    /// built-in analyzer.
    ///
    /// # Errors
    /// Only when the worker pool cannot be built. Per-file failures are
    /// recorded in the outcome.
    pub fn run(
        &self,
        files: &[PathBuf],
        analyzer: Arc<dyn ChunkAnalyzer>,
    ) -> Result<SweepOutcome, AnalysisError> {
        let start = Instant::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("analysis-{}", i))
            .build()
            .map_err(|e| AnalysisError::Worker(format!("Failed to build worker pool: {}", e)))?;

        info!(
            files = files.len(),
            workers = self.workers,
            group_size = self.group_size,
            scheduling = ?self.scheduling,
            "Starting analysis sweep"
        );

        let mut summary = SweepSummary {
            files: files.len(),
            ..Default::default()
        };
        let mut reports = Vec::with_capacity(files.len());

        for (group_index, group) in files.chunks(self.group_size).enumerate() {
            let results: Vec<Result<AnalysisReport, String>> = pool.install(|| {
                group
                    .par_iter()
                    .map(|file| self.analyze_one(file, analyzer.as_ref()))
                    .collect()
            });

            for (file, result) in group.iter().zip(results) {
                match &result {
                    Ok(report) => summary.merge_report(report),
                    Err(reason) => {
                        warn!(file = %file.display(), error = %reason, "Analysis failed");
                        summary.failed += 1;
                    }
                }
                reports.push((file.clone(), result));
            }

            summary.groups += 1;
            self.runner.reclaim();
            debug!(group = group_index, size = group.len(), "Group finished, memory reclaimed");
        }

        summary.elapsed_secs = start.elapsed().as_secs_f64();
        info!(summary = %summary.display_string(), "Analysis sweep completed");

        Ok(SweepOutcome { reports, summary })
    }

    fn analyze_one(&self, file: &Path, analyzer: &dyn ChunkAnalyzer) -> Result<AnalysisReport, String> {
        match (&self.scheduling, &self.worker_command) {
            (Scheduling::Processes, Some(command)) => run_worker_process(command, file),
            _ => self
                .runner
                .analyze_file(file, analyzer)
                .map_err(|e| e.to_string()),
        }
    }
}

/// Run one `analyze-worker` child and parse its report
fn run_worker_process(command: &WorkerCommand, file: &Path) -> Result<AnalysisReport, String> {
    let output = command
        .command_for(file)
        .output()
        .map_err(|e| format!("Failed to launch analysis worker: {}", e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "Analysis worker exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        ));
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| format!("Invalid analysis worker output: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::chunked_analysis::{ChunkError, ChunkMetrics, ChunkWindow};
    use crate::services::memory_probe::NullMemoryProbe;
    use tempfile::TempDir;

    struct Level;

    impl ChunkAnalyzer for Level {
        fn analyze_chunk(&self, window: &ChunkWindow<'_>) -> Result<ChunkMetrics, ChunkError> {
            let mean = window.samples.iter().map(|s| *s as f64).sum::<f64>()
                / window.samples.len() as f64;
            Ok(ChunkMetrics {
                samples: window.samples.len() as u64,
                ..Default::default()
            }
            .with_value("level", mean))
        }
    }

    fn write_wav(path: &Path, seconds: u32, value: i16) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 1000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..(seconds * 1000) {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn sweep(group_size: usize) -> AnalysisSweep {
        let runner = ChunkedAnalysisRunner::new(1.0, 0, Arc::new(NullMemoryProbe));
        AnalysisSweep::new(runner, 2, group_size)
    }

    #[test]
    fn test_summary_means_are_chunk_weighted() {
        let dir = TempDir::new().unwrap();
        let short = dir.path().join("short.wav");
        let long = dir.path().join("long.wav");
        write_wav(&short, 1, 8192); // 1 chunk at 0.25
        write_wav(&long, 3, 16384); // 3 chunks at 0.5

        let outcome = sweep(1).run(&[short, long], Arc::new(Level)).unwrap();

        assert_eq!(outcome.summary.analyzed, 2);
        assert_eq!(outcome.summary.groups, 2);
        let mean = outcome.summary.means()["level"];
        // (0.25 + 3 * 0.5) / 4
        assert!((mean - 0.4375).abs() < 1e-3, "mean was {}", mean);
    }

    #[test]
    fn test_unreadable_file_fails_alone() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.wav");
        let bad = dir.path().join("bad.wav");
        write_wav(&good, 1, 1000);
        std::fs::write(&bad, b"garbage").unwrap();

        let outcome = sweep(10).run(&[good.clone(), bad.clone()], Arc::new(Level)).unwrap();

        assert_eq!(outcome.summary.analyzed, 1);
        assert_eq!(outcome.summary.failed, 1);
        assert_eq!(outcome.reports[0].0, good);
        assert!(outcome.reports[0].1.is_ok());
        assert!(outcome.reports[1].1.is_err());
    }

    #[test]
    fn test_missing_worker_binary_is_per_file_failure() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.wav");
        write_wav(&file, 1, 1000);

        let command = WorkerCommand {
            program: dir.path().join("no-such-binary"),
            chunk_seconds: 1.0,
            memory_ceiling_mb: 64,
        };
        let outcome = sweep(1)
            .with_worker_processes(command)
            .run(&[file], Arc::new(Level))
            .unwrap();

        assert_eq!(outcome.summary.failed, 1);
        let err = outcome.reports[0].1.as_ref().unwrap_err();
        assert!(err.contains("Failed to launch analysis worker"));
    }

    #[test]
    fn test_worker_command_arguments() {
        let command = WorkerCommand {
            program: PathBuf::from("/usr/bin/mdl-pipeline"),
            chunk_seconds: 30.0,
            memory_ceiling_mb: 1024,
        };
        let cmd = command.command_for(Path::new("/m/a.wav"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "analyze-worker",
                "/m/a.wav",
                "--chunk-seconds",
                "30",
                "--memory-ceiling-mb",
                "1024"
            ]
        );
    }

    #[test]
    fn test_default_worker_count_at_least_one() {
        assert!(default_worker_count() >= 1);
    }
}
