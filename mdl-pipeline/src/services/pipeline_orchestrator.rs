//! Pipeline orchestrator
//!
//! Drives the fixed phase sequence over the collection:
//!
//! 1. **Download:** ask the source provider for new files; when it yields
//!    nothing, sweep the downloads directory instead
//! 2. **Validate:** quality checks
//! 3. **Features:** feature extraction, cached; the analysis sweep pre-warms
//!    the cache in parallel before the batch runs
//! 4. **Metadata:** tag and property documents
//!
//! Every phase goes through the batch executor, so reruns only touch files
//! whose content changed or whose phase never completed. Run statistics are
//! written to `pipeline_stats.json` whether the run succeeds or fails.

use crate::models::{PhaseStats, ProgressCounters, RunStatistics};
use crate::processors::{FeatureDocument, FeatureExtractor, MetadataProcessor, QualityValidator, SignalStatsAnalyzer};
use crate::services::analysis_sweep::AnalysisSweep;
use crate::services::artifact_cache::ArtifactCache;
use crate::services::batch_executor::{BatchExecutor, BatchReport};
use crate::services::change_detector::ChangeDetector;
use crate::services::chunked_analysis::ChunkedAnalysisRunner;
use crate::services::content_hasher::ContentHasher;
use crate::services::file_scanner::{FileScanner, ScanError};
use crate::services::memory_probe::SystemMemoryProbe;
use crate::services::progress_reporter::ProgressReporter;
use crate::services::state_store::FileStateStore;
use crate::types::{file_identity, Phase, Processor};
use async_trait::async_trait;
use mdl_common::config::{DownloadConfig, PipelineConfig, PipelinePaths};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Artifact kind of the feature cache
pub const FEATURE_CACHE_KIND: &str = "features";

/// Aggregate feature file written after the features phase
pub const FEATURES_FILE_NAME: &str = "features.json";

// ============================================================================
// Errors
// ============================================================================

/// Orchestrator-level errors (abort the run after statistics are written)
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Download error: {0}")]
    Download(String),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Feature extraction error: {0}")]
    Features(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Common(#[from] mdl_common::Error),
}

impl From<PipelineError> for mdl_common::Error {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Common(inner) => inner,
            other => mdl_common::Error::Internal(other.to_string()),
        }
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Orchestrator step, as named on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Download,
    Validate,
    Features,
    Metadata,
}

impl Step {
    pub const ALL: [Step; 4] = [Step::Download, Step::Validate, Step::Features, Step::Metadata];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Download => "download",
            Step::Validate => "validate",
            Step::Features => "features",
            Step::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| {
                format!(
                    "unknown step '{}' (expected one of: download, validate, features, metadata)",
                    s
                )
            })
    }
}

// ============================================================================
// Source provider
// ============================================================================

/// External download mechanism
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fetch new files into `downloads_dir`
    ///
    /// # Returns
    /// Paths of the files fetched by this call (empty when nothing is new)
    async fn fetch(
        &self,
        downloads_dir: &Path,
        settings: &DownloadConfig,
    ) -> Result<Vec<PathBuf>, PipelineError>;
}

/// Provider for collections filled by other means
///
/// Always reports nothing new, so discovery falls back to scanning.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExistingFilesSource;

#[async_trait]
impl SourceProvider for ExistingFilesSource {
    fn name(&self) -> &'static str {
        "existing_files"
    }

    async fn fetch(&self, _: &Path, _: &DownloadConfig) -> Result<Vec<PathBuf>, PipelineError> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Phase-sequence driver
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    paths: PipelinePaths,
    store: Arc<FileStateStore>,
    progress: Arc<ProgressCounters>,
    executor: BatchExecutor,
    source: Arc<dyn SourceProvider>,
    validator: Arc<dyn Processor>,
    feature_extractor: Arc<dyn Processor>,
    metadata: Arc<dyn Processor>,
    feature_cache: ArtifactCache,
    sweep: Option<AnalysisSweep>,
}

impl PipelineOrchestrator {
    /// Build an orchestrator for `project_root` with the built-in processors
    ///
    /// Creates every configured directory and loads persisted state.
    pub fn new(config: PipelineConfig, project_root: &Path) -> Result<Self, PipelineError> {
        let paths = PipelinePaths::resolve(project_root, &config.paths);
        paths.ensure()?;

        let store = Arc::new(FileStateStore::open(&paths.state_file));
        let progress = Arc::new(ProgressCounters::new());
        let executor = BatchExecutor::new(
            Arc::clone(&store),
            Arc::clone(&progress),
            config.processing.max_workers,
        );

        let runner = ChunkedAnalysisRunner::from_config(
            &config.analysis,
            Arc::new(SystemMemoryProbe::new()),
        );
        let sweep = AnalysisSweep::from_config(&config.analysis, runner.clone());

        Ok(Self {
            validator: Arc::new(QualityValidator::new(config.validation.clone(), runner.clone())),
            feature_extractor: Arc::new(FeatureExtractor::new(runner)),
            metadata: Arc::new(MetadataProcessor::new(paths.metadata_dir())),
            feature_cache: ArtifactCache::new(&paths.temp_dir, FEATURE_CACHE_KIND),
            source: Arc::new(ExistingFilesSource),
            sweep: Some(sweep),
            config,
            paths,
            store,
            progress,
            executor,
        })
    }

    pub fn with_source(mut self, source: Arc<dyn SourceProvider>) -> Self {
        self.source = source;
        self
    }

    pub fn with_validator(mut self, processor: Arc<dyn Processor>) -> Self {
        self.validator = processor;
        self
    }

    /// Replace the feature processor
    ///
    /// Disables the sweep pre-warm, which only produces documents of the
    /// built-in extractor.
    pub fn with_feature_extractor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.feature_extractor = processor;
        self.sweep = None;
        self
    }

    pub fn with_metadata_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.metadata = processor;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(cancel);
        self
    }

    pub fn store(&self) -> &Arc<FileStateStore> {
        &self.store
    }

    pub fn paths(&self) -> &PipelinePaths {
        &self.paths
    }

    pub fn feature_cache(&self) -> &ArtifactCache {
        &self.feature_cache
    }

    /// Run every step not in `skip`
    ///
    /// **Algorithm:**
    /// 1. Run the steps, recording per-phase statistics
    /// 2. Stamp total duration and final state, append the error if any
    /// 3. Write `pipeline_stats.json` (on success and on failure)
    /// 4. On success, clear the feature cache unless `keep_temp_files`
    ///
    /// # Errors
    /// Orchestrator-level failures, returned after statistics are written.
    /// File-level failures only show up in the statistics.
    pub async fn run(&self, skip: &[Step]) -> Result<RunStatistics, PipelineError> {
        let start = Instant::now();
        let mut stats = RunStatistics::new(mdl_common::time::epoch_seconds());

        let reporter = ProgressReporter::spawn(
            Arc::clone(&self.progress),
            mdl_common::time::millis_to_duration(self.config.processing.progress_interval_ms),
        );
        let result = self.run_steps(skip, &mut stats).await;
        reporter.finish().await;

        stats.finish(start.elapsed(), self.store.summary());
        if let Err(e) = &result {
            error!(error = %e, "Pipeline failed");
            stats.record_error(format!("Pipeline error: {}", e));
        }

        if let Err(e) = mdl_common::fs::write_json_atomic(&self.paths.stats_file, &stats) {
            error!(path = %self.paths.stats_file.display(), error = %e, "Failed to write statistics");
            result?;
            return Err(e.into());
        }

        result?;

        if !self.config.processing.keep_temp_files {
            match self.feature_cache.clear() {
                Ok(removed) => debug!(removed, "Temporary files cleaned"),
                Err(e) => warn!(error = %e, "Failed to clean temporary files"),
            }
        }

        info!(
            duration_secs = %format!("{:.2}", stats.total_duration.unwrap_or_default()),
            tracked_files = self.store.len(),
            processed = stats.total_processed(),
            "Pipeline completed"
        );

        Ok(stats)
    }

    async fn run_steps(&self, skip: &[Step], stats: &mut RunStatistics) -> Result<(), PipelineError> {
        let files = if skip.contains(&Step::Download) {
            self.scan_downloads()?
        } else {
            self.discover(stats).await?
        };

        if files.is_empty() {
            info!("No files to process");
            return Ok(());
        }
        info!(file_count = files.len(), "Found files to process");

        if !skip.contains(&Step::Validate) {
            let report = self
                .executor
                .run_batch(&files, Arc::clone(&self.validator), Phase::Validated, None, None)
                .await;
            record_batch(stats, &files, &report);
        }

        if !skip.contains(&Step::Features) {
            self.prewarm_features(&files).await?;
            let report = self
                .executor
                .run_batch(
                    &files,
                    Arc::clone(&self.feature_extractor),
                    Phase::Features,
                    None,
                    Some(&self.feature_cache),
                )
                .await;
            record_batch(stats, &files, &report);
            self.write_feature_collection(&files)?;
        }

        if !skip.contains(&Step::Metadata) {
            let report = self
                .executor
                .run_batch(&files, Arc::clone(&self.metadata), Phase::Metadata, None, None)
                .await;
            record_batch(stats, &files, &report);
        }

        Ok(())
    }

    /// Fetch new files, falling back to a downloads directory sweep
    async fn discover(&self, stats: &mut RunStatistics) -> Result<Vec<PathBuf>, PipelineError> {
        let start = Instant::now();

        let fetched = self
            .source
            .fetch(&self.paths.downloads_dir, &self.config.download)
            .await?;
        info!(source = self.source.name(), fetched = fetched.len(), "Download step finished");

        let files = if fetched.is_empty() {
            info!("Scanning downloads directory for unprocessed files");
            self.scan_downloads()?
        } else {
            fetched
        };

        stats.record_phase(
            Step::Download.as_str(),
            PhaseStats {
                duration_secs: start.elapsed().as_secs_f64(),
                files_processed: files.len(),
                ..Default::default()
            },
        );
        Ok(files)
    }

    fn scan_downloads(&self) -> Result<Vec<PathBuf>, PipelineError> {
        let files = FileScanner::new().scan(&self.paths.downloads_dir)?;
        info!(dir = %self.paths.downloads_dir.display(), found = files.len(), "Found existing files");
        Ok(files)
    }

    /// Analyze files that will need features, in parallel, into the cache
    ///
    /// Files the sweep cannot analyze are left to the batch, which reports
    /// them as failures.
    async fn prewarm_features(&self, files: &[PathBuf]) -> Result<(), PipelineError> {
        let Some(sweep) = &self.sweep else {
            return Ok(());
        };

        let detector = ChangeDetector::new(Arc::clone(&self.store));
        let hasher = ContentHasher::new();
        let mut pending = Vec::new();
        let mut hashes = HashMap::new();
        for file in files {
            if !file.exists() {
                continue;
            }
            let needs = detector
                .evaluate_async(file, Phase::Features)
                .await
                .map(|d| d.needs_processing())
                .unwrap_or(false);
            if !needs {
                continue;
            }
            let Ok(hash) = hasher.hash_file_async(file).await else {
                continue;
            };
            let id = file_identity(file);
            if self.feature_cache.get::<serde_json::Value>(&id, &hash).is_none() {
                pending.push(file.clone());
                hashes.insert(id, hash);
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let sweep = sweep.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            sweep.run(&pending, Arc::new(SignalStatsAnalyzer))
        })
        .await
        .map_err(|e| PipelineError::Task(e.to_string()))?
        .map_err(|e| PipelineError::Features(e.to_string()))?;

        for (file, result) in &outcome.reports {
            let Ok(report) = result else { continue };
            let id = file_identity(file);
            let Some(before) = hashes.get(&id) else { continue };
            // Content that moved during the sweep is left to the batch
            match hasher.hash_file_async(file).await {
                Ok(after) if after == *before => {}
                _ => {
                    debug!(file = %file.display(), "Content changed during pre-analysis");
                    continue;
                }
            }
            match FeatureDocument::from_report(report) {
                Ok(document) => {
                    if let Err(e) = self.feature_cache.put(&id, before, &document) {
                        warn!(file = %file.display(), error = %e, "Failed to cache features");
                    }
                }
                Err(e) => debug!(file = %file.display(), error = %e, "No features from sweep"),
            }
        }

        info!(
            summary = %outcome.summary.display_string(),
            means = ?outcome.summary.means(),
            "Feature pre-analysis finished"
        );
        Ok(())
    }

    /// Write every cached feature document of `files` to `features.json`
    ///
    /// Only documents computed from the content recorded in state count.
    fn write_feature_collection(&self, files: &[PathBuf]) -> Result<(), PipelineError> {
        let documents: Vec<serde_json::Value> = files
            .iter()
            .filter_map(|f| {
                let id = file_identity(f);
                let stored = self.store.get(&id)?;
                self.feature_cache.get(&id, &stored.content_hash)
            })
            .collect();

        let target = self.paths.features_dir.join(FEATURES_FILE_NAME);
        mdl_common::fs::write_json_atomic(&target, &documents)?;
        info!(path = %target.display(), documents = documents.len(), "Feature collection written");
        Ok(())
    }
}

fn record_batch(stats: &mut RunStatistics, files: &[PathBuf], report: &BatchReport) {
    let phase_stats = report.to_phase_stats();
    info!(phase = %report.phase, result = %phase_stats.display_string(), "Phase finished");
    for failure in report.failures(files) {
        stats.record_error(failure);
    }
    stats.record_phase(report.phase.as_str(), phase_stats);
}
