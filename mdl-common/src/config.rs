//! Pipeline configuration loading and path resolution
//!
//! Configuration is a single TOML document supplied on the command line.
//! A missing file, a parse failure or a missing required section is a
//! configuration error: the run stops before any file is touched.
//!
//! Optional sections and keys fall back to built-in defaults defined in code.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the persisted per-file state document
pub const STATE_FILE_NAME: &str = "pipeline_state.json";

/// File name of the run statistics document
pub const STATS_FILE_NAME: &str = "pipeline_stats.json";

/// Default log file name (relative to the project root)
pub const LOG_FILE_NAME: &str = "pipeline.log";

/// Complete pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Directory layout (relative to the project root)
    #[serde(default)]
    pub paths: PathsConfig,

    /// Batch processing settings (required section)
    pub processing: ProcessingConfig,

    /// Settings forwarded to the download source (required section)
    pub download: DownloadConfig,

    /// Chunked analysis settings
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Quality thresholds used by the validation processor
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Directory layout, every entry relative to the project root
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: PathBuf,
    #[serde(default = "default_features_dir")]
    pub features_dir: PathBuf,
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            dataset_dir: default_dataset_dir(),
            features_dir: default_features_dir(),
            processed_dir: default_processed_dir(),
            temp_dir: default_temp_dir(),
        }
    }
}

/// Batch processing settings
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    /// Keep the artifact cache between runs
    pub keep_temp_files: bool,

    /// Concurrent files per phase batch
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Poll interval of the progress reporter
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

/// Settings passed through to the download source
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    pub skip_existing: bool,
    pub check_modified: bool,
}

/// Worker scheduling for the analysis sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scheduling {
    /// In-process worker threads
    #[default]
    Threads,
    /// One child process per file, memory returned to the OS on exit
    Processes,
}

/// Chunked analysis settings
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Window length in seconds
    #[serde(default = "default_chunk_seconds")]
    pub chunk_seconds: f64,

    /// Resident memory threshold that triggers a reclaim pass
    #[serde(default = "default_memory_ceiling_mb")]
    pub memory_ceiling_mb: u64,

    /// Sweep worker count (defaults to available cores minus one)
    #[serde(default)]
    pub workers: Option<usize>,

    /// Files per sweep group; memory is reclaimed between groups
    #[serde(default = "default_group_size")]
    pub group_size: usize,

    #[serde(default)]
    pub scheduling: Scheduling,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: default_chunk_seconds(),
            memory_ceiling_mb: default_memory_ceiling_mb(),
            workers: None,
            group_size: default_group_size(),
            scheduling: Scheduling::default(),
        }
    }
}

impl AnalysisConfig {
    /// Memory ceiling in bytes
    pub fn memory_ceiling_bytes(&self) -> u64 {
        self.memory_ceiling_mb.saturating_mul(1024 * 1024)
    }
}

/// Quality thresholds
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_duration_secs")]
    pub min_duration_secs: f64,
    #[serde(default = "default_min_sample_rate")]
    pub min_sample_rate: u32,
    #[serde(default = "default_max_clipping_ratio")]
    pub max_clipping_ratio: f64,
    #[serde(default = "default_min_dynamic_range_db")]
    pub min_dynamic_range_db: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: default_min_duration_secs(),
            min_sample_rate: default_min_sample_rate(),
            max_clipping_ratio: default_max_clipping_ratio(),
            min_dynamic_range_db: default_min_dynamic_range_db(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path relative to the project root (console only if unset)
    #[serde(default = "default_log_file")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

fn default_downloads_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_dataset_dir() -> PathBuf {
    PathBuf::from("dataset")
}

fn default_features_dir() -> PathBuf {
    PathBuf::from("features")
}

fn default_processed_dir() -> PathBuf {
    PathBuf::from("processed")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_max_workers() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_chunk_seconds() -> f64 {
    30.0
}

fn default_memory_ceiling_mb() -> u64 {
    1024
}

fn default_group_size() -> usize {
    50
}

fn default_min_duration_secs() -> f64 {
    60.0
}

fn default_min_sample_rate() -> u32 {
    44_100
}

fn default_max_clipping_ratio() -> f64 {
    0.01
}

fn default_min_dynamic_range_db() -> f64 {
    10.0
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from(LOG_FILE_NAME))
}

impl PipelineConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found at: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        info!(config = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no run could work with
    pub fn validate(&self) -> Result<()> {
        if self.processing.max_workers == 0 {
            return Err(Error::Config("processing.max_workers must be at least 1".into()));
        }
        if !(self.analysis.chunk_seconds > 0.0) {
            return Err(Error::Config("analysis.chunk_seconds must be positive".into()));
        }
        if self.analysis.group_size == 0 {
            return Err(Error::Config("analysis.group_size must be at least 1".into()));
        }
        if self.analysis.workers == Some(0) {
            return Err(Error::Config("analysis.workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.validation.max_clipping_ratio) {
            return Err(Error::Config(
                "validation.max_clipping_ratio must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Absolute paths of everything the pipeline reads or writes
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    pub project_root: PathBuf,
    pub downloads_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub features_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub state_file: PathBuf,
    pub stats_file: PathBuf,
}

impl PipelinePaths {
    /// Resolve configured directories against the project root
    pub fn resolve(project_root: &Path, paths: &PathsConfig) -> Self {
        let root = project_root.to_path_buf();
        Self {
            downloads_dir: root.join(&paths.downloads_dir),
            dataset_dir: root.join(&paths.dataset_dir),
            features_dir: root.join(&paths.features_dir),
            processed_dir: root.join(&paths.processed_dir),
            temp_dir: root.join(&paths.temp_dir),
            state_file: root.join(STATE_FILE_NAME),
            stats_file: root.join(STATS_FILE_NAME),
            project_root: root,
        }
    }

    /// Create every configured directory
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.project_root,
            &self.downloads_dir,
            &self.dataset_dir,
            &self.features_dir,
            &self.processed_dir,
            &self.temp_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Config(format!("Failed to create {}: {}", dir.display(), e))
            })?;
            debug!(dir = %dir.display(), "Directory ready");
        }
        Ok(())
    }

    /// Directory holding per-file metadata documents
    pub fn metadata_dir(&self) -> PathBuf {
        self.dataset_dir.join("metadata")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [processing]
        keep_temp_files = false

        [download]
        skip_existing = true
        check_modified = false
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.processing.max_workers, 4);
        assert_eq!(config.processing.progress_interval_ms, 100);
        assert_eq!(config.paths.downloads_dir, PathBuf::from("downloads"));
        assert_eq!(config.analysis.scheduling, Scheduling::Threads);
        assert_eq!(config.analysis.memory_ceiling_bytes(), 1024 * 1024 * 1024);
        assert_eq!(config.validation.min_sample_rate, 44_100);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, Some(PathBuf::from(LOG_FILE_NAME)));
    }

    #[test]
    fn test_missing_required_section_is_config_error() {
        let result = PipelineConfig::from_toml_str("[processing]\nkeep_temp_files = true\n");
        match result {
            Err(Error::Config(msg)) => assert!(msg.contains("download")),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_required_key_is_config_error() {
        let text = "[processing]\n[download]\nskip_existing = true\ncheck_modified = true\n";
        assert!(matches!(
            PipelineConfig::from_toml_str(text),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let text = format!("{}\n", MINIMAL.replace(
            "keep_temp_files = false",
            "keep_temp_files = false\nmax_workers = 0",
        ));
        assert!(matches!(PipelineConfig::from_toml_str(&text), Err(Error::Config(_))));
    }

    #[test]
    fn test_process_scheduling_parsed() {
        let text = format!("{}\n[analysis]\nscheduling = \"processes\"\nworkers = 3\n", MINIMAL);
        let config = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.analysis.scheduling, Scheduling::Processes);
        assert_eq!(config.analysis.workers, Some(3));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = PipelineConfig::load(Path::new("/nonexistent/pipeline.toml")).unwrap_err();
        assert!(err.is_fatal_setup());
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_paths_resolve_and_ensure() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = PipelinePaths::resolve(dir.path(), &PathsConfig::default());
        paths.ensure().unwrap();

        assert!(paths.downloads_dir.is_dir());
        assert!(paths.temp_dir.is_dir());
        assert_eq!(paths.state_file, dir.path().join(STATE_FILE_NAME));
        assert_eq!(paths.metadata_dir(), dir.path().join("dataset").join("metadata"));
    }
}
