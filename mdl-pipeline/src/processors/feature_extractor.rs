//! Feature extraction processor
//!
//! Produces a per-file feature document from chunked signal statistics.
//! The document is the artifact cached for the features phase and merged
//! into `features.json` by the orchestrator.

use crate::processors::signal_stats::{
    SignalStatsAnalyzer, METRIC_DYNAMIC_RANGE_DB, METRIC_MEAN_AMPLITUDE, METRIC_PEAK, METRIC_RMS,
    METRIC_ZERO_CROSSING_RATE,
};
use crate::services::chunked_analysis::{AnalysisReport, ChunkedAnalysisRunner};
use crate::types::{Processor, ProcessorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Energy features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyFeatures {
    pub rms_energy_mean: Option<f64>,
    pub zero_crossing_rate_mean: Option<f64>,
}

/// Amplitude features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmplitudeFeatures {
    pub peak_mean: Option<f64>,
    pub mean_amplitude: Option<f64>,
    pub dynamic_range_db: Option<f64>,
    pub clipping_ratio: f64,
}

/// Feature document of one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDocument {
    pub file: String,
    pub duration_secs: f64,
    pub sample_rate: u32,
    pub energy_features: EnergyFeatures,
    pub amplitude_features: AmplitudeFeatures,
    pub chunks_analyzed: usize,
    pub chunks_failed: usize,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl FeatureDocument {
    /// Build the document from an analysis report
    ///
    /// # Errors
    /// `Unsupported` when not a single window could be analyzed
    pub fn from_report(report: &AnalysisReport) -> Result<Self, ProcessorError> {
        if report.chunks_analyzed == 0 {
            let detail = report
                .issues
                .first()
                .cloned()
                .unwrap_or_else(|| "no audio samples".to_string());
            return Err(ProcessorError::Unsupported(format!(
                "No analyzable audio in {}: {}",
                report.file, detail
            )));
        }

        Ok(Self {
            file: report.file.clone(),
            duration_secs: report.duration_secs,
            sample_rate: report.sample_rate,
            energy_features: EnergyFeatures {
                rms_energy_mean: report.mean(METRIC_RMS),
                zero_crossing_rate_mean: report.mean(METRIC_ZERO_CROSSING_RATE),
            },
            amplitude_features: AmplitudeFeatures {
                peak_mean: report.mean(METRIC_PEAK),
                mean_amplitude: report.mean(METRIC_MEAN_AMPLITUDE),
                dynamic_range_db: report.mean(METRIC_DYNAMIC_RANGE_DB),
                clipping_ratio: report.clipping_ratio(),
            },
            chunks_analyzed: report.chunks_analyzed,
            chunks_failed: report.chunks_failed,
            issues: report.issues.clone(),
        })
    }
}

/// Feature extractor
#[derive(Clone)]
pub struct FeatureExtractor {
    runner: ChunkedAnalysisRunner,
}

impl FeatureExtractor {
    pub fn new(runner: ChunkedAnalysisRunner) -> Self {
        Self { runner }
    }

    /// Analyze and build the feature document synchronously
    pub fn extract(&self, path: &Path) -> Result<FeatureDocument, ProcessorError> {
        let report = self
            .runner
            .analyze_file(path, &SignalStatsAnalyzer)
            .map_err(|e| ProcessorError::Unsupported(e.to_string()))?;
        FeatureDocument::from_report(&report)
    }
}

#[async_trait]
impl Processor for FeatureExtractor {
    fn name(&self) -> &'static str {
        "feature_extractor"
    }

    async fn process_file(
        &self,
        input: &Path,
        _output: Option<&Path>,
    ) -> Result<serde_json::Value, ProcessorError> {
        let extractor = self.clone();
        let path: PathBuf = input.to_path_buf();

        let document = tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|e| ProcessorError::Failed(format!("Feature task failed: {}", e)))??;

        tracing::debug!(
            file = %input.display(),
            chunks = document.chunks_analyzed,
            "Features extracted"
        );
        Ok(serde_json::to_value(&document)?)
    }
}
