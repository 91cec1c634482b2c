//! Audio quality validation processor
//!
//! Checks duration, sample rate, clipping and dynamic range against the
//! `[validation]` thresholds. A file that fails the checks still completes
//! the phase: the result records the issues, and the content has been
//! validated.

use crate::processors::signal_stats::{
    SignalStatsAnalyzer, METRIC_DYNAMIC_RANGE_DB, METRIC_RMS,
};
use crate::services::chunked_analysis::{AnalysisReport, ChunkedAnalysisRunner};
use crate::types::{Processor, ProcessorError, ValidationResult};
use async_trait::async_trait;
use mdl_common::config::ValidationConfig;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Quality validator
#[derive(Clone)]
pub struct QualityValidator {
    thresholds: ValidationConfig,
    runner: ChunkedAnalysisRunner,
}

impl QualityValidator {
    pub fn new(thresholds: ValidationConfig, runner: ChunkedAnalysisRunner) -> Self {
        Self { thresholds, runner }
    }

    /// Validate one file synchronously
    ///
    /// Never fails: an unreadable file yields a failed result with the read
    /// error as its issue.
    pub fn check(&self, path: &Path) -> ValidationResult {
        match self.runner.analyze_file(path, &SignalStatsAnalyzer) {
            Ok(report) => self.evaluate(&report),
            Err(e) => ValidationResult::new(
                vec![format!("Error analyzing file: {}", e)],
                BTreeMap::new(),
            ),
        }
    }

    /// Apply the thresholds to an analysis report
    pub fn evaluate(&self, report: &AnalysisReport) -> ValidationResult {
        let t = &self.thresholds;
        let mut issues = Vec::new();
        let mut metrics = BTreeMap::new();

        metrics.insert("duration".to_string(), report.duration_secs);
        if report.duration_secs < t.min_duration_secs {
            issues.push(format!(
                "Duration too short: {:.1}s < {}s",
                report.duration_secs, t.min_duration_secs
            ));
        }

        metrics.insert("sample_rate".to_string(), report.sample_rate as f64);
        if report.sample_rate < t.min_sample_rate {
            issues.push(format!(
                "Sample rate too low: {} < {}",
                report.sample_rate, t.min_sample_rate
            ));
        }

        let clipping_ratio = report.clipping_ratio();
        metrics.insert("clipping_ratio".to_string(), clipping_ratio);
        if clipping_ratio > t.max_clipping_ratio {
            issues.push(format!(
                "Excessive clipping: {:.1}% of samples",
                clipping_ratio * 100.0
            ));
        }

        if let Some(dynamic_range) = report.mean(METRIC_DYNAMIC_RANGE_DB) {
            metrics.insert("dynamic_range".to_string(), dynamic_range);
            if dynamic_range < t.min_dynamic_range_db {
                issues.push(format!("Low dynamic range: {:.1}dB", dynamic_range));
            }
        }

        if let Some(rms) = report.mean(METRIC_RMS) {
            metrics.insert("rms_mean".to_string(), rms);
        }

        issues.extend(report.issues.iter().cloned());

        ValidationResult::new(issues, metrics)
    }
}

#[async_trait]
impl Processor for QualityValidator {
    fn name(&self) -> &'static str {
        "quality_validator"
    }

    async fn process_file(
        &self,
        input: &Path,
        _output: Option<&Path>,
    ) -> Result<serde_json::Value, ProcessorError> {
        let validator = self.clone();
        let path: PathBuf = input.to_path_buf();

        let result = tokio::task::spawn_blocking(move || validator.check(&path))
            .await
            .map_err(|e| ProcessorError::Failed(format!("Validation task failed: {}", e)))?;

        if result.passed {
            tracing::info!(file = %input.display(), "Validated");
        } else {
            tracing::warn!(file = %input.display(), issues = ?result.issues, "Quality issues");
        }

        Ok(serde_json::to_value(&result)?)
    }
}
