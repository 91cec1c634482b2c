//! Per-window signal statistics
//!
//! Shared by the quality validator, the feature extractor and the
//! `analyze-worker` subcommand, so every path produces the same metric names.

use crate::services::chunked_analysis::{ChunkAnalyzer, ChunkError, ChunkMetrics, ChunkWindow};

/// Absolute sample value counted as clipped
pub const CLIPPING_THRESHOLD: f32 = 0.99;

/// Guard added to the mean amplitude before the dynamic range ratio
const DYNAMIC_RANGE_EPSILON: f64 = 1e-6;

pub const METRIC_RMS: &str = "rms";
pub const METRIC_PEAK: &str = "peak";
pub const METRIC_MEAN_AMPLITUDE: &str = "mean_amplitude";
pub const METRIC_ZERO_CROSSING_RATE: &str = "zero_crossing_rate";
pub const METRIC_DYNAMIC_RANGE_DB: &str = "dynamic_range_db";

/// Energy, amplitude and zero-crossing statistics of one window
///
/// Windows holding non-finite samples are recoverable errors: their sample
/// counts still count, their values are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalStatsAnalyzer;

impl ChunkAnalyzer for SignalStatsAnalyzer {
    fn analyze_chunk(&self, window: &ChunkWindow<'_>) -> Result<ChunkMetrics, ChunkError> {
        if window.sample_rate == 0 {
            return Err(ChunkError::Fatal("stream reports a sample rate of 0".into()));
        }

        let samples = window.samples;
        let mut clipped = 0u64;
        let mut sum_abs = 0.0f64;
        let mut sum_sq = 0.0f64;
        let mut peak = 0.0f64;
        let mut crossings = 0u64;
        let mut non_finite = false;

        for (i, &s) in samples.iter().enumerate() {
            if !s.is_finite() {
                non_finite = true;
                continue;
            }
            let a = s.abs();
            if a >= CLIPPING_THRESHOLD {
                clipped += 1;
            }
            let a = a as f64;
            sum_abs += a;
            sum_sq += a * a;
            peak = peak.max(a);
            if i > 0 && (samples[i - 1] >= 0.0) != (s >= 0.0) {
                crossings += 1;
            }
        }

        let counters = ChunkMetrics {
            samples: samples.len() as u64,
            clipped_samples: clipped,
            values: Default::default(),
        };

        if non_finite {
            return Err(ChunkError::Recoverable {
                partial: counters,
                reason: "window contains non-finite samples".into(),
            });
        }
        if samples.is_empty() {
            return Ok(counters);
        }

        let n = samples.len() as f64;
        let mean_abs = sum_abs / n;
        let mut metrics = counters
            .with_value(METRIC_RMS, (sum_sq / n).sqrt())
            .with_value(METRIC_PEAK, peak)
            .with_value(METRIC_MEAN_AMPLITUDE, mean_abs)
            .with_value(METRIC_ZERO_CROSSING_RATE, crossings as f64 / n);

        // Silent windows have no meaningful ratio
        if peak > 0.0 {
            metrics = metrics.with_value(
                METRIC_DYNAMIC_RANGE_DB,
                20.0 * (peak / (mean_abs + DYNAMIC_RANGE_EPSILON)).log10(),
            );
        }

        Ok(metrics)
    }
}
