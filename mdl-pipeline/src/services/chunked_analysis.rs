//! Chunked analysis
//!
//! Streams one file through a [`ChunkAnalyzer`] in fixed-length windows so
//! per-worker memory stays bounded by one window, whatever the file length.
//!
//! **Algorithm:**
//! 1. Read the next window (`chunk_seconds` of mono samples) into one
//!    reusable buffer
//! 2. Analyze it; fold the result into running totals (sample counters,
//!    per-metric sums and counts). Window data is never retained.
//! 3. Check resident memory; above the ceiling, release the buffer and ask
//!    the probe to reclaim before the next window
//! 4. Report per-metric means over the windows that did not error
//!
//! Chunk errors never escape the runner: a fatal error stops the file with
//! an issue, a recoverable one drops that window's metrics and continues.

use crate::services::memory_probe::MemoryProbe;
use crate::types::panic_message;
use mdl_common::config::AnalysisConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// Analyzer capability
// ============================================================================

/// One window of mono samples
#[derive(Debug, Clone, Copy)]
pub struct ChunkWindow<'a> {
    /// Zero-based window index
    pub index: usize,
    /// Window start within the file
    pub start_secs: f64,
    pub sample_rate: u32,
    /// Mono samples in [-1.0, 1.0]
    pub samples: &'a [f32],
}

impl ChunkWindow<'_> {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.samples.len() as f64 / self.sample_rate as f64
        }
    }
}

/// Result of analyzing one window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    /// Samples examined
    pub samples: u64,
    /// Samples at or beyond the clipping threshold
    pub clipped_samples: u64,
    /// Named per-window values, averaged across windows by the runner
    pub values: BTreeMap<String, f64>,
}

impl ChunkMetrics {
    pub fn with_value(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }
}

/// Chunk analysis failure
#[derive(Debug, Clone, Error)]
pub enum ChunkError {
    /// Analysis of the file cannot continue
    #[error("Fatal chunk error: {0}")]
    Fatal(String),

    /// The window is unusable; its counters still count, its values do not
    #[error("Recoverable chunk error: {reason}")]
    Recoverable { partial: ChunkMetrics, reason: String },
}

/// Per-window analysis
pub trait ChunkAnalyzer: Send + Sync {
    fn analyze_chunk(&self, window: &ChunkWindow<'_>) -> Result<ChunkMetrics, ChunkError>;
}

// ============================================================================
// Sample sources
// ============================================================================

/// Errors opening or reading a sample stream
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Analysis worker failed: {0}")]
    Worker(String),
}

/// Sequential reader of mono windows
pub trait ChunkSource {
    fn sample_rate(&self) -> u32;

    /// Replace the contents of `buf` with up to `max_samples` samples
    ///
    /// # Returns
    /// `false` once the stream is exhausted and `buf` is empty
    fn read_chunk(&mut self, buf: &mut Vec<f32>, max_samples: usize) -> Result<bool, AnalysisError>;
}

/// Source over samples already in memory
#[derive(Debug, Clone)]
pub struct MemoryChunkSource {
    samples: Vec<f32>,
    sample_rate: u32,
    position: usize,
}

impl MemoryChunkSource {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            position: 0,
        }
    }
}

impl ChunkSource for MemoryChunkSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_chunk(&mut self, buf: &mut Vec<f32>, max_samples: usize) -> Result<bool, AnalysisError> {
        buf.clear();
        let end = (self.position + max_samples).min(self.samples.len());
        buf.extend_from_slice(&self.samples[self.position..end]);
        self.position = end;
        Ok(!buf.is_empty())
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Running per-metric sums and counts
///
/// Merging two totals keeps exact weighted means; averaging two means would
/// not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricTotals {
    pub sums: BTreeMap<String, f64>,
    pub counts: BTreeMap<String, u64>,
}

impl MetricTotals {
    pub fn add(&mut self, name: &str, value: f64) {
        *self.sums.entry(name.to_string()).or_insert(0.0) += value;
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn add_all(&mut self, values: &BTreeMap<String, f64>) {
        for (name, value) in values {
            if value.is_finite() {
                self.add(name, *value);
            }
        }
    }

    pub fn merge(&mut self, other: &MetricTotals) {
        for (name, sum) in &other.sums {
            *self.sums.entry(name.clone()).or_insert(0.0) += sum;
        }
        for (name, count) in &other.counts {
            *self.counts.entry(name.clone()).or_insert(0) += count;
        }
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        let count = *self.counts.get(name)?;
        if count == 0 {
            return None;
        }
        self.sums.get(name).map(|sum| sum / count as f64)
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.counts
            .keys()
            .filter_map(|name| self.mean(name).map(|m| (name.clone(), m)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Analysis result of one file
///
/// Also the document exchanged with `analyze-worker` child processes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub file: String,
    pub sample_rate: u32,
    /// Stream length actually read
    pub duration_secs: f64,
    /// Windows whose values entered the means
    pub chunks_analyzed: usize,
    /// Windows dropped by a recoverable error
    pub chunks_failed: usize,
    pub total_samples: u64,
    pub clipped_samples: u64,
    pub metrics: MetricTotals,
    pub issues: Vec<String>,
    /// Reclaim passes forced by the memory ceiling
    pub reclaims: usize,
    /// False when a fatal error or read error cut the stream short
    pub completed: bool,
}

impl AnalysisReport {
    pub fn new(file: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            file: file.into(),
            sample_rate,
            completed: true,
            ..Default::default()
        }
    }

    /// Report for a file that could not be analyzed at all
    pub fn failed(file: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            issues: vec![issue.into()],
            completed: false,
            ..Default::default()
        }
    }

    /// Per-metric means across non-errored windows
    pub fn means(&self) -> BTreeMap<String, f64> {
        self.metrics.means()
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.metrics.mean(name)
    }

    /// Clipped samples over all samples counted (0.0 for an empty stream)
    pub fn clipping_ratio(&self) -> f64 {
        if self.total_samples == 0 {
            0.0
        } else {
            self.clipped_samples as f64 / self.total_samples as f64
        }
    }

    fn accumulate_counters(&mut self, metrics: &ChunkMetrics) {
        self.total_samples += metrics.samples;
        self.clipped_samples += metrics.clipped_samples;
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Memory-bounded per-file analysis
#[derive(Clone)]
pub struct ChunkedAnalysisRunner {
    chunk_seconds: f64,
    memory_ceiling_bytes: u64,
    probe: Arc<dyn MemoryProbe>,
}

impl ChunkedAnalysisRunner {
    /// # Arguments
    /// * `chunk_seconds` - Window length (non-positive values fall back to 1s)
    /// * `memory_ceiling_bytes` - Resident size above which a reclaim pass
    ///   runs after a window; zero disables the check
    /// * `probe` - Memory source
    pub fn new(chunk_seconds: f64, memory_ceiling_bytes: u64, probe: Arc<dyn MemoryProbe>) -> Self {
        let chunk_seconds = if chunk_seconds.is_finite() && chunk_seconds > 0.0 {
            chunk_seconds
        } else {
            1.0
        };
        Self {
            chunk_seconds,
            memory_ceiling_bytes,
            probe,
        }
    }

    pub fn from_config(config: &AnalysisConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self::new(config.chunk_seconds, config.memory_ceiling_bytes(), probe)
    }

    pub fn chunk_seconds(&self) -> f64 {
        self.chunk_seconds
    }

    /// Window length in samples at `sample_rate` (at least one)
    pub fn chunk_samples(&self, sample_rate: u32) -> usize {
        ((self.chunk_seconds * sample_rate as f64) as usize).max(1)
    }

    /// Decode `path` as audio and analyze it
    ///
    /// # Errors
    /// Only when the file cannot be opened as audio. Problems past that
    /// point are issues on the report.
    pub fn analyze_file(
        &self,
        path: &Path,
        analyzer: &dyn ChunkAnalyzer,
    ) -> Result<AnalysisReport, AnalysisError> {
        let mut source = crate::utils::audio_stream::AudioChunkSource::open(path)?;
        Ok(self.run(&path.display().to_string(), &mut source, analyzer))
    }

    /// Analyze every window of `source`
    pub fn run<S: ChunkSource + ?Sized>(
        &self,
        file: &str,
        source: &mut S,
        analyzer: &dyn ChunkAnalyzer,
    ) -> AnalysisReport {
        let sample_rate = source.sample_rate();
        let chunk_samples = self.chunk_samples(sample_rate);
        let mut report = AnalysisReport::new(file, sample_rate);
        let mut buffer: Vec<f32> = Vec::with_capacity(chunk_samples);
        let mut position: u64 = 0;
        let mut index = 0usize;

        loop {
            match source.read_chunk(&mut buffer, chunk_samples) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(file = %file, chunk = index, error = %e, "Stream read failed");
                    report.issues.push(format!("Read error at chunk {}: {}", index, e));
                    report.completed = false;
                    break;
                }
            }

            let window = ChunkWindow {
                index,
                start_secs: position as f64 / sample_rate.max(1) as f64,
                sample_rate,
                samples: &buffer,
            };
            position += buffer.len() as u64;

            // A panicking analyzer ends this file's analysis, not the process
            let result = catch_unwind(AssertUnwindSafe(|| analyzer.analyze_chunk(&window)))
                .unwrap_or_else(|panic| {
                    Err(ChunkError::Fatal(format!(
                        "analyzer panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });

            match result {
                Ok(metrics) => {
                    report.accumulate_counters(&metrics);
                    report.metrics.add_all(&metrics.values);
                    report.chunks_analyzed += 1;
                }
                Err(ChunkError::Recoverable { partial, reason }) => {
                    debug!(file = %file, chunk = index, reason = %reason, "Chunk skipped");
                    report.accumulate_counters(&partial);
                    report.chunks_failed += 1;
                    report.issues.push(format!("Chunk {}: {}", index, reason));
                }
                Err(ChunkError::Fatal(reason)) => {
                    warn!(file = %file, chunk = index, reason = %reason, "Analysis stopped");
                    report
                        .issues
                        .push(format!("Analysis stopped at chunk {}: {}", index, reason));
                    report.completed = false;
                    break;
                }
            }

            index += 1;

            if self.over_ceiling() {
                // Release the window buffer; it is reallocated on the next read
                buffer = Vec::new();
                self.probe.reclaim();
                report.reclaims += 1;
                debug!(file = %file, chunk = index, "Memory ceiling reached, reclaimed");
            }
        }

        report.duration_secs = position as f64 / sample_rate.max(1) as f64;
        report
    }

    /// Forced reclaim pass outside a file (between sweep groups)
    pub fn reclaim(&self) {
        self.probe.reclaim();
    }

    fn over_ceiling(&self) -> bool {
        if self.memory_ceiling_bytes == 0 {
            return false;
        }
        self.probe
            .resident_bytes()
            .map(|resident| resident > self.memory_ceiling_bytes)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_probe::NullMemoryProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports the window's first sample as metric "level"
    struct FirstSample;

    impl ChunkAnalyzer for FirstSample {
        fn analyze_chunk(&self, window: &ChunkWindow<'_>) -> Result<ChunkMetrics, ChunkError> {
            let clipped = window.samples.iter().filter(|s| s.abs() >= 0.99).count() as u64;
            Ok(ChunkMetrics {
                samples: window.samples.len() as u64,
                clipped_samples: clipped,
                values: BTreeMap::new(),
            }
            .with_value("level", window.samples[0] as f64))
        }
    }

    /// Fails recoverably on one window, fatally on another
    struct Flaky {
        recoverable_at: Option<usize>,
        fatal_at: Option<usize>,
    }

    impl ChunkAnalyzer for Flaky {
        fn analyze_chunk(&self, window: &ChunkWindow<'_>) -> Result<ChunkMetrics, ChunkError> {
            let metrics = ChunkMetrics {
                samples: window.samples.len() as u64,
                clipped_samples: 0,
                values: BTreeMap::new(),
            }
            .with_value("level", window.samples[0] as f64);

            if self.fatal_at == Some(window.index) {
                return Err(ChunkError::Fatal("decoder state lost".into()));
            }
            if self.recoverable_at == Some(window.index) {
                return Err(ChunkError::Recoverable {
                    partial: metrics,
                    reason: "silent window".into(),
                });
            }
            Ok(metrics)
        }
    }

    struct HighMemory {
        reclaims: AtomicUsize,
    }

    impl MemoryProbe for HighMemory {
        fn resident_bytes(&self) -> Option<u64> {
            Some(u64::MAX)
        }

        fn reclaim(&self) {
            self.reclaims.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Three 1-second windows at 10 Hz with levels 0.1, 0.2, 0.3
    fn three_windows() -> MemoryChunkSource {
        let mut samples = vec![0.1f32; 10];
        samples.extend(vec![0.2f32; 10]);
        samples.extend(vec![0.3f32; 10]);
        MemoryChunkSource::new(samples, 10)
    }

    fn runner() -> ChunkedAnalysisRunner {
        ChunkedAnalysisRunner::new(1.0, 0, Arc::new(NullMemoryProbe))
    }

    #[test]
    fn test_mean_across_all_windows() {
        let report = runner().run("a.wav", &mut three_windows(), &FirstSample);

        assert_eq!(report.chunks_analyzed, 3);
        assert_eq!(report.total_samples, 30);
        assert!((report.mean("level").unwrap() - 0.2).abs() < 1e-6);
        assert!((report.duration_secs - 3.0).abs() < 1e-9);
        assert!(report.completed);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_recoverable_error_excluded_from_mean_but_counted() {
        let analyzer = Flaky {
            recoverable_at: Some(2),
            fatal_at: None,
        };
        let report = runner().run("a.wav", &mut three_windows(), &analyzer);

        assert_eq!(report.chunks_analyzed, 2);
        assert_eq!(report.chunks_failed, 1);
        assert_eq!(report.total_samples, 30);
        assert!((report.mean("level").unwrap() - 0.15).abs() < 1e-6);
        assert_eq!(report.issues.len(), 1);
        assert!(report.completed);
    }

    #[test]
    fn test_fatal_error_stops_with_issue() {
        let analyzer = Flaky {
            recoverable_at: None,
            fatal_at: Some(1),
        };
        let report = runner().run("a.wav", &mut three_windows(), &analyzer);

        assert_eq!(report.chunks_analyzed, 1);
        assert!(!report.completed);
        assert!(report.issues[0].contains("Analysis stopped at chunk 1"));
    }

    struct PanicsAt(usize);

    impl ChunkAnalyzer for PanicsAt {
        fn analyze_chunk(&self, window: &ChunkWindow<'_>) -> Result<ChunkMetrics, ChunkError> {
            if window.index == self.0 {
                panic!("index out of range in filter bank");
            }
            FirstSample.analyze_chunk(window)
        }
    }

    #[test]
    fn test_analyzer_panic_becomes_fatal_issue() {
        let report = runner().run("a.wav", &mut three_windows(), &PanicsAt(1));

        assert_eq!(report.chunks_analyzed, 1);
        assert!(!report.completed);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].contains("Analysis stopped at chunk 1"));
        assert!(report.issues[0].contains("filter bank"));
    }

    #[test]
    fn test_partial_final_window() {
        let source = &mut MemoryChunkSource::new(vec![0.5; 25], 10);
        let report = runner().run("a.wav", source, &FirstSample);

        assert_eq!(report.chunks_analyzed, 3);
        assert_eq!(report.total_samples, 25);
    }

    #[test]
    fn test_empty_stream() {
        let source = &mut MemoryChunkSource::new(Vec::new(), 44100);
        let report = runner().run("a.wav", source, &FirstSample);

        assert_eq!(report.chunks_analyzed, 0);
        assert!(report.means().is_empty());
        assert_eq!(report.clipping_ratio(), 0.0);
    }

    #[test]
    fn test_memory_ceiling_forces_reclaim_each_window() {
        let probe = Arc::new(HighMemory {
            reclaims: AtomicUsize::new(0),
        });
        let runner = ChunkedAnalysisRunner::new(1.0, 1024, probe.clone());
        let report = runner.run("a.wav", &mut three_windows(), &FirstSample);

        assert_eq!(report.reclaims, 3);
        assert_eq!(probe.reclaims.load(Ordering::SeqCst), 3);
        assert!((report.mean("level").unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_clipping_ratio() {
        let mut samples = vec![0.0f32; 90];
        samples.extend(vec![1.0f32; 10]);
        let report = runner().run(
            "a.wav",
            &mut MemoryChunkSource::new(samples, 100),
            &FirstSample,
        );
        assert!((report.clipping_ratio() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_metric_totals_merge_is_weighted() {
        let mut a = MetricTotals::default();
        a.add("rms", 1.0);

        let mut b = MetricTotals::default();
        b.add("rms", 4.0);
        b.add("rms", 4.0);
        b.add("rms", 4.0);

        a.merge(&b);
        // (1 + 12) / 4, not (1 + 4) / 2
        assert_eq!(a.mean("rms"), Some(3.25));
    }

    #[test]
    fn test_non_finite_values_ignored() {
        let mut totals = MetricTotals::default();
        let values = BTreeMap::from([
            ("a".to_string(), f64::NAN),
            ("b".to_string(), 2.0),
        ]);
        totals.add_all(&values);
        assert_eq!(totals.mean("a"), None);
        assert_eq!(totals.mean("b"), Some(2.0));
    }

    #[test]
    fn test_zero_chunk_seconds_falls_back() {
        let runner = ChunkedAnalysisRunner::new(0.0, 0, Arc::new(NullMemoryProbe));
        assert_eq!(runner.chunk_samples(44100), 44100);
    }
}
