//! Service modules for the pipeline
//!
//! Incremental processing core (state store, change detection, batch
//! execution, artifact cache), chunked analysis with its parallel sweep,
//! discovery, and the orchestrator tying them together.

pub mod analysis_sweep;
pub mod artifact_cache;
pub mod batch_executor;
pub mod change_detector;
pub mod chunked_analysis;
pub mod content_hasher;
pub mod file_scanner;
pub mod memory_probe;
pub mod pipeline_orchestrator;
pub mod progress_reporter;
pub mod state_store;

pub use analysis_sweep::{AnalysisSweep, SweepOutcome, SweepSummary, WorkerCommand};
pub use artifact_cache::ArtifactCache;
pub use batch_executor::{BatchExecutor, BatchReport};
pub use change_detector::{ChangeDecision, ChangeDetector};
pub use chunked_analysis::{
    AnalysisError, AnalysisReport, ChunkAnalyzer, ChunkError, ChunkMetrics, ChunkSource,
    ChunkedAnalysisRunner,
};
pub use content_hasher::ContentHasher;
pub use file_scanner::{FileScanner, ScanError, ScanSummary};
pub use memory_probe::{MemoryProbe, NullMemoryProbe, SystemMemoryProbe};
pub use pipeline_orchestrator::{PipelineError, PipelineOrchestrator, SourceProvider, Step};
pub use progress_reporter::ProgressReporter;
pub use state_store::FileStateStore;
