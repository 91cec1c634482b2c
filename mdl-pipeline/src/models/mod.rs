//! Data models for the pipeline
//!
//! - Per-file state and its persisted map
//! - Progress counters shared by batch workers
//! - Run statistics

pub mod file_state;
pub mod progress;
pub mod statistics;

pub use file_state::{FileState, PipelineState, StateSummary};
pub use progress::{ProgressCounters, ProgressSnapshot};
pub use statistics::{PhaseStats, RunStatistics};
