//! Incremental media processing pipeline
//!
//! Tracks every file of an audio collection through download, validation,
//! feature extraction and metadata extraction. Work is keyed by content
//! hash, so reruns only touch what changed.

pub mod models;
pub mod processors;
pub mod services;
pub mod types;
pub mod utils;

pub use services::{PipelineError, PipelineOrchestrator, Step};
pub use types::{Phase, Processor, ProcessorError};
