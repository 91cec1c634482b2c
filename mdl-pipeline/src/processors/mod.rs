//! Per-file processors run by the batch executor

pub mod feature_extractor;
pub mod metadata_processor;
pub mod quality_validator;
pub mod signal_stats;

pub use feature_extractor::{FeatureDocument, FeatureExtractor};
pub use metadata_processor::{MetadataDocument, MetadataProcessor};
pub use quality_validator::QualityValidator;
pub use signal_stats::SignalStatsAnalyzer;
