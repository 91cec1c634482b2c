//! Core Types and Trait Definitions
//!
//! Defines the vocabulary shared by every pipeline component:
//! - **Phase:** named step a file either has or has not completed
//! - **Processor:** swappable unit of work invoked once per file per phase
//! - **FileOutcome:** what a batch did with each input file
//!
//! Processors own all domain computation. The batch machinery only sees
//! the opaque JSON document a processor returns and whether it returned.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Phases
// ============================================================================

/// Named processing step
///
/// The string form is the key persisted in each file's phase flags, so it
/// must never change for an existing variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Derived copy written in the standard sample format
    Standardized,
    /// Quality checks ran against the current content
    Validated,
    /// Feature vector extracted
    Features,
    /// Tag and format metadata extracted
    Metadata,
}

impl Phase {
    /// Every phase, in pipeline order
    pub const ALL: [Phase; 4] = [
        Phase::Standardized,
        Phase::Validated,
        Phase::Features,
        Phase::Metadata,
    ];

    /// Persisted flag name
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Standardized => "standardized",
            Phase::Validated => "validated",
            Phase::Features => "features",
            Phase::Metadata => "metadata",
        }
    }

    /// Parse a persisted flag name
    pub fn from_name(name: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// File Identity
// ============================================================================

/// Stable key of a tracked file (its absolute path as a string)
///
/// Not versioned: the content hash stored alongside it is the version.
pub type FileIdentity = String;

/// Build the identity key for a path
///
/// Relative paths are made absolute against the working directory so the
/// same file always maps to the same key. Canonicalization is avoided on
/// purpose: a missing file must still produce a key.
pub fn file_identity(path: &Path) -> FileIdentity {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    absolute.to_string_lossy().into_owned()
}

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Batch Outcomes
// ============================================================================

/// Why a file was not handed to the processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Input file does not exist
    Missing,
    /// Phase already complete for the current content
    UpToDate,
    /// Stop was requested before the file started
    Cancelled,
    /// Same file identity already appears earlier in the batch
    Duplicate,
}

/// Per-file result of a batch
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// Processor ran (or a cached artifact was used) and state was committed
    Processed,
    /// File was not processed
    Skipped(SkipReason),
    /// Processing or commit failed; the error text is kept for reporting
    Failed(String),
}

impl FileOutcome {
    /// True only when the file was actually (re)processed in this batch
    pub fn is_processed(&self) -> bool {
        matches!(self, FileOutcome::Processed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FileOutcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, FileOutcome::Skipped(_))
    }
}

// ============================================================================
// Processor Capability
// ============================================================================

/// Processor errors
///
/// Every variant is a per-file failure: the batch records it and moves on.
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported input: {0}")]
    Unsupported(String),

    #[error("Processing failed: {0}")]
    Failed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Unit of work for one phase
///
/// `process_file` must either finish its work for `input` and return, or
/// return an error. The batch commits phase completion only after a
/// successful return, so a processor never needs its own bookkeeping.
///
/// # Example
/// ```rust,ignore
/// struct Tagger;
///
/// #[async_trait::async_trait]
/// impl Processor for Tagger {
///     fn name(&self) -> &'static str { "tagger" }
///
///     async fn process_file(&self, input: &Path, _output: Option<&Path>)
///         -> Result<serde_json::Value, ProcessorError>
///     {
///         Ok(serde_json::json!({ "file": input.display().to_string() }))
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    /// Processor name for logs and statistics
    fn name(&self) -> &'static str;

    /// Process one file
    ///
    /// # Arguments
    /// * `input` - File to process
    /// * `output` - Destination for phases that write a derived file;
    ///   `None` means the phase works in place or writes nothing
    ///
    /// # Returns
    /// Opaque result document (cached by phases that attach an artifact cache)
    async fn process_file(
        &self,
        input: &Path,
        output: Option<&Path>,
    ) -> Result<serde_json::Value, ProcessorError>;
}

// ============================================================================
// Quality Check Result
// ============================================================================

/// Result of the quality-check processor
///
/// The batch machinery never reads `issues` or `metrics`; a validator that
/// returns at all has completed the phase for this content version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub passed: bool,
    pub issues: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ValidationResult {
    /// Build a result; `passed` is derived from the issue list
    pub fn new(issues: Vec<String>, metrics: BTreeMap<String, f64>) -> Self {
        Self {
            passed: issues.is_empty(),
            issues,
            metrics,
            timestamp: mdl_common::time::now(),
        }
    }
}
