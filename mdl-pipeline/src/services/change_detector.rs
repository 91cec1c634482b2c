//! Change detection
//!
//! Decides whether a file must be (re)processed for a phase.
//!
//! # Decision order
//! 1. No stored entry → process (no hashing on first sight)
//! 2. Current hash differs from stored hash → process (every flag is stale)
//! 3. Otherwise → process only if the phase flag is not set
//!
//! Whenever an entry exists the hash is recomputed, so staleness always
//! wins over a stored flag.

use crate::services::content_hasher::ContentHasher;
use crate::services::state_store::FileStateStore;
use crate::types::{file_identity, Phase};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Change decision with its reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    /// No stored entry for the file
    NewFile,
    /// Stored hash no longer matches the content
    ContentChanged { stored: String, current: String },
    /// Content unchanged, phase not completed yet
    PhaseIncomplete,
    /// Content unchanged and phase complete
    UpToDate,
}

impl ChangeDecision {
    pub fn needs_processing(&self) -> bool {
        !matches!(self, ChangeDecision::UpToDate)
    }
}

/// Change detector over a shared state store
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    store: Arc<FileStateStore>,
    hasher: ContentHasher,
}

impl ChangeDetector {
    pub fn new(store: Arc<FileStateStore>) -> Self {
        Self {
            store,
            hasher: ContentHasher::new(),
        }
    }

    /// Evaluate the decision for `path` and `phase`
    ///
    /// # Errors
    /// I/O error when an entry exists but the file cannot be hashed
    pub fn evaluate(&self, path: &Path, phase: Phase) -> std::io::Result<ChangeDecision> {
        let id = file_identity(path);

        let Some(stored) = self.store.get(&id) else {
            debug!(file = %id, phase = %phase, "No stored state");
            return Ok(ChangeDecision::NewFile);
        };

        let current = self.hasher.hash_file(path)?;
        Ok(Self::decide(&stored.content_hash, &current, stored.is_complete(phase)))
    }

    /// Async variant hashing on the blocking pool
    pub async fn evaluate_async(
        &self,
        path: &Path,
        phase: Phase,
    ) -> std::io::Result<ChangeDecision> {
        let id = file_identity(path);

        let Some(stored) = self.store.get(&id) else {
            debug!(file = %id, phase = %phase, "No stored state");
            return Ok(ChangeDecision::NewFile);
        };

        let current = self.hasher.hash_file_async(path).await?;
        Ok(Self::decide(&stored.content_hash, &current, stored.is_complete(phase)))
    }

    /// `true` when `path` must be processed for `phase`
    pub fn needs_processing(&self, path: &Path, phase: Phase) -> std::io::Result<bool> {
        Ok(self.evaluate(path, phase)?.needs_processing())
    }

    fn decide(stored_hash: &str, current_hash: &str, phase_done: bool) -> ChangeDecision {
        if stored_hash != current_hash {
            ChangeDecision::ContentChanged {
                stored: stored_hash.to_string(),
                current: current_hash.to_string(),
            }
        } else if phase_done {
            ChangeDecision::UpToDate
        } else {
            ChangeDecision::PhaseIncomplete
        }
    }
}
