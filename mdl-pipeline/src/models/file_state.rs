//! Per-file processing state
//!
//! A `FileState` records which phases completed for one content version of
//! a file. The content hash is the version: flags stored next to a hash that
//! no longer matches the file are stale, whatever their value.

use crate::types::{FileIdentity, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State of one tracked file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// Content digest at last successful processing
    pub content_hash: String,

    /// Last successful commit (epoch seconds)
    pub last_processed: f64,

    /// Phase name → completed for `content_hash`
    ///
    /// Keyed by name rather than [`Phase`] so flags written by other
    /// versions survive a load and save cycle.
    pub phases: BTreeMap<String, bool>,
}

impl FileState {
    /// Create a state with no completed phases
    pub fn new(content_hash: impl Into<String>, last_processed: f64) -> Self {
        Self {
            content_hash: content_hash.into(),
            last_processed,
            phases: BTreeMap::new(),
        }
    }

    /// Stored flag for `phase` (absent counts as not completed)
    pub fn is_complete(&self, phase: Phase) -> bool {
        self.phases.get(phase.as_str()).copied().unwrap_or(false)
    }

    /// Builder-style flag setter
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.insert(phase.as_str().to_string(), true);
        self
    }

    /// State after `phase` completed against content hashing to `new_hash`
    ///
    /// Flags of other phases carry over from `previous` only when the hash
    /// is unchanged; across a content change they would describe a
    /// different version of the file and are dropped.
    pub fn advance(
        previous: Option<&FileState>,
        new_hash: &str,
        phase: Phase,
        now: f64,
    ) -> FileState {
        let mut next = FileState::new(new_hash, now);

        if let Some(prev) = previous {
            if prev.content_hash == new_hash {
                next.phases = prev
                    .phases
                    .iter()
                    .filter(|(_, done)| **done)
                    .map(|(name, done)| (name.clone(), *done))
                    .collect();
            }
        }

        next.with_phase(phase)
    }
}

/// Full mapping persisted as one document
pub type PipelineState = BTreeMap<FileIdentity, FileState>;

/// Counts of tracked files per completed phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    /// Files with a state entry
    pub total_files: usize,
    /// Phase name → files whose stored flag is set
    pub phases: BTreeMap<String, usize>,
}

impl StateSummary {
    /// Summarize stored flags (does not re-hash, so stale flags still count)
    pub fn from_state(state: &PipelineState) -> Self {
        let mut phases: BTreeMap<String, usize> = Phase::ALL
            .iter()
            .map(|p| (p.as_str().to_string(), 0))
            .collect();

        for file_state in state.values() {
            for (name, done) in &file_state.phases {
                if *done {
                    *phases.entry(name.clone()).or_insert(0) += 1;
                }
            }
        }

        Self {
            total_files: state.len(),
            phases,
        }
    }

    /// Files with `phase` complete
    pub fn completed(&self, phase: Phase) -> usize {
        self.phases.get(phase.as_str()).copied().unwrap_or(0)
    }
}
