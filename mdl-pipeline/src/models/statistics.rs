//! Run statistics
//!
//! Collected by the orchestrator while phases run and written to
//! `pipeline_stats.json` whether the run succeeds or fails.

use crate::models::StateSummary;
use crate::types::FileOutcome;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Counts for one phase batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseStats {
    /// Wall-clock duration of the phase
    pub duration_secs: f64,
    /// Files actually (re)processed
    pub files_processed: usize,
    #[serde(default)]
    pub files_skipped: usize,
    #[serde(default)]
    pub files_failed: usize,
}

impl PhaseStats {
    /// Tally batch outcomes
    pub fn from_outcomes(outcomes: &[FileOutcome], elapsed: Duration) -> Self {
        let mut stats = PhaseStats {
            duration_secs: elapsed.as_secs_f64(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                FileOutcome::Processed => stats.files_processed += 1,
                FileOutcome::Skipped(_) => stats.files_skipped += 1,
                FileOutcome::Failed(_) => stats.files_failed += 1,
            }
        }
        stats
    }

    pub fn display_string(&self) -> String {
        format!(
            "{} processed, {} skipped, {} failed in {:.2}s",
            self.files_processed, self.files_skipped, self.files_failed, self.duration_secs
        )
    }
}

/// Statistics of one orchestrator run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatistics {
    /// Run start (epoch seconds)
    pub start_time: f64,
    /// Phase name → counts
    pub phases: BTreeMap<String, PhaseStats>,
    /// Orchestrator-level and per-file error descriptions
    pub errors: Vec<String>,
    /// Run duration, set when the run ends (successfully or not)
    #[serde(default)]
    pub total_duration: Option<f64>,
    /// Stored state at the end of the run
    #[serde(default)]
    pub final_state: Option<StateSummary>,
}

impl RunStatistics {
    pub fn new(start_time: f64) -> Self {
        Self {
            start_time,
            phases: BTreeMap::new(),
            errors: Vec::new(),
            total_duration: None,
            final_state: None,
        }
    }

    pub fn record_phase(&mut self, name: &str, stats: PhaseStats) {
        self.phases.insert(name.to_string(), stats);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Processed count summed over every recorded phase
    pub fn total_processed(&self) -> usize {
        self.phases.values().map(|p| p.files_processed).sum()
    }

    /// Stamp the end-of-run fields
    pub fn finish(&mut self, elapsed: Duration, final_state: StateSummary) {
        self.total_duration = Some(elapsed.as_secs_f64());
        self.final_state = Some(final_state);
    }
}
