//! Phase-scoped progress counters
//!
//! Shared by every worker of a batch behind one mutex of its own, separate
//! from the state store lock. Workers only increment; reporters only read
//! snapshots.

use serde::Serialize;
use std::sync::Mutex;

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Files in the current batch
    pub total_files: usize,
    /// Files processed (not skipped, not failed)
    pub processed_files: usize,
    /// Files that failed
    pub failed_files: usize,
    /// Files skipped (missing, up to date, cancelled, repeated)
    pub skipped_files: usize,
    /// Phase the batch is running
    pub current_phase: String,
}

impl ProgressSnapshot {
    /// Files the batch has finished with, whatever the result
    pub fn settled(&self) -> usize {
        self.processed_files + self.failed_files + self.skipped_files
    }

    /// Completion percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.total_files == 0 {
            0.0
        } else {
            (self.settled() as f64 / self.total_files as f64) * 100.0
        }
    }

    /// True once every file of the batch has settled
    pub fn is_complete(&self) -> bool {
        self.settled() >= self.total_files
    }
}

/// Process-wide progress counters
#[derive(Debug, Default)]
pub struct ProgressCounters {
    inner: Mutex<ProgressSnapshot>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset for a new batch
    pub fn begin_phase(&self, phase: &str, total_files: usize) {
        let mut guard = self.lock();
        *guard = ProgressSnapshot {
            total_files,
            current_phase: phase.to_string(),
            ..ProgressSnapshot::default()
        };
    }

    pub fn record_processed(&self) {
        self.lock().processed_files += 1;
    }

    pub fn record_failed(&self) {
        self.lock().failed_files += 1;
    }

    pub fn record_skipped(&self) {
        self.lock().skipped_files += 1;
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().clone()
    }

    // A panicking worker cannot leave the counters half-updated (every
    // mutation is a single field write), so a poisoned lock is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, ProgressSnapshot> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
