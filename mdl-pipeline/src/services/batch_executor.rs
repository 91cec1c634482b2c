//! Batch executor
//!
//! Drives one processor over a list of files for one phase.
//!
//! # Per-file sequence
//! 0. Later repeats of an identity already in the batch → `Skipped(Duplicate)`
//! 1. Cancelled → `Skipped(Cancelled)`
//! 2. Missing input → `Skipped(Missing)`
//! 3. Change detection says up to date → `Skipped(UpToDate)`
//! 4. Cached artifact for the current content (when a cache is attached)
//!    or processor call
//! 5. Re-hash, advance the file's state under the store's writer lock
//!
//! Any error or panic in steps 3-5 becomes `Failed` for that file only;
//! siblings keep running. Concurrency is bounded by `max_workers` through
//! `futures::stream::buffer_unordered`; outcomes come back in input order.

use crate::models::{FileState, PhaseStats, ProgressCounters};
use crate::services::artifact_cache::ArtifactCache;
use crate::services::change_detector::{ChangeDecision, ChangeDetector};
use crate::services::content_hasher::ContentHasher;
use crate::services::state_store::FileStateStore;
use crate::types::{file_identity, panic_message, FileOutcome, Phase, Processor, SkipReason};
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcomes of one batch
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub phase: Phase,
    /// One outcome per input file, in input order
    pub outcomes: Vec<FileOutcome>,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_processed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_skipped()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    /// `true` per input file that was (re)processed in this batch
    pub fn processed_flags(&self) -> Vec<bool> {
        self.outcomes.iter().map(FileOutcome::is_processed).collect()
    }

    /// Failure descriptions as `"<file>: <reason>"`
    pub fn failures<'a>(&'a self, files: &'a [PathBuf]) -> impl Iterator<Item = String> + 'a {
        files
            .iter()
            .zip(&self.outcomes)
            .filter_map(|(path, outcome)| match outcome {
                FileOutcome::Failed(reason) => Some(format!("{}: {}", path.display(), reason)),
                _ => None,
            })
    }

    pub fn to_phase_stats(&self) -> PhaseStats {
        PhaseStats::from_outcomes(&self.outcomes, self.elapsed)
    }
}

/// Bounded-concurrency batch executor
pub struct BatchExecutor {
    store: Arc<FileStateStore>,
    detector: ChangeDetector,
    hasher: ContentHasher,
    progress: Arc<ProgressCounters>,
    cancel: CancellationToken,
    max_workers: usize,
}

impl BatchExecutor {
    /// Create an executor writing to `store` and reporting into `progress`
    ///
    /// `max_workers` of zero is treated as one.
    pub fn new(
        store: Arc<FileStateStore>,
        progress: Arc<ProgressCounters>,
        max_workers: usize,
    ) -> Self {
        Self {
            detector: ChangeDetector::new(Arc::clone(&store)),
            store,
            hasher: ContentHasher::new(),
            progress,
            cancel: CancellationToken::new(),
            max_workers: max_workers.max(1),
        }
    }

    /// Use an externally owned stop signal
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `processor` over `files` for `phase`
    ///
    /// # Arguments
    /// * `files` - Inputs, processed concurrently
    /// * `processor` - Phase processor
    /// * `phase` - Phase flag set on success
    /// * `output_dir` - When given, each file's output path is
    ///   `output_dir/<file name>`
    /// * `cache` - When given, a cached artifact replaces the processor call
    ///   and successful results are written back
    ///
    /// # Returns
    /// Report with one outcome per input, in input order. Never fails as a
    /// whole: file-level errors are captured in the outcomes.
    pub async fn run_batch(
        &self,
        files: &[PathBuf],
        processor: Arc<dyn Processor>,
        phase: Phase,
        output_dir: Option<&Path>,
        cache: Option<&ArtifactCache>,
    ) -> BatchReport {
        let start = Instant::now();
        self.progress.begin_phase(phase.as_str(), files.len());

        info!(
            phase = %phase,
            processor = processor.name(),
            file_count = files.len(),
            workers = self.max_workers,
            "Starting batch"
        );

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        let unique: Vec<(usize, &PathBuf)> = files
            .iter()
            .enumerate()
            .filter(|(index, path)| {
                let first = seen.insert(file_identity(path));
                if !first {
                    duplicates.push(*index);
                }
                first
            })
            .collect();

        for &index in &duplicates {
            debug!(file = %files[index].display(), phase = %phase, "Skipping - repeated in batch");
            self.progress.record_skipped();
        }

        let mut indexed: Vec<(usize, FileOutcome)> = stream::iter(unique)
            .map(|(index, path)| {
                let processor = Arc::clone(&processor);
                async move {
                    let output = output_dir.and_then(|dir| path.file_name().map(|n| dir.join(n)));
                    let outcome = self
                        .process_one(path, processor.as_ref(), phase, output.as_deref(), cache)
                        .await;
                    (index, outcome)
                }
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        indexed.extend(
            duplicates
                .into_iter()
                .map(|index| (index, FileOutcome::Skipped(SkipReason::Duplicate))),
        );
        indexed.sort_by_key(|(index, _)| *index);
        let outcomes: Vec<FileOutcome> = indexed.into_iter().map(|(_, o)| o).collect();

        let report = BatchReport {
            phase,
            outcomes,
            elapsed: start.elapsed(),
        };

        info!(
            phase = %phase,
            processed = report.processed(),
            skipped = report.skipped(),
            failed = report.failed(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Batch completed"
        );

        report
    }

    // ========================================================================
    // Per-file work
    // ========================================================================

    async fn process_one(
        &self,
        path: &Path,
        processor: &dyn Processor,
        phase: Phase,
        output: Option<&Path>,
        cache: Option<&ArtifactCache>,
    ) -> FileOutcome {
        if self.cancel.is_cancelled() {
            self.progress.record_skipped();
            return FileOutcome::Skipped(SkipReason::Cancelled);
        }

        if !path.exists() {
            warn!(file = %path.display(), phase = %phase, "File not found");
            self.progress.record_skipped();
            return FileOutcome::Skipped(SkipReason::Missing);
        }

        let decision = match self.detector.evaluate_async(path, phase).await {
            Ok(decision) if !decision.needs_processing() => {
                debug!(file = %path.display(), phase = %phase, "Skipping - already processed");
                self.progress.record_skipped();
                return FileOutcome::Skipped(SkipReason::UpToDate);
            }
            Ok(decision) => {
                debug!(file = %path.display(), phase = %phase, decision = ?decision, "Processing");
                decision
            }
            Err(e) => {
                return self.fail(path, phase, format!("Change detection failed: {}", e));
            }
        };

        let id = file_identity(path);

        // Cache entries are bound to content, so the lookup needs the hash
        let content_hash = match (cache, decision) {
            (None, _) => None,
            (Some(_), ChangeDecision::ContentChanged { current, .. }) => Some(current),
            (Some(_), _) => match self.hasher.hash_file_async(path).await {
                Ok(hash) => Some(hash),
                Err(e) => return self.fail(path, phase, format!("Hashing failed: {}", e)),
            },
        };

        let cached = match (cache, content_hash.as_deref()) {
            (Some(cache), Some(hash)) => cache.get::<serde_json::Value>(&id, hash),
            _ => None,
        };
        if cached.is_some() {
            debug!(file = %path.display(), phase = %phase, "Using cached artifact");
        } else {
            let call = AssertUnwindSafe(processor.process_file(path, output)).catch_unwind();
            let artifact = match call.await {
                Ok(Ok(artifact)) => artifact,
                Ok(Err(e)) => return self.fail(path, phase, e.to_string()),
                Err(panic) => {
                    let reason = format!("Processor panicked: {}", panic_message(panic.as_ref()));
                    return self.fail(path, phase, reason);
                }
            };

            if let (Some(cache), Some(hash)) = (cache, content_hash.as_deref()) {
                if let Err(e) = cache.put(&id, hash, &artifact) {
                    warn!(file = %path.display(), error = %e, "Failed to cache artifact");
                }
            }
        }

        if let Err(reason) = self.commit(path, id, phase).await {
            return self.fail(path, phase, reason);
        }

        self.progress.record_processed();
        FileOutcome::Processed
    }

    /// Re-hash and persist the advanced state for one file
    async fn commit(&self, path: &Path, id: String, phase: Phase) -> Result<(), String> {
        let hash = self
            .hasher
            .hash_file_async(path)
            .await
            .map_err(|e| format!("Hashing after processing failed: {}", e))?;

        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            store.update(&id, |previous| {
                FileState::advance(previous, &hash, phase, mdl_common::time::epoch_seconds())
            })
        })
        .await
        .map_err(|e| format!("State commit task failed: {}", e))?
        .map(|_| ())
        .map_err(|e| format!("State commit failed: {}", e))
    }

    fn fail(&self, path: &Path, phase: Phase, reason: String) -> FileOutcome {
        error!(file = %path.display(), phase = %phase, error = %reason, "File processing failed");
        self.progress.record_failed();
        FileOutcome::Failed(reason)
    }
}
