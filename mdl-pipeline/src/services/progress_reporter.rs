//! Progress reporting
//!
//! Background task polling [`ProgressCounters`] at a fixed interval and
//! emitting a progress line whenever the settled count moves.

use crate::models::{ProgressCounters, ProgressSnapshot};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Handle to a running progress poller
pub struct ProgressReporter {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Start polling `counters` every `interval`
    pub fn spawn(counters: Arc<ProgressCounters>, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let task_stop = stop.clone();

        let handle = tokio::spawn(async move {
            tracing::debug!("Progress monitoring task started");
            let mut clock = PhaseClock::new(Instant::now());

            loop {
                tokio::select! {
                    _ = task_stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let snapshot = counters.snapshot();
                if let Some(elapsed) = clock.observe(&snapshot, Instant::now()) {
                    log_progress(&snapshot, elapsed);
                }
            }

            tracing::debug!("Progress monitoring task completed");
        });

        Self { stop, handle }
    }

    /// Stop polling and wait for the task to exit
    pub async fn finish(self) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Progress task ended abnormally");
        }
    }
}

/// Per-phase timing for rate and ETA
///
/// Restarts whenever the counters move to another phase, so each phase's
/// rate covers only its own files and time.
#[derive(Debug)]
struct PhaseClock {
    phase: String,
    start: Instant,
    last_settled: usize,
}

impl PhaseClock {
    fn new(now: Instant) -> Self {
        Self {
            phase: String::new(),
            start: now,
            last_settled: 0,
        }
    }

    /// Elapsed time in the current phase when `snapshot` should be logged
    fn observe(&mut self, snapshot: &ProgressSnapshot, now: Instant) -> Option<Duration> {
        let settled = snapshot.settled();
        if snapshot.current_phase != self.phase {
            // The first phase keeps the spawn time as its start
            if !self.phase.is_empty() {
                self.start = now;
            }
            self.phase = snapshot.current_phase.clone();
            self.last_settled = 0;
        } else if settled < self.last_settled {
            self.start = now;
            self.last_settled = 0;
        }
        if settled == self.last_settled {
            return None;
        }
        self.last_settled = settled;
        Some(now.duration_since(self.start))
    }
}

/// Files per second and remaining seconds for a snapshot
pub fn rate_and_eta(snapshot: &ProgressSnapshot, elapsed: Duration) -> (f64, u64) {
    let settled = snapshot.settled();
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { settled as f64 / secs } else { 0.0 };
    let remaining = snapshot.total_files.saturating_sub(settled);
    let eta = if rate > 0.0 {
        (remaining as f64 / rate) as u64
    } else {
        0
    };
    (rate, eta)
}

fn log_progress(snapshot: &ProgressSnapshot, elapsed: Duration) {
    let (rate, eta_secs) = rate_and_eta(snapshot, elapsed);
    tracing::info!(
        phase = %snapshot.current_phase,
        processed = snapshot.processed_files,
        skipped = snapshot.skipped_files,
        failed = snapshot.failed_files,
        total = snapshot.total_files,
        "Progress: {}/{} ({:.1}%) | Rate: {:.1} files/sec | ETA: {}s",
        snapshot.settled(),
        snapshot.total_files,
        snapshot.percentage(),
        rate,
        eta_secs
    );
}
