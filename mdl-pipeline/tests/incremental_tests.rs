//! Incremental processing integration tests
//!
//! Exercise the state store, change detector and batch executor together
//! against real files on disk.

mod helpers;

use helpers::{generate_test_library, AudioConfig, CountingProcessor};
use mdl_pipeline::models::{FileState, ProgressCounters};
use mdl_pipeline::services::{BatchExecutor, ChangeDetector, ContentHasher, FileStateStore};
use mdl_pipeline::types::{file_identity, FileOutcome, Phase, SkipReason};
use serial_test::serial;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn executor_for(state_file: &Path, workers: usize) -> (Arc<FileStateStore>, BatchExecutor) {
    let store = Arc::new(FileStateStore::open(state_file));
    let executor = BatchExecutor::new(
        Arc::clone(&store),
        Arc::new(ProgressCounters::new()),
        workers,
    );
    (store, executor)
}

fn library(dir: &Path, count: usize) -> Vec<PathBuf> {
    let config = AudioConfig {
        duration_seconds: 0.2,
        sample_rate: 8000,
        channels: 1,
        ..Default::default()
    };
    generate_test_library(&dir.join("downloads"), count, &config).unwrap()
}

#[tokio::test]
async fn test_second_run_invokes_processor_zero_times() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 4);
    let (_, executor) = executor_for(&dir.path().join("state.json"), 2);

    for phase in [Phase::Validated, Phase::Features, Phase::Metadata] {
        let processor = Arc::new(CountingProcessor::new());
        let first = executor
            .run_batch(&files, processor.clone(), phase, None, None)
            .await;
        assert_eq!(first.processed(), 4);
        assert_eq!(processor.calls(), 4);

        let processor = Arc::new(CountingProcessor::new());
        let second = executor
            .run_batch(&files, processor.clone(), phase, None, None)
            .await;
        assert_eq!(processor.calls(), 0, "phase {} reran unchanged files", phase);
        assert_eq!(second.processed_flags(), vec![false; 4]);
        assert!(second
            .outcomes
            .iter()
            .all(|o| *o == FileOutcome::Skipped(SkipReason::UpToDate)));
    }
}

#[tokio::test]
async fn test_idempotence_survives_restart() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 3);
    let state_file = dir.path().join("state.json");

    {
        let (_, executor) = executor_for(&state_file, 3);
        let processor = Arc::new(CountingProcessor::new());
        executor
            .run_batch(&files, processor, Phase::Validated, None, None)
            .await;
    }

    let (store, executor) = executor_for(&state_file, 3);
    assert_eq!(store.len(), 3);

    let processor = Arc::new(CountingProcessor::new());
    executor
        .run_batch(&files, processor.clone(), Phase::Validated, None, None)
        .await;
    assert_eq!(processor.calls(), 0);
}

#[tokio::test]
async fn test_content_change_triggers_reprocessing_for_all_phases() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 3);
    let (store, executor) = executor_for(&dir.path().join("state.json"), 2);

    let phases = [Phase::Validated, Phase::Features, Phase::Metadata];
    for phase in phases {
        executor
            .run_batch(&files, Arc::new(CountingProcessor::new()), phase, None, None)
            .await;
    }

    // Rewrite the middle file with different content
    let changed = &files[1];
    std::fs::write(changed, b"RIFF replaced content").unwrap();

    for phase in phases {
        let processor = Arc::new(CountingProcessor::new());
        let report = executor
            .run_batch(&files, processor.clone(), phase, None, None)
            .await;
        assert_eq!(processor.calls(), 1, "phase {}", phase);
        assert_eq!(processor.seen(), vec![changed.clone()]);
        assert_eq!(report.processed_flags(), vec![false, true, false]);
    }

    let state = store.get(&file_identity(changed)).unwrap();
    assert_eq!(state.content_hash, ContentHasher::new().hash_file(changed).unwrap());
    for phase in phases {
        assert!(state.is_complete(phase));
    }
}

#[tokio::test]
async fn test_changed_content_resets_other_phases() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 1);
    let (store, executor) = executor_for(&dir.path().join("state.json"), 1);

    executor
        .run_batch(&files, Arc::new(CountingProcessor::new()), Phase::Validated, None, None)
        .await;
    executor
        .run_batch(&files, Arc::new(CountingProcessor::new()), Phase::Metadata, None, None)
        .await;

    std::fs::write(&files[0], b"new bytes").unwrap();
    executor
        .run_batch(&files, Arc::new(CountingProcessor::new()), Phase::Validated, None, None)
        .await;

    let state = store.get(&file_identity(&files[0])).unwrap();
    assert!(state.is_complete(Phase::Validated));
    assert!(!state.is_complete(Phase::Metadata));
}

#[tokio::test]
async fn test_failure_is_isolated_to_its_file() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 3);
    let (store, executor) = executor_for(&dir.path().join("state.json"), 3);

    let processor = Arc::new(CountingProcessor::new().failing_on("track_002.wav"));
    let report = executor
        .run_batch(&files, processor.clone(), Phase::Validated, None, None)
        .await;

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.processed_flags(), vec![true, false, true]);
    assert_eq!(report.processed(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(&report.outcomes[1], FileOutcome::Failed(reason) if reason.contains("cannot read")));

    // Failed file has no committed state; the next run retries it
    assert!(store.get(&file_identity(&files[1])).is_none());
    let retry = Arc::new(CountingProcessor::new());
    executor
        .run_batch(&files, retry.clone(), Phase::Validated, None, None)
        .await;
    assert_eq!(retry.seen(), vec![files[1].clone()]);
}

#[tokio::test]
async fn test_isolation_with_many_files() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 10);
    let (_, executor) = executor_for(&dir.path().join("state.json"), 4);

    let processor = Arc::new(CountingProcessor::new().failing_on("track_007.wav"));
    let report = executor
        .run_batch(&files, processor, Phase::Features, None, None)
        .await;

    assert_eq!(report.outcomes.len(), 10);
    assert_eq!(report.processed(), 9);
    assert_eq!(report.failed(), 1);
    assert!(report.outcomes[6].is_failed());
    let failures: Vec<String> = report.failures(&files).collect();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("track_007.wav"));
}

#[tokio::test]
async fn test_state_file_holds_exactly_completed_commits() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 6);
    let state_file = dir.path().join("state.json");
    let (_, executor) = executor_for(&state_file, 6);

    let processor = Arc::new(
        CountingProcessor::new()
            .failing_on("track_002.wav")
            .failing_on("track_005.wav"),
    );
    executor
        .run_batch(&files, processor, Phase::Validated, None, None)
        .await;

    let text = std::fs::read_to_string(&state_file).unwrap();
    let document: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(FileStateStore::validate(&document));

    let reloaded = FileStateStore::load(&state_file);
    assert_eq!(reloaded.len(), 4);
    for (i, file) in files.iter().enumerate() {
        let present = reloaded.contains_key(&file_identity(file));
        assert_eq!(present, i != 1 && i != 4, "file {}", i);
    }

    // No temp files left beside the state file
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    assert_eq!(leftovers.len(), 1);
}

#[tokio::test]
async fn test_needs_processing_scenario() {
    let dir = TempDir::new().unwrap();
    let a = dir.path().join("a.wav");
    let b = dir.path().join("b.wav");
    std::fs::write(&a, b"content one").unwrap();
    std::fs::write(&b, b"content two").unwrap();

    let store = Arc::new(FileStateStore::open(dir.path().join("state.json")));
    let hash = ContentHasher::new().hash_file(&a).unwrap();
    store
        .commit(&file_identity(&a), FileState::new(hash, 0.0).with_phase(Phase::Validated))
        .unwrap();

    let detector = ChangeDetector::new(store);
    assert!(!detector.needs_processing(&a, Phase::Validated).unwrap());
    assert!(detector.needs_processing(&a, Phase::Metadata).unwrap());
    assert!(detector.needs_processing(&b, Phase::Validated).unwrap());
}

#[tokio::test]
async fn test_corrupt_state_file_starts_empty() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 2);
    let state_file = dir.path().join("state.json");
    std::fs::write(&state_file, b"{ this is not json").unwrap();

    let (store, executor) = executor_for(&state_file, 2);
    assert!(store.is_empty());

    let processor = Arc::new(CountingProcessor::new());
    executor
        .run_batch(&files, processor.clone(), Phase::Validated, None, None)
        .await;
    assert_eq!(processor.calls(), 2);
    assert_eq!(FileStateStore::load(&state_file).len(), 2);
}

#[tokio::test]
#[serial]
async fn test_relative_and_absolute_paths_share_state() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let files = library(&root, 1);
    let (store, executor) = executor_for(&root.join("state.json"), 1);

    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(&root).unwrap();
    let relative = vec![PathBuf::from("downloads/track_001.wav")];
    executor
        .run_batch(&relative, Arc::new(CountingProcessor::new()), Phase::Validated, None, None)
        .await;
    std::env::set_current_dir(previous).unwrap();

    let processor = Arc::new(CountingProcessor::new());
    executor
        .run_batch(&files, processor.clone(), Phase::Validated, None, None)
        .await;
    assert_eq!(processor.calls(), 0);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_repeated_file_in_batch_processed_once() {
    let dir = TempDir::new().unwrap();
    let files = library(dir.path(), 2);
    let (store, executor) = executor_for(&dir.path().join("state.json"), 4);

    let batch = vec![files[0].clone(), files[1].clone(), files[0].clone(), files[0].clone()];
    let processor = Arc::new(CountingProcessor::new());
    let report = executor
        .run_batch(&batch, processor.clone(), Phase::Validated, None, None)
        .await;

    assert_eq!(processor.calls(), 2);
    assert_eq!(report.processed_flags(), vec![true, true, false, false]);
    assert_eq!(report.outcomes[2], FileOutcome::Skipped(SkipReason::Duplicate));
    assert_eq!(store.len(), 2);
}
