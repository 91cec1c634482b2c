//! Persisted per-file state store
//!
//! Single source of truth for "has this exact content completed phase P".
//!
//! # Lifecycle
//! - **Load:** read `pipeline_state.json`; a missing file is an empty state,
//!   a malformed or schema-invalid document is backed up and replaced by an
//!   empty state (degraded start, never a crash)
//! - **Commit:** upsert one entry and rewrite the whole document atomically,
//!   once per finished file
//!
//! # Concurrency
//! Entries live behind an `RwLock` so readers never observe a half-applied
//! update. All writes (in memory and on disk) additionally pass through one
//! writer mutex, which keeps the on-disk document in commit order.

use crate::models::{FileState, PipelineState, StateSummary};
use mdl_common::{Error, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Fields every persisted entry must carry
pub const REQUIRED_FIELDS: [&str; 3] = ["content_hash", "last_processed", "phases"];

/// File state store backed by one JSON document
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    state: RwLock<PipelineState>,
    writer: Mutex<()>,
}

impl FileStateStore {
    /// Open the store at `path`, loading whatever valid state exists
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Self::load(&path);
        info!(
            path = %path.display(),
            entries = state.len(),
            "State store opened"
        );
        Self {
            path,
            state: RwLock::new(state),
            writer: Mutex::new(()),
        }
    }

    /// Read persisted state
    ///
    /// Never fails: every problem degrades to an empty state. Unreadable
    /// documents are moved aside to `<name>.bak` for inspection.
    pub fn load(path: &Path) -> PipelineState {
        Self::load_document(path, true)
    }

    /// Read persisted state without touching the file
    ///
    /// Same degradation rules as [`FileStateStore::load`], but a corrupt
    /// document stays where it is.
    pub fn load_read_only(path: &Path) -> PipelineState {
        Self::load_document(path, false)
    }

    fn load_document(path: &Path, backup: bool) -> PipelineState {
        if !path.exists() {
            debug!(path = %path.display(), "No state file, starting empty");
            return PipelineState::new();
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State file unreadable, starting fresh");
                return PipelineState::new();
            }
        };

        let document: Value = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed state file, starting fresh");
                if backup {
                    Self::backup_corrupt(path);
                }
                return PipelineState::new();
            }
        };

        if !Self::validate(&document) {
            warn!(path = %path.display(), "Invalid state detected, starting fresh");
            if backup {
                Self::backup_corrupt(path);
            }
            return PipelineState::new();
        }

        match serde_json::from_value::<PipelineState>(document) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State schema mismatch, starting fresh");
                if backup {
                    Self::backup_corrupt(path);
                }
                PipelineState::new()
            }
        }
    }

    /// Check a raw document against the entry schema
    ///
    /// The document must be an object whose every value is an object with a
    /// string `content_hash`, a numeric `last_processed` and a `phases`
    /// object of booleans. One bad entry fails the whole document.
    pub fn validate(document: &Value) -> bool {
        let Some(entries) = document.as_object() else {
            return false;
        };

        entries.values().all(|entry| {
            let Some(fields) = entry.as_object() else {
                return false;
            };
            if !REQUIRED_FIELDS.iter().all(|f| fields.contains_key(*f)) {
                return false;
            }
            let hash_ok = fields["content_hash"].is_string();
            let time_ok = fields["last_processed"].is_number();
            let phases_ok = fields["phases"]
                .as_object()
                .map(|phases| phases.values().all(Value::is_boolean))
                .unwrap_or(false);
            hash_ok && time_ok && phases_ok
        })
    }

    /// Persist the full map atomically
    pub fn save(&self) -> Result<()> {
        let _writer = self.lock_writer();
        self.write_snapshot()
    }

    /// Stored state for `id`
    pub fn get(&self, id: &str) -> Option<FileState> {
        self.read().get(id).cloned()
    }

    /// Replace the entry for `id` in memory
    pub fn upsert(&self, id: &str, new_state: FileState) {
        let _writer = self.lock_writer();
        self.write().insert(id.to_string(), new_state);
    }

    /// Upsert and flush in one critical section
    ///
    /// A crash after this returns keeps the entry; a crash before it leaves
    /// the previous document intact on disk.
    pub fn commit(&self, id: &str, new_state: FileState) -> Result<()> {
        let _writer = self.lock_writer();
        self.write().insert(id.to_string(), new_state);
        self.write_snapshot()?;
        debug!(file = %id, "State committed");
        Ok(())
    }

    /// Derive and commit the entry for `id` in one critical section
    ///
    /// `f` receives the stored entry as of inside the writer lock, so
    /// concurrent updates of one file never lose each other's flags.
    pub fn update<F>(&self, id: &str, f: F) -> Result<FileState>
    where
        F: FnOnce(Option<&FileState>) -> FileState,
    {
        let _writer = self.lock_writer();
        let next = {
            let previous = self.read().get(id).cloned();
            f(previous.as_ref())
        };
        self.write().insert(id.to_string(), next.clone());
        self.write_snapshot()?;
        debug!(file = %id, "State updated");
        Ok(next)
    }

    /// Copy of the full map
    pub fn snapshot(&self) -> PipelineState {
        self.read().clone()
    }

    /// Per-phase completion counts of the stored state
    pub fn summary(&self) -> StateSummary {
        StateSummary::from_state(&self.read())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ------------------------------------------------------------------------
    // Private Helper Methods
    // ------------------------------------------------------------------------

    // Caller holds the writer mutex.
    fn write_snapshot(&self) -> Result<()> {
        let bytes = {
            let state = self.read();
            serde_json::to_vec_pretty(&*state).map_err(Error::from)?
        };
        mdl_common::fs::write_bytes_atomic(&self.path, &bytes)
    }

    fn backup_corrupt(path: &Path) {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        let backup = PathBuf::from(backup);
        match std::fs::rename(path, &backup) {
            Ok(()) => info!(backup = %backup.display(), "Corrupt state file backed up"),
            Err(e) => warn!(error = %e, "Failed to back up corrupt state file"),
        }
    }

    // Every mutation is a single map insert, so a poisoned lock still
    // guards a consistent map.
    fn read(&self) -> RwLockReadGuard<'_, PipelineState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, PipelineState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Phase;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn state_path(dir: &TempDir) -> PathBuf {
        dir.path().join("pipeline_state.json")
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(state_path(&dir));
        assert!(store.is_empty());
    }

    #[test]
    fn test_commit_then_reopen_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);

        let store = FileStateStore::open(&path);
        store
            .commit("/m/a.wav", FileState::new("h1", 5.0).with_phase(Phase::Validated))
            .unwrap();

        let reopened = FileStateStore::open(&path);
        let entry = reopened.get("/m/a.wav").unwrap();
        assert_eq!(entry.content_hash, "h1");
        assert!(entry.is_complete(Phase::Validated));
    }

    #[test]
    fn test_malformed_json_degrades_to_empty_and_backs_up() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        std::fs::write(&path, "{ not json").unwrap();

        let store = FileStateStore::open(&path);
        assert!(store.is_empty());
        assert!(dir.path().join("pipeline_state.json.bak").exists());
    }

    #[test]
    fn test_entry_missing_required_field_discards_everything() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        let doc = json!({
            "/m/a.wav": {"content_hash": "h1", "last_processed": 1.0, "phases": {}},
            "/m/b.wav": {"content_hash": "h2", "phases": {}}
        });
        std::fs::write(&path, doc.to_string()).unwrap();

        let store = FileStateStore::open(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_validate_rejects_wrong_types() {
        assert!(!FileStateStore::validate(&json!([])));
        assert!(!FileStateStore::validate(&json!({"x": 3})));
        assert!(!FileStateStore::validate(&json!({
            "x": {"content_hash": 7, "last_processed": 1.0, "phases": {}}
        })));
        assert!(!FileStateStore::validate(&json!({
            "x": {"content_hash": "h", "last_processed": 1.0, "phases": {"validated": "yes"}}
        })));
        assert!(FileStateStore::validate(&json!({
            "x": {"content_hash": "h", "last_processed": 1, "phases": {"validated": true}}
        })));
        assert!(FileStateStore::validate(&json!({})));
    }

    #[test]
    fn test_upsert_replaces_entry_without_flushing() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        let store = FileStateStore::open(&path);

        store.upsert("/m/a.wav", FileState::new("h1", 1.0));
        store.upsert("/m/a.wav", FileState::new("h2", 2.0));

        assert_eq!(store.get("/m/a.wav").unwrap().content_hash, "h2");
        assert!(!path.exists());

        store.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_concurrent_commits_leave_parseable_complete_document() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        let store = Arc::new(FileStateStore::open(&path));

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..10 {
                        let id = format!("/m/{}_{}.wav", worker, i);
                        store
                            .commit(&id, FileState::new(format!("h{}", i), 1.0))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let doc: Value = serde_json::from_str(&content).unwrap();
        assert!(FileStateStore::validate(&doc));
        assert_eq!(doc.as_object().unwrap().len(), 80);
    }

    #[test]
    fn test_read_only_load_leaves_corrupt_file_in_place() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        std::fs::write(&path, "{ not json").unwrap();

        assert!(FileStateStore::load_read_only(&path).is_empty());
        assert!(path.exists());
        assert!(!dir.path().join("pipeline_state.json.bak").exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_concurrent_updates_of_one_file_keep_every_phase() {
        let dir = TempDir::new().unwrap();
        let path = state_path(&dir);
        let store = Arc::new(FileStateStore::open(&path));
        store.commit("/m/a.wav", FileState::new("h1", 1.0)).unwrap();

        let phases = [Phase::Validated, Phase::Features, Phase::Metadata];
        let handles: Vec<_> = phases
            .into_iter()
            .map(|phase| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store
                        .update("/m/a.wav", |previous| {
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            FileState::advance(previous, "h1", phase, 2.0)
                        })
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reopened = FileStateStore::open(&path);
        let entry = reopened.get("/m/a.wav").unwrap();
        for phase in phases {
            assert!(entry.is_complete(phase), "lost {}", phase);
        }
    }
}
