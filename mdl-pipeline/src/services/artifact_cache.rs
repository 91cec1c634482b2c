//! Artifact cache
//!
//! Side-channel store for expensive intermediate results (feature vectors
//! and the like), one JSON document per file under a dedicated directory.
//!
//! Each entry records the identity and content hash it was computed for.
//! A lookup hits only when both match the caller's, so two files sharing a
//! stem never see each other's artifact and a changed file never gets its
//! old one back. Entry names carry a short digest of the identity, so
//! same-stem files in different directories keep separate entries.
//! No eviction.

use mdl_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk entry layout
#[derive(Serialize)]
struct EntryRef<'a, T: ?Sized> {
    identity: &'a str,
    content_hash: &'a str,
    artifact: &'a T,
}

#[derive(Deserialize)]
struct Entry<T> {
    identity: String,
    content_hash: String,
    artifact: T,
}

/// Directory-backed JSON artifact cache
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    kind: String,
}

impl ArtifactCache {
    /// Cache for artifacts of `kind` (e.g. `"features"`) under `dir`
    pub fn new(dir: impl Into<PathBuf>, kind: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            kind: kind.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Location of the entry for `id`: `<dir>/<stem>-<digest>_<kind>.json`
    ///
    /// `digest` is the first 8 hex characters of the identity's SHA-256.
    pub fn entry_path(&self, id: &str) -> PathBuf {
        let stem = Path::new(id)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let digest = format!("{:x}", Sha256::digest(id.as_bytes()));
        self.dir
            .join(format!("{}-{}_{}.json", stem, &digest[..8], self.kind))
    }

    /// Cached artifact for `id` computed from content `content_hash`
    ///
    /// A missing, unreadable or undecodable entry is a miss, as is one
    /// written for another identity or other content.
    pub fn get<T: DeserializeOwned>(&self, id: &str, content_hash: &str) -> Option<T> {
        let path = self.entry_path(id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(entry = %path.display(), error = %e, "Cache entry unreadable");
                return None;
            }
        };

        let entry: Entry<T> = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(entry = %path.display(), error = %e, "Corrupt cache entry ignored");
                return None;
            }
        };

        if entry.identity != id {
            debug!(entry = %path.display(), owner = %entry.identity, "Cache entry belongs to another file");
            return None;
        }
        if entry.content_hash != content_hash {
            debug!(entry = %path.display(), "Cache entry is for older content");
            return None;
        }

        debug!(entry = %path.display(), "Cache hit");
        Some(entry.artifact)
    }

    /// Store `artifact` for `id` at content `content_hash`, replacing any
    /// previous entry at the same location
    pub fn put<T: Serialize + ?Sized>(
        &self,
        id: &str,
        content_hash: &str,
        artifact: &T,
    ) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.entry_path(id);
        let entry = EntryRef {
            identity: id,
            content_hash,
            artifact,
        };
        mdl_common::fs::write_json_atomic(&path, &entry)?;
        debug!(entry = %path.display(), "Cache entry written");
        Ok(())
    }

    /// Remove every entry of this kind
    ///
    /// # Returns
    /// Number of entries removed
    pub fn clear(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };

        let suffix = format!("_{}.json", self.kind);
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let is_entry = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(&suffix))
                .unwrap_or(false);
            if is_entry && path.is_file() {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }

        debug!(dir = %self.dir.display(), kind = %self.kind, removed, "Cache cleared");
        Ok(removed)
    }
}
