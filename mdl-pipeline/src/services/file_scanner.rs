//! Audio file discovery
//!
//! Finds the audio files already present under the downloads directory so a
//! run with nothing new to download still processes the collection.
//!
//! Two passes: a sequential `walkdir` traversal collecting candidates by
//! extension, then a parallel header check that drops files whose first
//! bytes are not a known audio container. Output is sorted for stable batch
//! order across runs.

use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Extensions treated as audio candidates
pub const AUDIO_EXTENSIONS: [&str; 7] = ["mp3", "wav", "flac", "ogg", "oga", "m4a", "aac"];

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("File access error {0}: {1}")]
    FileAccess(PathBuf, String),
}

/// Discovery statistics
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub files: Vec<PathBuf>,
    pub total_bytes: u64,
    /// Lowercase extension → file count
    pub by_format: BTreeMap<String, usize>,
    /// Candidates rejected by the header check
    pub rejected: usize,
}

/// Recursive audio file scanner
pub struct FileScanner {
    ignore_patterns: Vec<String>,
    max_depth: Option<usize>,
}

impl FileScanner {
    /// Scanner skipping OS metadata files, VCS directories and partial downloads
    pub fn new() -> Self {
        Self {
            ignore_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                ".git".to_string(),
                ".part".to_string(),
                ".ytdl".to_string(),
            ],
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Audio files under `root`, sorted
    pub fn scan(&self, root: &Path) -> Result<Vec<PathBuf>, ScanError> {
        Ok(self.scan_with_summary(root)?.files)
    }

    /// Audio files under `root` with size and format counts
    pub fn scan_with_summary(&self, root: &Path) -> Result<ScanSummary, ScanError> {
        if !root.exists() {
            return Err(ScanError::PathNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        // Pass 1: traversal (sequential, the loop guard is mutable)
        let mut visited_links = HashSet::new();
        let mut candidates = Vec::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|e| self.keep_entry(e, &mut visited_links));

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() && has_audio_extension(entry.path()) => {
                    candidates.push(entry.into_path());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Error accessing entry"),
            }
        }

        // Pass 2: header check
        let verified: Vec<(PathBuf, u64)> = candidates
            .par_iter()
            .filter_map(|path| match sniff_audio_header(path) {
                Ok(true) => {
                    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                    Some((path.clone(), size))
                }
                Ok(false) => None,
                Err(e) => {
                    tracing::warn!(file = %path.display(), error = %e, "Header check failed");
                    None
                }
            })
            .collect();

        let mut summary = ScanSummary {
            rejected: candidates.len() - verified.len(),
            ..Default::default()
        };
        for (path, size) in verified {
            summary.total_bytes += size;
            if let Some(ext) = path.extension() {
                *summary
                    .by_format
                    .entry(ext.to_string_lossy().to_lowercase())
                    .or_insert(0) += 1;
            }
            summary.files.push(path);
        }
        summary.files.sort();

        tracing::debug!(
            root = %root.display(),
            files = summary.files.len(),
            rejected = summary.rejected,
            "Scan complete"
        );

        Ok(summary)
    }

    fn keep_entry(&self, entry: &DirEntry, visited_links: &mut HashSet<PathBuf>) -> bool {
        let name = entry.file_name().to_string_lossy();
        if self.ignore_patterns.iter().any(|p| name.contains(p.as_str())) {
            return false;
        }

        if entry.file_type().is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !visited_links.insert(canonical) {
                    tracing::warn!(path = %entry.path().display(), "Symlink loop detected");
                    return false;
                }
            }
        }

        true
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            AUDIO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Check the leading bytes against known audio containers
fn sniff_audio_header(path: &Path) -> Result<bool, ScanError> {
    let mut file =
        File::open(path).map_err(|e| ScanError::FileAccess(path.to_path_buf(), e.to_string()))?;

    let mut header = [0u8; 12];
    let read = file
        .read(&mut header)
        .map_err(|e| ScanError::FileAccess(path.to_path_buf(), e.to_string()))?;
    if read < 4 {
        return Ok(false);
    }

    Ok(match &header[..read] {
        [0xFF, b, ..] if b & 0xE0 == 0xE0 => true, // MPEG frame sync (MP3, ADTS AAC)
        [b'I', b'D', b'3', ..] => true,
        [b'f', b'L', b'a', b'C', ..] => true,
        [b'O', b'g', b'g', b'S', ..] => true,
        [_, _, _, _, b'f', b't', b'y', b'p', ..] => true,
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E'] => true,
        _ => false,
    })
}
