//! Content hashing for change detection
//!
//! Calculates the SHA-256 digest of a file's bytes. The digest is the
//! version identifier of a file: two runs over identical bytes always agree,
//! on any platform.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Read block size (1MB at a time for memory efficiency)
pub const HASH_BLOCK_SIZE: usize = 1024 * 1024;

/// Hex-encoded content digest
pub type ContentHash = String;

/// Stateless file hasher
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHasher;

impl ContentHasher {
    pub fn new() -> Self {
        Self
    }

    /// Calculate SHA-256 hash of file
    ///
    /// **Algorithm:**
    /// 1. Read file content in fixed-size blocks
    /// 2. Fold each block into the digest
    /// 3. Return lowercase hex string
    ///
    /// # Errors
    /// I/O error when the file cannot be opened or read. Nothing is cached,
    /// so a later call retries from scratch.
    pub fn hash_file(&self, file_path: &Path) -> std::io::Result<ContentHash> {
        let mut file = File::open(file_path).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Failed to open {} for hashing: {}", file_path.display(), e),
            )
        })?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BLOCK_SIZE];

        loop {
            let bytes_read = match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(std::io::Error::new(
                        e.kind(),
                        format!("Failed to read {} for hashing: {}", file_path.display(), e),
                    ))
                }
            };
            hasher.update(&buffer[..bytes_read]);
        }

        let hash = format!("{:x}", hasher.finalize());

        tracing::trace!(path = %file_path.display(), hash = %hash, "Calculated hash");
        Ok(hash)
    }

    /// Hash on the blocking pool so async workers never stall on disk reads
    pub async fn hash_file_async(&self, file_path: &Path) -> std::io::Result<ContentHash> {
        let hasher = *self;
        let path: PathBuf = file_path.to_path_buf();
        tokio::task::spawn_blocking(move || hasher.hash_file(&path))
            .await
            .map_err(|e| std::io::Error::other(format!("Hash task failed: {}", e)))?
    }
}
