//! Atomic document writes
//!
//! Documents are serialized into a temporary file created next to the target
//! and renamed over it, so readers only ever see the old or the new content.

use crate::{Error, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Serialize `value` as pretty JSON and atomically replace `target`
pub fn write_json_atomic<T: Serialize + ?Sized>(target: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(target, &bytes)
}

/// Atomically replace `target` with `bytes`
///
/// The temporary file lives in the target's directory so the final rename
/// never crosses a filesystem boundary.
pub fn write_bytes_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    staged.write_all(bytes)?;
    staged.as_file().sync_all()?;
    staged
        .persist(target)
        .map_err(|e| Error::Io(e.error))?;

    tracing::trace!(path = %target.display(), bytes = bytes.len(), "Document written");
    Ok(())
}
