//! Crash-safe file writes.
//!
//! Content goes to a temp file in the destination directory, is synced, then
//! renamed into place. A reader sees either the old file or the new one, never
//! a torn write.

use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn staged(path: &Path, bytes: &[u8]) -> io::Result<NamedTempFile> {
    let mut tmp = NamedTempFile::new_in(parent_dir(path))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Replace `path` with `bytes`, creating it if missing.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = staged(path, bytes)?;
    if let Err(err) = tmp.persist(path) {
        if !path.exists() {
            return Err(err.error);
        }
        // Rename-over-existing is not atomic everywhere; swap via a backup.
        let backup = path.with_extension("bak");
        let _ = std::fs::remove_file(&backup);
        std::fs::rename(path, &backup)?;
        if let Err(retry) = err.file.persist(path) {
            let _ = std::fs::rename(&backup, path);
            return Err(retry.error);
        }
        if let Err(e) = std::fs::remove_file(&backup) {
            tracing::warn!(path = %backup.display(), "Failed to remove backup after write: {e}");
        }
    }
    Ok(())
}

/// Write `bytes` to `path`, failing with [`io::ErrorKind::AlreadyExists`] if
/// something is already there.
pub(crate) fn atomic_write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = staged(path, bytes)?;
    tmp.persist_noclobber(path).map_err(|err| err.error)?;
    Ok(())
}
