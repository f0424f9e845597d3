#![allow(clippy::module_name_repetitions)]
//! Store file locations.

use std::path::{Path, PathBuf};

/// Returns the write-ahead log path `DuckDB` keeps next to a store file.
#[must_use]
pub fn wal_path(store: &Path) -> PathBuf {
    let mut name = store.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

/// Deletes a store file and its write-ahead log, if present.
///
/// # Errors
///
/// Returns an I/O error if either file exists but cannot be removed.
pub fn remove_store_files(store: &Path) -> std::io::Result<()> {
    for path in [store.to_path_buf(), wal_path(store)] {
        if path.exists() {
            log::info!("Removing existing store file {}", path.display());
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an I/O error if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.as_os_str().is_empty() && !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
