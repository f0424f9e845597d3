//! Local geodatabase discovery and selection.

use std::path::{Path, PathBuf};

use crate::GdbError;

/// Finds every `*.gdb` directory under `root`, sorted and de-duplicated.
///
/// Geodatabase directories are not descended into.
///
/// # Errors
///
/// Returns [`GdbError::Io`] if a directory cannot be read.
pub fn discover_gdbs(root: &Path) -> Result<Vec<PathBuf>, GdbError> {
    let mut found = Vec::new();
    walk(root, &mut found)?;
    found.sort();
    found.dedup();
    log::info!("Found {} geodatabases under {}", found.len(), root.display());
    Ok(found)
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), GdbError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        if is_gdb(&path) {
            found.push(path);
        } else {
            walk(&path, found)?;
        }
    }
    Ok(())
}

fn is_gdb(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gdb"))
}

/// Filters sources by company and date, then caps the count.
///
/// Both filters are case-insensitive substring matches against the path,
/// which for BDGD releases carries the distributor name and reference
/// date (e.g. `ENEL_SP_391_2023-12-31_V11.gdb`).
#[must_use]
pub fn select_sources(
    paths: &[PathBuf],
    company: Option<&str>,
    date: Option<&str>,
    max_sources: Option<usize>,
) -> Vec<PathBuf> {
    let company = company.map(str::to_lowercase);
    let date = date.map(str::to_lowercase);

    let selected: Vec<PathBuf> = paths
        .iter()
        .filter(|path| {
            let haystack = path.to_string_lossy().to_lowercase();
            company.as_deref().is_none_or(|c| haystack.contains(c))
                && date.as_deref().is_none_or(|d| haystack.contains(d))
        })
        .take(max_sources.unwrap_or(usize::MAX))
        .cloned()
        .collect();

    if selected.len() < paths.len() {
        log::info!(
            "Selected {} of {} geodatabases",
            selected.len(),
            paths.len()
        );
    }

    selected
}
