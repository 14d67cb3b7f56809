//! Remove files a stash manifest does not reference

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use xstash_core::{StashResult, CHUNK_EXTENSION, MANIFEST_FILE};

use crate::decode::load_manifest;

#[derive(Debug, Default)]
pub struct CleanReport {
    /// Files deleted (or that would be deleted on a dry run), sorted
    pub removed: Vec<PathBuf>,
    /// Referenced chunk files left in place
    pub kept: usize,
    /// `.xmap` was missing, so only `*.xpart` files were considered
    pub interrupted: bool,
}

/// Delete regular files in `dir` that are neither `.xmap` nor a chunk the
/// manifest lists. Subdirectories are never touched.
///
/// A directory without `.xmap` is what an interrupted encode leaves behind.
/// There nothing is referenced, so every `*.xpart` file goes; files with
/// other names (e.g. from a chunk name template) are left alone.
pub fn clean_stash(dir: &Path, dry_run: bool) -> StashResult<CleanReport> {
    let mut report = CleanReport::default();
    let manifest = if dir.join(MANIFEST_FILE).exists() {
        Some(load_manifest(dir)?)
    } else {
        warn!(dir = %dir.display(), "no manifest, treating as an interrupted encode");
        report.interrupted = true;
        None
    };
    let referenced: HashSet<&str> = manifest
        .iter()
        .flat_map(|m| m.chunks())
        .map(|c| c.file.as_str())
        .collect();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name();
        let keep = match name.to_str() {
            Some(n) if n == MANIFEST_FILE => true,
            Some(n) if referenced.contains(n) => {
                report.kept += 1;
                true
            }
            _ if manifest.is_none() => path.extension().map_or(true, |ext| ext != CHUNK_EXTENSION),
            _ => false,
        };
        if !keep {
            report.removed.push(path);
        }
    }
    report.removed.sort();

    for path in &report.removed {
        if dry_run {
            info!(file = %path.display(), "would remove");
        } else {
            warn!(file = %path.display(), "removing unreferenced file");
            fs::remove_file(path)?;
        }
    }
    Ok(report)
}
