//! Recursive enumeration of the files under the tracked root.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// List every regular file below `root`, sorted by path.
///
/// Only an inaccessible root is an error. Subdirectories that cannot be read are
/// logged and skipped so one bad path does not cost the whole cycle.
pub fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let metadata = std::fs::metadata(root)
        .with_context(|| format!("failed to read metadata for {}", root.display()))?;
    if !metadata.is_dir() {
        bail!("{} is not a directory", root.display());
    }

    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to read directory {}", root.display()))?;

    let mut files = Vec::new();
    collect_entries(root, entries, &mut files);
    files.sort();

    debug!(
        root = %root.display(),
        file_count = files.len(),
        "list_files complete"
    );
    Ok(files)
}

fn collect_entries(dir: &Path, entries: std::fs::ReadDir, files: &mut Vec<PathBuf>) {
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, path = %dir.display(), "failed to read directory entry");
                continue;
            }
        };
        let path = entry.path();

        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read file type");
                continue;
            }
        };

        if file_type.is_dir() {
            match std::fs::read_dir(&path) {
                Ok(children) => collect_entries(&path, children, files),
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        "skipping unreadable directory"
                    );
                }
            }
        } else if file_type.is_file() {
            files.push(path);
        } else if file_type.is_symlink() {
            // Linked files are tracked; linked directories are not followed.
            if std::fs::metadata(&path).map(|m| m.is_file()).unwrap_or(false) {
                files.push(path);
            } else {
                debug!(path = %path.display(), "skipping symlink that is not a regular file");
            }
        }
    }
}
