use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Last consumed position within one tracked file, as persisted in the cursor file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    pub identity: String,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<u64>,
    #[serde(default)]
    pub updated_at: i64,
}

/// Identity signals of a file observed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStamp {
    pub size: u64,
    pub inode: Option<u64>,
    pub device: Option<u64>,
}

impl FileStamp {
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            size: metadata.len(),
            inode: Some(metadata.ino()),
            device: Some(metadata.dev()),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            size: metadata.len(),
            inode: None,
            device: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    Truncated,
    Replaced,
}

/// Where the next read of a file should begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub offset: u64,
    pub reset: Option<ResetReason>,
}

/// Cursor state shared by every file pipeline of a scan cycle.
///
/// Updates land in a concurrent in-memory map; [`CursorStore::save`] replaces the
/// durable copy in one step (temp file, fsync, rename) so an interrupted save
/// leaves the previous state intact.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    entries: DashMap<String, FileCursor>,
}

impl CursorStore {
    /// Load the cursor file at `path`. A missing or unreadable file yields an empty
    /// store so that every file is read from the beginning.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = DashMap::new();

        match fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<Vec<FileCursor>>(&raw) {
                Ok(cursors) => {
                    for cursor in cursors {
                        entries.insert(cursor.identity.clone(), cursor);
                    }
                    info!(
                        path = %path.display(),
                        tracked_files = entries.len(),
                        "loaded cursor state"
                    );
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %path.display(),
                        "cursor state is corrupt; starting from the beginning of every file"
                    );
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no cursor state found; starting fresh");
            }
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    "failed to read cursor state; starting from the beginning of every file"
                );
            }
        }

        Self { path, entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self, identity: &str) -> Option<FileCursor> {
        self.entries.get(identity).map(|entry| entry.value().clone())
    }

    /// Recorded offset for `identity`, or 0 when the file has never been read.
    pub fn get(&self, identity: &str) -> u64 {
        self.entries
            .get(identity)
            .map(|entry| entry.offset)
            .unwrap_or(0)
    }

    /// Decide where to resume reading given what the file looks like now.
    pub fn resume_point(&self, identity: &str, stamp: &FileStamp) -> ResumePoint {
        let Some(cursor) = self.cursor(identity) else {
            return ResumePoint {
                offset: 0,
                reset: None,
            };
        };

        let replaced = matches!(
            (cursor.inode, stamp.inode, cursor.device, stamp.device),
            (Some(old_ino), Some(new_ino), Some(old_dev), Some(new_dev))
                if old_ino != new_ino || old_dev != new_dev
        );
        if replaced {
            return ResumePoint {
                offset: 0,
                reset: Some(ResetReason::Replaced),
            };
        }

        if cursor.offset > stamp.size {
            return ResumePoint {
                offset: 0,
                reset: Some(ResetReason::Truncated),
            };
        }

        ResumePoint {
            offset: cursor.offset,
            reset: None,
        }
    }

    pub fn set(&self, identity: &str, offset: u64, stamp: &FileStamp) {
        let cursor = FileCursor {
            identity: identity.to_string(),
            offset,
            inode: stamp.inode,
            device: stamp.device,
            updated_at: current_timestamp(),
        };
        self.entries.insert(identity.to_string(), cursor);
    }

    /// True for the cursor file itself and for temp files left behind by [`CursorStore::save`].
    pub fn is_state_file(&self, candidate: &Path) -> bool {
        if candidate == self.path {
            return true;
        }
        let (Some(state_name), Some(candidate_name)) = (
            self.path.file_name().and_then(|n| n.to_str()),
            candidate.file_name().and_then(|n| n.to_str()),
        ) else {
            return false;
        };
        candidate.parent() == self.path.parent()
            && candidate_name.starts_with(&format!("{state_name}."))
            && candidate_name.ends_with(".tmp")
    }

    pub async fn save(&self) -> Result<()> {
        let mut snapshot: Vec<FileCursor> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        snapshot.sort_by(|a, b| a.identity.cmp(&b.identity));

        let serialized =
            serde_json::to_vec_pretty(&snapshot).context("failed to encode cursor state")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await.with_context(|| {
                    format!("failed to create cursor directory {}", parent.display())
                })?;
            }
        }

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("cursor_state.json");
        let temp_path = self
            .path
            .with_file_name(format!("{}.{}.tmp", file_name, Uuid::new_v4()));

        if let Err(err) = write_synced(&temp_path, &serialized).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "failed to rename {} to {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }

        debug!(
            path = %self.path.display(),
            tracked_files = snapshot.len(),
            "persisted cursor state"
        );
        Ok(())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("failed to sync {}", path.display()))?;
    Ok(())
}

/// Key under which a file's cursor is stored.
pub fn identity_for(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
