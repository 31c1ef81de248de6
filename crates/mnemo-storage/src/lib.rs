//! Filesystem persistence for the mnemo record store.
//!
//! Owns the on-disk layout under a base directory and the primitive file
//! operations the store is built on. It knows nothing about what a record
//! contains; callers hand it paths and text.
//!
//! ```text
//! .mnemo/
//!   patterns/  decisions/  preferences/  insights/
//!   relationships/  reflections/
//!   project/requirements/  project/designs/
//!   project/tasks/  project/bugs/
//!   jobs/
//! ```
//!
//! Record files are replaced with a write-to-temp-then-rename sequence so a
//! reader never sees a partially written record.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

mod error;
pub mod slug;

pub use error::{Error, Result};

/// Subdirectories created under the base directory.
pub const LAYOUT_DIRS: &[&str] = &[
    "patterns",
    "decisions",
    "preferences",
    "insights",
    "relationships",
    "reflections",
    "project/requirements",
    "project/designs",
    "project/tasks",
    "project/bugs",
    "jobs",
];

/// Directory holding delegation job output logs.
pub const JOBS_DIR: &str = "jobs";

/// Entries whose presence marks a directory as a project root.
pub const PROJECT_MARKERS: &[&str] = &[
    ".git",
    "package.json",
    "Cargo.toml",
    "pyproject.toml",
    "go.mod",
];

/// Walk up from `start` looking for a project marker.
///
/// Returns the first ancestor (including `start` itself) that contains one
/// of [`PROJECT_MARKERS`]. Falls back to `start` when none is found.
pub async fn resolve_project_root(start: &Path) -> PathBuf {
    let mut current = Some(start);

    while let Some(dir) = current {
        for marker in PROJECT_MARKERS {
            if fs::try_exists(dir.join(marker)).await.unwrap_or(false) {
                debug!(root = %dir.display(), marker, "Resolved project root");
                return dir.to_path_buf();
            }
        }
        current = dir.parent();
    }

    debug!(start = %start.display(), "No project marker found, using start directory");
    start.to_path_buf()
}

/// Service for record file persistence under a base directory.
#[derive(Debug, Clone)]
pub struct StorageService {
    base_dir: PathBuf,
}

impl StorageService {
    /// Create a storage service rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The base directory all layout directories live under.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the job output directory.
    pub fn jobs_dir(&self) -> PathBuf {
        self.base_dir.join(JOBS_DIR)
    }

    /// Create every layout directory. Safe to call repeatedly.
    pub async fn ensure_layout(&self) -> Result<()> {
        for dir in LAYOUT_DIRS {
            fs::create_dir_all(self.base_dir.join(dir)).await?;
        }
        debug!(base_dir = %self.base_dir.display(), "Storage layout ensured");
        Ok(())
    }

    /// Replace `path` with `content` atomically.
    ///
    /// The content is written and synced to a temporary sibling first and
    /// then renamed over the target, so the target is either the previous
    /// version or the new one, never a truncated file.
    pub async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = write_temp(path, content).await?;

        if let Err(e) = commit_temp(&temp_path, path).await {
            // Leave the previous version in place and clean up the orphan.
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        info!(path = %path.display(), bytes = content.len(), "Wrote file");
        Ok(())
    }

    /// Append `content` to `path`, creating it if absent.
    ///
    /// Used for job output logs, which have a single writer per job.
    pub async fn append(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read a file to a string. Returns `None` when it does not exist.
    pub async fn read(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if a file exists.
    pub async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Recursively list files under `dir`, optionally filtered by extension.
    ///
    /// Directories that cannot be read are skipped with a warning rather
    /// than failing the whole listing. A missing `dir` yields an empty list.
    /// The result is sorted for stable iteration order.
    pub async fn list_recursive(&self, dir: &Path, extension: Option<&str>) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];

        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(dir = %current.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(dir = %current.display(), error = %e, "Failed to read directory entry");
                        break;
                    }
                };

                let entry_path = entry.path();
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };

                if file_type.is_dir() {
                    pending.push(entry_path);
                } else if file_type.is_file() {
                    let matches = match extension {
                        Some(ext) => entry_path.extension().is_some_and(|e| e == ext),
                        None => true,
                    };
                    if matches {
                        files.push(entry_path);
                    }
                }
            }
        }

        files.sort();
        files
    }

    /// Delete a file. A file that does not exist counts as deleted.
    ///
    /// Returns whether a file was actually removed.
    pub async fn delete(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Deleted file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Temporary sibling used while replacing `path`.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// First half of an atomic write: fully write and sync the temp file.
async fn write_temp(path: &Path, content: &str) -> Result<PathBuf> {
    let temp_path = temp_path_for(path);

    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|source| Error::AtomicWrite {
            path: path.display().to_string(),
            source,
        })?;
    let written = async {
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await
    }
    .await;

    if let Err(source) = written {
        drop(file);
        let _ = fs::remove_file(&temp_path).await;
        return Err(Error::AtomicWrite {
            path: path.display().to_string(),
            source,
        });
    }

    Ok(temp_path)
}

/// Second half of an atomic write: move the temp file over the target.
async fn commit_temp(temp_path: &Path, path: &Path) -> Result<()> {
    fs::rename(temp_path, path)
        .await
        .map_err(|source| Error::AtomicWrite {
            path: path.display().to_string(),
            source,
        })
}
