// LibriSync - Audible Library Sync for Mobile
// Copyright (C) 2025 Henning Berge
//
// This program is a Rust port of Libation (https://github.com/rmcrackan/Libation)
// Original work Copyright (C) Libation contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Work directories and moving finished files into place
//!
//! Every intermediate artifact of one run lives in a [`WorkDir`]. Final
//! files are staged there and only moved to their destinations by
//! [`FileManager::commit`], which either places all of them or none.

use crate::error::{LibationError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of per-run work directory names
const WORK_DIR_PREFIX: &str = ".liberation-";

#[derive(Debug, Clone, Default)]
pub struct FileManager {
    temp_root: Option<PathBuf>,
}

impl FileManager {
    /// # Arguments
    /// * `temp_root` - Parent for work directories. `None` places them
    ///   beside the output so commits are plain renames.
    pub fn new(temp_root: Option<PathBuf>) -> Self {
        Self { temp_root }
    }

    /// Create a fresh work directory for one run
    pub async fn create_work_dir(&self, output_dir: &Path) -> Result<WorkDir> {
        let root = self.temp_root.as_deref().unwrap_or(output_dir);
        tokio::fs::create_dir_all(root).await?;

        let path = root.join(format!("{}{}", WORK_DIR_PREFIX, Uuid::new_v4()));
        tokio::fs::create_dir(&path).await?;
        debug!(path = %path.display(), "Created work directory");

        Ok(WorkDir {
            path,
            removed: false,
        })
    }

    /// Move staged files to their destinations
    ///
    /// Destinations that already exist are replaced. An existing file is
    /// first renamed to a hidden sibling, so if any move fails the files
    /// placed by this call are removed and the previous files restored
    /// before the error is returned.
    ///
    /// # Arguments
    /// * `staged` - `(source, destination)` pairs
    ///
    /// # Returns
    /// Destination paths in the order given
    pub async fn commit(&self, staged: &[(PathBuf, PathBuf)]) -> Result<Vec<PathBuf>> {
        let mut placed = Vec::with_capacity(staged.len());
        let mut replaced: Vec<(PathBuf, PathBuf)> = Vec::new();

        for (source, dest) in staged {
            if let Err(e) = place(source, dest, &mut placed, &mut replaced).await {
                warn!(dest = %dest.display(), error = %e, "Commit failed, rolling back");
                for path in &placed {
                    let _ = tokio::fs::remove_file(path).await;
                }
                for (backup, original) in &replaced {
                    if let Err(e) = tokio::fs::rename(backup, original).await {
                        warn!(path = %original.display(), error = %e, "Failed to restore replaced file");
                    }
                }
                return Err(e);
            }
        }

        for (backup, _) in &replaced {
            let _ = tokio::fs::remove_file(backup).await;
        }
        Ok(placed)
    }
}

/// Move one staged file, setting aside whatever `dest` held before
async fn place(
    source: &Path,
    dest: &Path,
    placed: &mut Vec<PathBuf>,
    replaced: &mut Vec<(PathBuf, PathBuf)>,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(dest).await? {
        let backup = hidden_sibling(dest, "bak")?;
        tokio::fs::rename(dest, &backup).await?;
        replaced.push((backup, dest.to_path_buf()));
    }
    move_file(source, dest).await?;
    placed.push(dest.to_path_buf());
    Ok(())
}

/// `.<name>.<uuid>.<suffix>` next to `path`
fn hidden_sibling(path: &Path, suffix: &str) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| LibationError::InvalidInput(format!("Not a file path: {}", path.display())))?;
    Ok(path.with_file_name(format!(
        ".{}.{}.{}",
        file_name.to_string_lossy(),
        Uuid::new_v4().simple(),
        suffix
    )))
}

/// Rename, falling back to copy when source and destination are on
/// different filesystems
///
/// The copy goes to a hidden sibling first so `dest` never holds a partial
/// file.
async fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }

    let staging = hidden_sibling(dest, "tmp")?;

    if let Err(e) = tokio::fs::copy(source, &staging).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&staging, dest).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    let _ = tokio::fs::remove_file(source).await;
    Ok(())
}

/// Per-run scratch directory, removed on drop
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    removed: bool,
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory and everything in it
    pub async fn remove(mut self) -> Result<()> {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if !self.removed {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Failed to remove work directory");
                }
            }
        }
    }
}
