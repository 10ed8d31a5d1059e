//! Per-project advisory lock serialising writes to profile, slot and image state.

use crate::error::BerthError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive advisory lock on a project's data root, held until dropped.
///
/// Every mutation of persisted project state (profile selection, slot
/// directories, the image tag) happens while one of these is alive.
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

impl ProjectLock {
    pub fn acquire(path: &Path) -> Result<Self, BerthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if file.try_lock_exclusive().is_err() {
            eprintln!("waiting for another berth command on this project to finish...");
            file.lock_exclusive().map_err(|err| {
                BerthError::Process(format!("failed to lock {}: {err}", path.display()))
            })?;
        }
        debug!(path = %path.display(), "project lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Returns `None` when another process holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, BerthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "project lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("root").join(".lock");
        let held = ProjectLock::acquire(&path).unwrap();
        assert!(ProjectLock::try_acquire(&path).unwrap().is_none());
        drop(held);
        assert!(ProjectLock::try_acquire(&path).unwrap().is_some());
    }

    #[test]
    fn release_happens_on_early_return() {
        fn failing(path: &Path) -> Result<(), BerthError> {
            let _lock = ProjectLock::acquire(path)?;
            Err(BerthError::Process("boom".to_string()))
        }
        let dir = tempdir().unwrap();
        let path = dir.path().join(".lock");
        assert!(failing(&path).is_err());
        assert!(ProjectLock::try_acquire(&path).unwrap().is_some());
    }
}
