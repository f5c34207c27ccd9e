//! Advisory file locking
//!
//! Thin wrapper over `fs2` exclusive locks. The lock is advisory: it only
//! coordinates processes that also take the lock, which is every writer in
//! this workspace. Dropping the guard releases the lock.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::error::StateError;

/// An exclusive advisory lock on a file, released on drop
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the lock is acquired
    pub fn acquire(path: &Path) -> Result<Self, StateError> {
        let file = Self::open(path)?;
        file.lock_exclusive().map_err(|e| StateError::io(path, e))?;
        debug!(path = %path.display(), "lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Try to acquire without blocking; `LockHeld` if another process has it
    pub fn try_acquire(path: &Path) -> Result<Self, StateError> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(_) => Err(StateError::LockHeld {
                path: path.to_path_buf(),
            }),
        }
    }

    fn open(path: &Path) -> Result<File, StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| StateError::io(path, e))
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "unlock failed");
        }
    }
}
