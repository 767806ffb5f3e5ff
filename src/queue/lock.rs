//! Cross-process exclusive lock on the queue database.
//!
//! A `QueueLock` holds an advisory `flock`-style lock on `<db>.lock` for as
//! long as it lives. Acquisition never waits: a lock held elsewhere is
//! reported as [`QueueError::Busy`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::error::QueueError;

/// Scoped exclusive lock. Released on [`QueueLock::release`] or drop.
#[derive(Debug)]
pub struct QueueLock {
    file: Option<File>,
    path: PathBuf,
}

impl QueueLock {
    /// Try to take the lock without blocking.
    pub fn acquire(path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(QueueError::Lock)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(QueueError::Lock)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "Queue lock acquired");
                Ok(Self {
                    file: Some(file),
                    path: path.to_path_buf(),
                })
            }
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(QueueError::Busy {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => Err(QueueError::Lock(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Safe to call more than once.
    pub fn release(&mut self) -> Result<(), QueueError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        file.unlock().map_err(QueueError::Lock)?;
        debug!(path = %self.path.display(), "Queue lock released");
        Ok(())
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path.display(), "Failed to release queue lock: {e}");
        }
    }
}
