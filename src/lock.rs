//! Singleton guard.
//!
//! At most one sender process per host: a non-blocking exclusive lock over
//! the whole lock file, held for the process lifetime. A second sender
//! against the same state folder would split-brain the progress journal.

use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the sender lock, creating the file and its parent directory
    /// if needed. Fails with `AlreadyRunning` when another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Open without truncating: the file may carry the PID of a live
        // sender that still holds the lock.
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(SyncError::AlreadyRunning(path.to_path_buf()));
        }

        // Record our PID now that the lock is held.
        let mut file = file;
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
