//! Transfer engine: schema-log and data-file shipment.

pub mod files;
pub mod schema;

use crate::error::{Result, SyncError};
use std::fs;
use std::path::{Path, PathBuf};

/// Bytes per `sync_data` chunk when streaming a file.
pub const DATA_CHUNK_SIZE: usize = 256 * 1024;

/// Schema-log lines accumulated per `sync_data` flush.
pub const BATCH_LINE: usize = 1000;

/// Attempts per file (or schema suffix) before the cycle is aborted.
pub const MAX_SYNC_FILE_TRY: usize = 5;

/// Hard-link snapshot of one file, taken so the transfer reads a stable
/// inode while the storage engine keeps compacting. Removed on drop, so no
/// link outlives the transfer it covers.
#[derive(Debug)]
pub struct Snapshot {
    path: PathBuf,
}

impl Snapshot {
    /// Link `original` into `snapshot_dir/<group>/`. Both ends must sit on
    /// the same filesystem.
    pub fn create(snapshot_dir: &Path, group: &str, original: &Path) -> Result<Self> {
        let snapshot_failed = |reason: String| SyncError::Snapshot {
            path: original.to_path_buf(),
            reason,
        };

        let name = original
            .file_name()
            .ok_or_else(|| snapshot_failed("no file name".to_string()))?;
        let group_dir = snapshot_dir.join(group);
        fs::create_dir_all(&group_dir).map_err(|e| snapshot_failed(e.to_string()))?;

        let path = group_dir.join(name);
        // A leftover link from an interrupted attempt would make hard_link fail.
        if path.exists() {
            fs::remove_file(&path).map_err(|e| snapshot_failed(e.to_string()))?;
        }
        fs::hard_link(original, &path).map_err(|e| snapshot_failed(e.to_string()))?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
