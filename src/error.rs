//! Error types for the sender.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure on the sync connection. Aborts the cycle;
    /// baseline and schema cursor stay untouched so the next run resumes.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Receiver rejected sender: {0}")]
    Rejected(String),

    #[error("Digest mismatch for {file}: sent {local}, receiver computed {remote}")]
    DigestMismatch {
        file: String,
        local: String,
        remote: String,
    },

    #[error("Snapshot failed for {path}: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("Another sender already holds the lock at {0}")]
    AlreadyRunning(PathBuf),
}
