//! Sender configuration, loaded from a TOML file.

use crate::error::{Result, SyncError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk names inside the sender state folder.
pub const LOCK_FILE: &str = "sender.lock";
pub const IDENTITY_FILE: &str = "identity";
pub const SCHEMA_CURSOR_FILE: &str = "schema_cursor";
pub const BASELINE_FILE: &str = "last_local_files.txt";
pub const JOURNAL_FILE: &str = "sync_progress.log";
pub const SNAPSHOT_DIR: &str = "snapshot";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Receiver host.
    pub host: String,
    /// Receiver port.
    pub port: u16,
    /// Host string reported to the receiver during the handshake.
    pub sender_host: String,
    /// State folder: lock, identity, schema cursor, baseline, journal and
    /// the snapshot directory all live here.
    pub sender_dir: PathBuf,
    /// Data directories scanned for new and deleted data files each cycle.
    pub data_dirs: Vec<PathBuf>,
    /// Append-only schema log shipped incrementally.
    pub schema_log: PathBuf,
    /// Period between cycles.
    pub sync_period_secs: u64,
    /// Period of the in-progress heartbeat log line.
    pub heartbeat_period_secs: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5555,
            sender_host: "127.0.0.1".to_string(),
            sender_dir: PathBuf::from("sync/sender"),
            data_dirs: vec![PathBuf::from("data")],
            schema_log: PathBuf::from("data/schema.log"),
            sync_period_secs: 600,
            heartbeat_period_secs: 10,
        }
    }
}

impl SenderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: SenderConfig = toml::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;

        config.sender_dir = expand_tilde(&config.sender_dir);
        config.schema_log = expand_tilde(&config.schema_log);
        config.data_dirs = config.data_dirs.iter().map(|d| expand_tilde(d)).collect();

        if config.data_dirs.is_empty() {
            return Err(SyncError::Config("data_dirs must not be empty".to_string()));
        }

        Ok(config)
    }

    pub fn receiver_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.sender_dir.join(LOCK_FILE)
    }

    pub fn identity_path(&self) -> PathBuf {
        self.sender_dir.join(IDENTITY_FILE)
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.sender_dir.join(SCHEMA_CURSOR_FILE)
    }

    pub fn baseline_path(&self) -> PathBuf {
        self.sender_dir.join(BASELINE_FILE)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.sender_dir.join(JOURNAL_FILE)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.sender_dir.join(SNAPSHOT_DIR)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }
}

/// Expand tilde (~) in paths to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}
