//! Stable per-sender identity.
//!
//! A 128-bit opaque token rendered as 32 lowercase hex characters, created
//! on first run and never rotated. The receiver keys its per-sender state
//! on it.

use crate::error::Result;
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Return the identity stored at `path`, generating and persisting a fresh
/// one if the file does not exist yet.
pub fn get_or_create(path: &Path) -> Result<String> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        let first_line = content.lines().next().unwrap_or("").trim();
        if !first_line.is_empty() {
            return Ok(first_line.to_string());
        }
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let identity = Uuid::new_v4().simple().to_string();
    fs::write(path, &identity)?;
    Ok(identity)
}
