//! Baseline file: the complete set of data files the receiver acknowledged
//! as of the last successful cycle, one absolute path per line.
//!
//! The baseline is the reference against which the next cycle computes its
//! delta. It is only ever replaced atomically.

use crate::error::Result;
use std::collections::BTreeSet;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Load the baseline. An absent file means an empty baseline.
pub fn load(path: &Path) -> Result<BTreeSet<PathBuf>> {
    if !path.exists() {
        return Ok(BTreeSet::new());
    }

    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut paths = BTreeSet::new();

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        paths.insert(PathBuf::from(line));
    }

    Ok(paths)
}

/// Atomically replace the baseline with `paths`: write the staged `.cur`
/// sibling, fsync, then rename over the old file. Any observer sees either
/// the pre-cycle or the post-cycle content, never a partial write.
pub fn promote(path: &Path, paths: &BTreeSet<PathBuf>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "baseline".to_string());
    let staged = path.with_file_name(format!("{file_name}.cur"));

    {
        let mut file = fs::File::create(&staged)?;
        for p in paths {
            writeln!(file, "{}", p.display())?;
        }
        file.sync_all()?;
    }

    fs::rename(&staged, path)?;
    Ok(())
}
