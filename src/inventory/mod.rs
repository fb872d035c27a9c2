//! Per-directory inventory: which data files appeared or vanished since
//! the last successful cycle.
//!
//! Storage groups are the first-level subdirectories of a data directory;
//! data files are the immutable `.ts` files inside them, each with a
//! `.resource` sidecar shipped right before it.

use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of immutable data files emitted by the storage engine.
pub const DATA_FILE_EXT: &str = "ts";
/// Suffix appended to a data file's path to name its sidecar.
pub const SIDECAR_SUFFIX: &str = ".resource";

pub type GroupFiles = BTreeMap<String, BTreeSet<PathBuf>>;

/// One data directory's view of the delta against the baseline.
///
/// `last_local` starts as the previous baseline and is mutated as ships
/// succeed; at finalize it becomes the next baseline.
#[derive(Debug, Default)]
pub struct Inventory {
    pub all_groups: BTreeSet<String>,
    pub to_send: GroupFiles,
    pub deleted: GroupFiles,
    pub last_local: GroupFiles,
}

/// Path of the sidecar belonging to `data_file`.
pub fn sidecar_path(data_file: &Path) -> PathBuf {
    let mut s = data_file.as_os_str().to_os_string();
    s.push(SIDECAR_SUFFIX);
    PathBuf::from(s)
}

/// Scan one data directory and diff it against the baseline.
///
/// Only baseline entries under `dir` count toward this directory's view;
/// the orchestrator carries entries belonging to other directories through
/// to promotion untouched.
pub fn scan_data_dir(dir: &Path, baseline: &BTreeSet<PathBuf>) -> Result<Inventory> {
    let mut inv = Inventory::default();

    for path in baseline {
        if !path.starts_with(dir) {
            continue;
        }
        let Some(group) = group_of(dir, path) else {
            continue;
        };
        inv.all_groups.insert(group.clone());
        inv.last_local.entry(group).or_default().insert(path.clone());
    }

    let mut present: GroupFiles = BTreeMap::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let group = entry.file_name().to_string_lossy().to_string();
            let mut files = BTreeSet::new();
            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let path = file.path();
                if file.file_type()?.is_file()
                    && path.extension() == Some(OsStr::new(DATA_FILE_EXT))
                {
                    files.insert(path);
                }
            }
            inv.all_groups.insert(group.clone());
            present.insert(group, files);
        }
    }

    for (group, files) in &present {
        let last = inv.last_local.get(group);
        let fresh: BTreeSet<PathBuf> = match last {
            Some(last) => files.difference(last).cloned().collect(),
            None => files.clone(),
        };
        if !fresh.is_empty() {
            inv.to_send.insert(group.clone(), fresh);
        }
    }

    for (group, last) in &inv.last_local {
        let gone: BTreeSet<PathBuf> = match present.get(group) {
            Some(files) => last.difference(files).cloned().collect(),
            None => last.clone(),
        };
        if !gone.is_empty() {
            inv.deleted.insert(group.clone(), gone);
        }
    }

    Ok(inv)
}

/// Group name of a baseline entry, provided it sits at `dir/<group>/<file>`.
fn group_of(dir: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(dir).ok()?;
    let mut components = rel.components();
    let group = components.next()?;
    components.next()?;
    if components.next().is_some() {
        return None;
    }
    Some(group.as_os_str().to_string_lossy().to_string())
}
