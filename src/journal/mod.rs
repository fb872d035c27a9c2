//! Progress journal: append-only log of sync milestones.
//!
//! Each record is flushed before the corresponding action is treated as
//! durable, so a record present after a crash is trustworthy. The journal's
//! mere existence at startup means the prior run did not finish; deleting
//! it is the commit point of a cycle.

use crate::baseline;
use crate::error::Result;
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

const BEGIN_DELETIONS: &str = "BEGIN_DELETIONS";
const BEGIN_TSFILES: &str = "BEGIN_TSFILES";
const DELETED: &str = "DELETED";
const SENT: &str = "SENT";

pub struct Journal {
    file: File,
}

impl Journal {
    /// Open for append, creating the file if absent.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn begin_deletions(&mut self) -> Result<()> {
        self.record(BEGIN_DELETIONS)
    }

    pub fn begin_data_files(&mut self) -> Result<()> {
        self.record(BEGIN_TSFILES)
    }

    /// The receiver acknowledged this deletion.
    pub fn deleted(&mut self, path: &Path) -> Result<()> {
        self.record(&format!("{DELETED} {}", path.display()))
    }

    /// The receiver confirmed integrity of this shipped file.
    pub fn sent(&mut self, path: &Path) -> Result<()> {
        self.record(&format!("{SENT} {}", path.display()))
    }

    fn record(&mut self, line: &str) -> Result<()> {
        writeln!(self.file, "{line}")?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// What an interrupted run had already gotten acknowledged, reconstructed
/// by replaying its journal.
#[derive(Debug, Default)]
pub struct Recovery {
    pub deleted: Vec<PathBuf>,
    pub sent: Vec<PathBuf>,
}

impl Recovery {
    /// Replay the journal at `path`. Returns `None` when no journal exists
    /// (the prior run finished cleanly). A final record without its line
    /// terminator may have been cut short by the crash and is discarded.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)?;
        let complete = match content.rfind('\n') {
            Some(idx) => &content[..idx],
            None => "",
        };

        let mut recovery = Recovery::default();
        for line in complete.lines() {
            if let Some(rest) = line.strip_prefix(DELETED) {
                recovery.deleted.push(PathBuf::from(rest.trim_start()));
            } else if let Some(rest) = line.strip_prefix(SENT) {
                recovery.sent.push(PathBuf::from(rest.trim_start()));
            }
            // BEGIN_* markers carry no state on replay.
        }

        Ok(Some(recovery))
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty() && self.sent.is_empty()
    }
}

/// Reconcile an interrupted run before a new cycle starts: fold the
/// acknowledged deletions and shipments into the baseline, then discard the
/// journal and any leftover snapshots. Work the receiver confirmed is never
/// redone; everything else is simply re-derived by the next scan.
///
/// Returns `true` when a journal was found and reconciled.
pub fn reconcile(journal_path: &Path, baseline_path: &Path, snapshot_dir: &Path) -> Result<bool> {
    let Some(recovery) = Recovery::load(journal_path)? else {
        return Ok(false);
    };

    info!(
        deleted = recovery.deleted.len(),
        sent = recovery.sent.len(),
        "Found journal from an interrupted run, reconciling"
    );

    if !recovery.is_empty() {
        let mut acknowledged: BTreeSet<PathBuf> = baseline::load(baseline_path)?;
        for path in &recovery.deleted {
            acknowledged.remove(path);
        }
        for path in &recovery.sent {
            acknowledged.insert(path.clone());
        }
        baseline::promote(baseline_path, &acknowledged)?;
    }

    fs::remove_file(journal_path)?;
    if snapshot_dir.exists() {
        fs::remove_dir_all(snapshot_dir)?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_replay() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("sync_progress.log");

        let mut journal = Journal::open(&path).unwrap();
        journal.begin_deletions().unwrap();
        journal.deleted(Path::new("/data/g1/old.ts")).unwrap();
        journal.begin_data_files().unwrap();
        journal.sent(Path::new("/data/g1/new.ts")).unwrap();
        drop(journal);

        let recovery = Recovery::load(&path).unwrap().unwrap();
        assert_eq!(recovery.deleted, vec![PathBuf::from("/data/g1/old.ts")]);
        assert_eq!(recovery.sent, vec![PathBuf::from("/data/g1/new.ts")]);
    }

    #[test]
    fn test_no_journal_means_clean_shutdown() {
        let temp = tempfile::tempdir().unwrap();
        assert!(Recovery::load(&temp.path().join("sync_progress.log"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_truncated_last_record_discarded() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("sync_progress.log");
        fs::write(
            &path,
            "BEGIN_TSFILES\nSENT /data/g1/a.ts\nSENT /data/g1/b.t",
        )
        .unwrap();

        let recovery = Recovery::load(&path).unwrap().unwrap();
        assert_eq!(recovery.sent, vec![PathBuf::from("/data/g1/a.ts")]);
    }

    #[test]
    fn test_reconcile_folds_into_baseline() {
        let temp = tempfile::tempdir().unwrap();
        let journal_path = temp.path().join("sync_progress.log");
        let baseline_path = temp.path().join("last_local_files.txt");
        let snapshot_dir = temp.path().join("snapshot");
        fs::create_dir(&snapshot_dir).unwrap();

        let mut before = BTreeSet::new();
        before.insert(PathBuf::from("/data/g1/old.ts"));
        before.insert(PathBuf::from("/data/g1/kept.ts"));
        baseline::promote(&baseline_path, &before).unwrap();

        let mut journal = Journal::open(&journal_path).unwrap();
        journal.begin_deletions().unwrap();
        journal.deleted(Path::new("/data/g1/old.ts")).unwrap();
        journal.begin_data_files().unwrap();
        journal.sent(Path::new("/data/g1/new.ts")).unwrap();
        drop(journal);

        assert!(reconcile(&journal_path, &baseline_path, &snapshot_dir).unwrap());

        let after = baseline::load(&baseline_path).unwrap();
        assert!(!after.contains(Path::new("/data/g1/old.ts")));
        assert!(after.contains(Path::new("/data/g1/kept.ts")));
        assert!(after.contains(Path::new("/data/g1/new.ts")));

        assert!(!journal_path.exists());
        assert!(!snapshot_dir.exists());
    }

    #[test]
    fn test_reconcile_without_journal_is_noop() {
        let temp = tempfile::tempdir().unwrap();
        let journal_path = temp.path().join("sync_progress.log");
        let baseline_path = temp.path().join("last_local_files.txt");
        let snapshot_dir = temp.path().join("snapshot");

        assert!(!reconcile(&journal_path, &baseline_path, &snapshot_dir).unwrap());
        assert!(!baseline_path.exists());
    }
}
