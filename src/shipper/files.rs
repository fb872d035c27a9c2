//! Data-file shipper.
//!
//! Per group, deletions go first, then additions. Every addition streams
//! its sidecar before the data file itself, reads from a hard-link
//! snapshot, and must pass the receiver's digest echo before it counts.

use super::{Snapshot, DATA_CHUNK_SIZE, MAX_SYNC_FILE_TRY};
use crate::client::SyncClient;
use crate::error::{Result, SyncError};
use crate::inventory::sidecar_path;
use crate::journal::Journal;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tracing::{debug, info, warn};

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Tell the receiver which of this group's files vanished locally.
///
/// A refused or failed deletion is skipped, not fatal: the path stays in
/// `last_local`, so the next cycle reports it again.
pub async fn ship_deletions<R, W>(
    client: &mut SyncClient<R, W>,
    journal: &mut Journal,
    group: &str,
    deleted: &BTreeSet<PathBuf>,
    last_local: &mut BTreeSet<PathBuf>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for path in deleted {
        let name = display_name(path);
        match client.sync_deleted(&name).await {
            Ok(status) if status.success => {
                last_local.remove(path);
                journal.deleted(path)?;
                debug!(group, file = %name, "Deletion acknowledged");
            }
            Ok(status) => {
                warn!(
                    group,
                    file = %name,
                    "Receiver refused deletion: {}",
                    status.error_msg
                );
            }
            Err(e) => {
                warn!(group, file = %name, "Failed to ship deletion: {e}");
            }
        }
    }
    Ok(())
}

/// Ship this group's new data files, sidecar first.
///
/// A failed snapshot skips the file and keeps the group going; transfer
/// errors abort the cycle. Snapshot links are removed on every exit path.
pub async fn ship_additions<R, W>(
    client: &mut SyncClient<R, W>,
    journal: &mut Journal,
    group: &str,
    to_send: &BTreeSet<PathBuf>,
    last_local: &mut BTreeSet<PathBuf>,
    snapshot_dir: &Path,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for original in to_send {
        let sidecar = sidecar_path(original);
        let sidecar_snapshot = match Snapshot::create(snapshot_dir, group, &sidecar) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(group, file = %original.display(), "Skipping file: {e}");
                continue;
            }
        };
        let data_snapshot = match Snapshot::create(snapshot_dir, group, original) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(group, file = %original.display(), "Skipping file: {e}");
                continue;
            }
        };

        sync_single_file(client, sidecar_snapshot.path()).await?;
        sync_single_file(client, data_snapshot.path()).await?;

        last_local.insert(original.clone());
        journal.sent(original)?;
        info!(group, file = %original.display(), "Data file shipped and verified");
    }
    Ok(())
}

/// Stream one snapshot in fixed-size chunks and pass the digest gate.
/// Any rejected chunk or digest mismatch restarts the file from byte zero
/// with a fresh digest, up to the per-file bound.
pub async fn sync_single_file<R, W>(client: &mut SyncClient<R, W>, snapshot: &Path) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let name = display_name(snapshot);

    for attempt in 1..=MAX_SYNC_FILE_TRY {
        client.init_sync_data(&name).await?;
        match stream_once(client, snapshot).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                warn!(attempt, file = %name, "Chunk refused, restarting from byte zero");
            }
            Err(e @ SyncError::DigestMismatch { .. }) => {
                warn!(attempt, "{e}, restarting from byte zero");
            }
            Err(e) => return Err(e),
        }
    }

    Err(SyncError::Connection(format!(
        "{name} failed verification after {MAX_SYNC_FILE_TRY} attempts"
    )))
}

/// One streaming attempt. `Ok(true)` when the receiver's digest echo
/// matched, `Ok(false)` when a chunk was refused mid-file.
async fn stream_once<R, W>(client: &mut SyncClient<R, W>, snapshot: &Path) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let file = File::open(snapshot).await?;
    let mut reader = BufReader::new(file);
    let mut digest = Md5::new();
    let mut buf = vec![0u8; DATA_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        let status = client.sync_data(Bytes::copy_from_slice(&buf[..n])).await?;
        if !status.success {
            warn!("Receiver refused chunk: {}", status.error_msg);
            return Ok(false);
        }
    }

    let local = hex::encode(digest.finalize());
    let status = client.check_digest(&local).await?;
    if status.success && status.msg == local {
        Ok(true)
    } else {
        Err(SyncError::DigestMismatch {
            file: display_name(snapshot),
            local,
            remote: status.msg,
        })
    }
}
