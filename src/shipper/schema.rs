//! Schema-log shipper.
//!
//! The schema log is append-only and strictly monotonic in length, so only
//! the suffix past the persisted cursor is ever shipped. The cursor counts
//! lines already committed and advances only after the receiver has
//! digest-verified the shipped suffix.

use super::{BATCH_LINE, MAX_SYNC_FILE_TRY};
use crate::client::SyncClient;
use crate::error::{Result, SyncError};
use bytes::Bytes;
use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

/// Lines already committed, as persisted in the cursor file. Absent means 0.
pub fn load_cursor(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let content = fs::read_to_string(path)?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<u64>()
        .map_err(|_| SyncError::Config(format!("corrupt schema cursor: {trimmed:?}")))
}

pub fn store_cursor(path: &Path, lines: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, lines.to_string())?;
    Ok(())
}

/// Ship every schema-log line past the cursor and persist the new cursor
/// once the receiver's digest echo matches. Verification failures restart
/// the whole suffix, up to the per-file bound.
pub async fn ship_schema_log<R, W>(
    client: &mut SyncClient<R, W>,
    schema_log: &Path,
    cursor_path: &Path,
    schema_file_name: &str,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for attempt in 1..=MAX_SYNC_FILE_TRY {
        let cursor = load_cursor(cursor_path)?;
        match ship_once(client, schema_log, cursor, schema_file_name).await {
            Ok(Some(total)) => {
                // A cursor that fails to persist re-derives next cycle
                // from receiver behavior; the data itself is committed.
                if let Err(e) = store_cursor(cursor_path, total) {
                    warn!("Failed to persist schema cursor {total}: {e}");
                }
                info!(
                    lines = total - cursor,
                    total, "Schema log suffix shipped and verified"
                );
                return Ok(total);
            }
            Ok(None) => {
                warn!(attempt, "Schema batch refused, retrying from the cursor");
            }
            Err(e @ SyncError::DigestMismatch { .. }) => {
                warn!(attempt, "{e}, retrying from the cursor");
            }
            Err(e) => return Err(e),
        }
    }

    Err(SyncError::Connection(format!(
        "schema log failed verification after {MAX_SYNC_FILE_TRY} attempts"
    )))
}

/// One shipment attempt. `Ok(Some(total_lines))` when the digest gate
/// passed, `Ok(None)` when a batch was refused mid-stream.
async fn ship_once<R, W>(
    client: &mut SyncClient<R, W>,
    schema_log: &Path,
    cursor: u64,
    schema_file_name: &str,
) -> Result<Option<u64>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    client.init_sync_data(schema_file_name).await?;

    let mut digest = Md5::new();
    let mut buffer: Vec<u8> = Vec::new();
    let mut buffered_lines = 0usize;
    let mut shipped = 0u64;

    // An absent schema log is an empty one; the receiver still gets the
    // digest gate so both ends agree on "nothing new".
    if schema_log.exists() {
        let reader = BufReader::new(File::open(schema_log)?);
        for line in reader.lines().skip(cursor as usize) {
            let line = line?;
            buffer.extend_from_slice(line.as_bytes());
            buffer.push(b'\n');
            buffered_lines += 1;
            shipped += 1;

            if buffered_lines == BATCH_LINE {
                digest.update(&buffer);
                let status = client.sync_data(Bytes::from(std::mem::take(&mut buffer))).await?;
                buffered_lines = 0;
                if !status.success {
                    warn!("Receiver refused schema batch: {}", status.error_msg);
                    return Ok(None);
                }
            }
        }
    }

    if !buffer.is_empty() {
        digest.update(&buffer);
        let status = client.sync_data(Bytes::from(buffer)).await?;
        if !status.success {
            warn!("Receiver refused schema batch: {}", status.error_msg);
            return Ok(None);
        }
    }

    let local = hex::encode(digest.finalize());
    let status = client.check_digest(&local).await?;
    if status.success && status.msg == local {
        Ok(Some(cursor + shipped))
    } else {
        Err(SyncError::DigestMismatch {
            file: schema_file_name.to_string(),
            local,
            remote: status.msg,
        })
    }
}
