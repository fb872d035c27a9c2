//! RPC client for the sync protocol.
//!
//! One client instance spans exactly one cycle. Generic over the stream
//! halves so tests can drive it over an in-memory duplex; `connect` builds
//! the TCP instance the daemon uses.

use crate::error::{Result, SyncError};
use crate::protocol::{
    read_frame, write_frame, Check, CheckDigest, EndSync, Init, InitSyncData, MessageType,
    StartSync, Status, SyncData, SyncDeleted,
};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

pub type TcpSyncClient = SyncClient<BufReader<OwnedReadHalf>, BufWriter<OwnedWriteHalf>>;

/// Any transport failure surfaces as `SyncError::Connection`, the single
/// error the orchestrator aborts a cycle on.
fn into_connection(err: SyncError) -> SyncError {
    match err {
        e @ SyncError::Connection(_) => e,
        e => SyncError::Connection(e.to_string()),
    }
}

pub struct SyncClient<R, W> {
    reader: R,
    writer: W,
}

impl SyncClient<BufReader<OwnedReadHalf>, BufWriter<OwnedWriteHalf>> {
    /// Connect to the receiver.
    pub async fn connect(addr: &str) -> Result<TcpSyncClient> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SyncError::Connection(format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (r, w) = stream.into_split();
        Ok(SyncClient::new(BufReader::new(r), BufWriter::new(w)))
    }
}

impl<R, W> SyncClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    async fn send(&mut self, frame: &Bytes) -> Result<()> {
        write_frame(&mut self.writer, frame)
            .await
            .map_err(into_connection)?;
        self.writer
            .flush()
            .await
            .map_err(|e| SyncError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn recv_status(&mut self) -> Result<Status> {
        let (msg_type, payload) = read_frame(&mut self.reader).await.map_err(into_connection)?;
        if msg_type != MessageType::Status {
            return Err(SyncError::Connection(format!(
                "expected Status, got {msg_type:?}"
            )));
        }
        Status::decode(payload).map_err(into_connection)
    }

    /// Handshake. The receiver may reject; the caller decides what a
    /// non-success status means.
    pub async fn check(&mut self, host: &str, identity: &str) -> Result<Status> {
        let msg = Check {
            host: host.to_string(),
            identity: identity.to_string(),
        };
        self.send(&msg.encode()).await?;
        self.recv_status().await
    }

    pub async fn start_sync(&mut self) -> Result<()> {
        self.send(&StartSync.encode()).await
    }

    /// Per-group preamble.
    pub async fn init(&mut self, group: &str) -> Result<Status> {
        let msg = Init {
            group: group.to_string(),
        };
        self.send(&msg.encode()).await?;
        self.recv_status().await
    }

    /// Announce the file the next `sync_data` chunks belong to.
    pub async fn init_sync_data(&mut self, filename: &str) -> Result<()> {
        let msg = InitSyncData {
            filename: filename.to_string(),
        };
        self.send(&msg.encode()).await
    }

    /// Ship one chunk of the current file.
    pub async fn sync_data(&mut self, data: Bytes) -> Result<Status> {
        let msg = SyncData { data };
        self.send(&msg.encode()).await?;
        self.recv_status().await
    }

    /// End-of-file digest gate. `Status::msg` echoes the receiver's digest.
    pub async fn check_digest(&mut self, digest: &str) -> Result<Status> {
        let msg = CheckDigest {
            digest: digest.to_string(),
        };
        self.send(&msg.encode()).await?;
        self.recv_status().await
    }

    pub async fn sync_deleted(&mut self, filename: &str) -> Result<Status> {
        let msg = SyncDeleted {
            filename: filename.to_string(),
        };
        self.send(&msg.encode()).await?;
        self.recv_status().await
    }

    pub async fn end_sync(&mut self) -> Result<()> {
        self.send(&EndSync.encode()).await
    }
}
