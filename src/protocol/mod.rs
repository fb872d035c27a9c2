//! Wire messages for the sender/receiver sync protocol.
//!
//! One logical connection spans one sync cycle. The sender drives; the
//! receiver only ever answers with `Status`.

use crate::error::{Result, SyncError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire format: all multi-byte integers are big-endian.
/// Strings are length-prefixed (u16 len + UTF-8).
/// Frame format: len:u32 | type:u8 | payload

// =============================================================================
// Message Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Check = 0x01,
    StartSync = 0x02,
    Init = 0x03,
    InitSyncData = 0x04,
    SyncData = 0x05,
    CheckDigest = 0x06,
    SyncDeleted = 0x07,
    EndSync = 0x08,
    Status = 0x10,
}

impl MessageType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Check),
            0x02 => Some(Self::StartSync),
            0x03 => Some(Self::Init),
            0x04 => Some(Self::InitSyncData),
            0x05 => Some(Self::SyncData),
            0x06 => Some(Self::CheckDigest),
            0x07 => Some(Self::SyncDeleted),
            0x08 => Some(Self::EndSync),
            0x10 => Some(Self::Status),
            _ => None,
        }
    }
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 2 {
        return Err(SyncError::Protocol(format!("{what} length truncated")));
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        return Err(SyncError::Protocol(format!(
            "{what} truncated: expected {len} bytes, got {}",
            payload.remaining()
        )));
    }
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| SyncError::Protocol(format!("Invalid UTF-8 in {what}")))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn frame(msg_type: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf
}

// =============================================================================
// CHECK (0x01)
// =============================================================================

/// Handshake: identifies the sender host and its stable identity token.
/// The receiver may reject (answered with `Status`).
#[derive(Debug, Clone)]
pub struct Check {
    pub host: String,
    pub identity: String,
}

impl Check {
    pub fn encode(&self) -> Bytes {
        let payload_len = 2 + self.host.len() + 2 + self.identity.len();
        let mut buf = frame(MessageType::Check, payload_len);
        put_string(&mut buf, &self.host);
        put_string(&mut buf, &self.identity);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let host = get_string(&mut payload, "Check host")?;
        let identity = get_string(&mut payload, "Check identity")?;
        Ok(Self { host, identity })
    }
}

// =============================================================================
// START_SYNC (0x02) / END_SYNC (0x08)
// =============================================================================

/// Cycle delimiters. Empty payload, no reply expected.
#[derive(Debug, Clone, Copy)]
pub struct StartSync;

impl StartSync {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::StartSync, 0).freeze()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EndSync;

impl EndSync {
    pub fn encode(&self) -> Bytes {
        frame(MessageType::EndSync, 0).freeze()
    }
}

// =============================================================================
// INIT (0x03)
// =============================================================================

/// Per-group preamble (answered with `Status`).
#[derive(Debug, Clone)]
pub struct Init {
    pub group: String,
}

impl Init {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::Init, 2 + self.group.len());
        put_string(&mut buf, &self.group);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let group = get_string(&mut payload, "Init group")?;
        Ok(Self { group })
    }
}

// =============================================================================
// INIT_SYNC_DATA (0x04)
// =============================================================================

/// Announces the file the following `SyncData` chunks belong to. No reply.
#[derive(Debug, Clone)]
pub struct InitSyncData {
    pub filename: String,
}

impl InitSyncData {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::InitSyncData, 2 + self.filename.len());
        put_string(&mut buf, &self.filename);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let filename = get_string(&mut payload, "InitSyncData filename")?;
        Ok(Self { filename })
    }
}

// =============================================================================
// SYNC_DATA (0x05)
// =============================================================================

/// One chunk of the current file, appended in order (answered with `Status`).
#[derive(Debug, Clone)]
pub struct SyncData {
    pub data: Bytes,
}

impl SyncData {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::SyncData, 4 + self.data.len());
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(SyncError::Protocol("SyncData payload too short".into()));
        }
        let len = payload.get_u32() as usize;
        if payload.remaining() < len {
            return Err(SyncError::Protocol("SyncData content truncated".into()));
        }
        Ok(Self {
            data: payload.copy_to_bytes(len),
        })
    }
}

// =============================================================================
// CHECK_DIGEST (0x06)
// =============================================================================

/// End-of-file integrity gate. The receiver echoes its own digest in
/// `Status::msg`; the transfer passes iff `success` and the digests match.
#[derive(Debug, Clone)]
pub struct CheckDigest {
    pub digest: String,
}

impl CheckDigest {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::CheckDigest, 2 + self.digest.len());
        put_string(&mut buf, &self.digest);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let digest = get_string(&mut payload, "CheckDigest digest")?;
        Ok(Self { digest })
    }
}

// =============================================================================
// SYNC_DELETED (0x07)
// =============================================================================

/// Tells the receiver a file vanished locally (answered with `Status`).
#[derive(Debug, Clone)]
pub struct SyncDeleted {
    pub filename: String,
}

impl SyncDeleted {
    pub fn encode(&self) -> Bytes {
        let mut buf = frame(MessageType::SyncDeleted, 2 + self.filename.len());
        put_string(&mut buf, &self.filename);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let filename = get_string(&mut payload, "SyncDeleted filename")?;
        Ok(Self { filename })
    }
}

// =============================================================================
// STATUS (0x10)
// =============================================================================

/// The receiver's only message shape.
#[derive(Debug, Clone)]
pub struct Status {
    pub success: bool,
    pub error_msg: String,
    pub msg: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_msg: String::new(),
            msg: String::new(),
        }
    }

    pub fn ok_with_msg(msg: impl Into<String>) -> Self {
        Self {
            success: true,
            error_msg: String::new(),
            msg: msg.into(),
        }
    }

    pub fn fail(error_msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error_msg: error_msg.into(),
            msg: String::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload_len = 1 + 2 + self.error_msg.len() + 2 + self.msg.len();
        let mut buf = frame(MessageType::Status, payload_len);
        buf.put_u8(self.success as u8);
        put_string(&mut buf, &self.error_msg);
        put_string(&mut buf, &self.msg);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 1 {
            return Err(SyncError::Protocol("Status payload too short".into()));
        }
        let success = payload.get_u8() != 0;
        let error_msg = get_string(&mut payload, "Status error_msg")?;
        let msg = get_string(&mut payload, "Status msg")?;
        Ok(Self {
            success,
            error_msg,
            msg,
        })
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Maximum frame size (64MB) - prevents OOM from corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Read a single frame from the stream.
/// Returns (message_type, payload).
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(MessageType, Bytes)> {
    let len = r.read_u32().await?;

    if len > MAX_FRAME_SIZE {
        return Err(SyncError::Protocol(format!(
            "Frame size {len} exceeds maximum allowed size {MAX_FRAME_SIZE}"
        )));
    }

    let msg_type = r.read_u8().await?;
    let msg_type = MessageType::from_u8(msg_type)
        .ok_or_else(|| SyncError::Protocol(format!("Unknown message type {msg_type:#04x}")))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;

    Ok((msg_type, Bytes::from(payload)))
}

/// Write a pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Bytes) -> Result<()> {
    w.write_all(frame).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
