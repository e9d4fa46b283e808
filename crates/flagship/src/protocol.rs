//! Cluster wire protocol.
//!
//! Every frame on a cluster connection is length-prefixed:
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| bincode(Frame)            |
//! +----------------+---------------------------+
//! ```
//!
//! Requests carry a per-connection id; the matching response echoes it.
//! Either side may issue requests over the same connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use convoy_common::ConvoyError;
use convoy_common::constants::{MAX_FRAME_SIZE, PROTOCOL_PLAIN_SIZE, commands};

/// A single message on a cluster connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Request {
        id: u64,
        command: String,
        payload: Vec<u8>,
    },
    Response {
        id: u64,
        status: ReplyStatus,
        payload: Vec<u8>,
    },
}

/// Commands known to the cluster protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Hello,
    Echo,
    RequestSync,
    UploadSync,
    SyncReply,
    ForceSync,
    FileStatus,
    Bye,
    /// Anything else, kept verbatim so the control channel can route it
    Unknown(String),
}

impl Command {
    pub fn parse(name: &str) -> Self {
        match name {
            commands::HELLO => Self::Hello,
            commands::ECHO => Self::Echo,
            commands::REQUEST_SYNC => Self::RequestSync,
            commands::UPLOAD_SYNC => Self::UploadSync,
            commands::SYNC_REPLY => Self::SyncReply,
            commands::FORCE_SYNC => Self::ForceSync,
            commands::FILE_STATUS => Self::FileStatus,
            commands::BYE => Self::Bye,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Hello => commands::HELLO,
            Self::Echo => commands::ECHO,
            Self::RequestSync => commands::REQUEST_SYNC,
            Self::UploadSync => commands::UPLOAD_SYNC,
            Self::SyncReply => commands::SYNC_REPLY,
            Self::ForceSync => commands::FORCE_SYNC,
            Self::FileStatus => commands::FILE_STATUS,
            Self::Bye => commands::BYE,
            Self::Unknown(name) => name,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Ack,
    Err,
}

/// Answer to a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn ok(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            payload: payload.into(),
        }
    }

    pub fn ack(message: &str) -> Self {
        Self {
            status: ReplyStatus::Ack,
            payload: message.as_bytes().to_vec(),
        }
    }

    pub fn err(message: impl fmt::Display) -> Self {
        Self {
            status: ReplyStatus::Err,
            payload: message.to_string().into_bytes(),
        }
    }

    /// The reply's text when it is a non-empty success, None otherwise
    pub fn processed(&self) -> Option<String> {
        if self.status == ReplyStatus::Err || self.payload.is_empty() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.payload).into_owned())
    }

    pub fn into_frame(self, id: u64) -> Frame {
        Frame::Response {
            id,
            status: self.status,
            payload: self.payload,
        }
    }
}

/// Payload of the force-sync sentinel, padded to the plain message width
pub fn force_sync_payload() -> Vec<u8> {
    let used = commands::FORCE_SYNC.len() + 1;
    vec![b'-'; PROTOCOL_PLAIN_SIZE.saturating_sub(used)]
}

/// Read one frame; Ok(None) on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ConvoyError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ConvoyError::Protocol(format!(
            "frame too large: {} bytes",
            len
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    bincode::deserialize(&buf)
        .map(Some)
        .map_err(|e| ConvoyError::Protocol(format!("invalid frame: {}", e)))
}

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ConvoyError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serialize(frame)
        .map_err(|e| ConvoyError::Protocol(format!("cannot encode frame: {}", e)))?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ConvoyError::Protocol(format!(
            "frame too large: {} bytes",
            bytes.len()
        )));
    }

    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
