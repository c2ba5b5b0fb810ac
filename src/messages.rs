//! # Wire Protocol Messages
//!
//! This module defines every frame exchanged on bruno's streams and the
//! framing used to carry them. Frames are serialized with bincode under a
//! size limit and prefixed with a big-endian `u32` length.
//!
//! ## Protocol Types
//!
//! | Stream | Peer → Server | Server → Peer |
//! |--------|---------------|---------------|
//! | Frontend | [`ClientFrame`] | [`ServerFrame`] |
//! | Broadcast | [`SubscriberFrame`] | [`PublisherFrame`] |
//!
//! Request and reply payloads are opaque to the broker. The reference
//! workload encodes them as JSON: [`LocateRequest`] in, [`WorkerReply`] out.
//!
//! ## Security Limits
//!
//! - `MAX_FRAME_SIZE`: largest encoded frame accepted on any stream (1 MiB)
//! - The length prefix is checked before the body is allocated

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BrokerError;
use crate::identity::SessionId;

/// Version carried in `Hello` and `Subscribe`.
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum size of one encoded frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Room left for frame headers when bounding an application payload.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - 1024;

/// Maximum topic length on the broadcast channel.
pub const MAX_TOPIC_LENGTH: usize = 256;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

pub fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, BrokerError> {
    bincode_options()
        .serialize(frame)
        .map_err(|e| BrokerError::MalformedFrame(format!("encode: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BrokerError> {
    bincode_options()
        .deserialize(bytes)
        .map_err(|e| BrokerError::MalformedFrame(format!("decode: {e}")))
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), BrokerError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(BrokerError::MalformedFrame(format!(
            "frame too large: {} bytes (max {})",
            bytes.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer finished the stream cleanly
/// between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, BrokerError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(BrokerError::MalformedFrame(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            BrokerError::MalformedFrame("truncated frame".into())
        } else {
            BrokerError::Io(e)
        }
    })?;

    decode(&body).map(Some)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    Hello { version: u16, session: SessionId },
    Request { seq: u64, payload: Vec<u8> },
    Goodbye,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    SessionInUse,
    InvalidSession,
    UnsupportedVersion,
    InvalidPrefix,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Welcome { session: SessionId },
    Rejected { reason: RejectReason },
    Reply { session: SessionId, seq: u64, payload: Vec<u8> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriberFrame {
    Subscribe { version: u16, prefix: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublisherFrame {
    Subscribed,
    Rejected { reason: RejectReason },
    Message(BroadcastMessage),
}

/// One signed broadcast update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub topic: String,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl BroadcastMessage {
    /// Bytes covered by the publisher signature.
    ///
    /// The topic is length-prefixed so that topic/data boundaries cannot be
    /// shifted without invalidating the signature.
    pub fn signed_bytes(topic: &str, seqno: u64, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + topic.len() + 8 + data.len());
        out.extend_from_slice(&(topic.len() as u32).to_be_bytes());
        out.extend_from_slice(topic.as_bytes());
        out.extend_from_slice(&seqno.to_be_bytes());
        out.extend_from_slice(data);
        out
    }
}

pub fn is_valid_topic(topic: &str) -> bool {
    topic.len() <= MAX_TOPIC_LENGTH && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

/// A request or reply inside the broker.
///
/// `session`, `binding` and `seq` are routing data copied from ingress to
/// egress unchanged; only `payload` is replaced by the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub session: SessionId,
    /// Connection the session was bound to when the request arrived.
    pub binding: u64,
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn with_payload(&self, payload: Vec<u8>) -> Envelope {
        Envelope {
            session: self.session.clone(),
            binding: self.binding,
            seq: self.seq,
            payload,
        }
    }
}

/// Reference request: `{"req#": <u64>, "id": <string>}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateRequest {
    #[serde(rename = "req#")]
    pub req: u64,
    pub id: String,
}

impl LocateRequest {
    pub fn parse(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::MalformedFrame(e.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Reference reply. Worker failures are replies too, never dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    Served {
        worker: usize,
        req: u64,
        session: String,
    },
    Error {
        worker: Option<usize>,
        error: String,
    },
}

impl WorkerReply {
    pub fn error(worker: Option<usize>, error: impl Into<String>) -> Self {
        WorkerReply::Error {
            worker,
            error: error.into(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(bytes).map_err(|e| BrokerError::MalformedFrame(e.to_string()))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self)
            .unwrap_or_else(|_| br#"{"status":"error","worker":null,"error":"unencodable reply"}"#.to_vec())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, WorkerReply::Error { .. })
    }
}
