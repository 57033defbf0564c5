//! Shared wire-format types for the vmesh control mesh.
//!
//! This crate is the single source of truth for the message protocol spoken
//! between mesh peers and over the local control socket. The daemon and the
//! one-shot client both depend on it to avoid struct duplication.
//!
//! ## Wire Format
//!
//! Every message is framed as:
//!
//! ```text
//! ┌──────────────┬───────────┬──────────────────┐
//! │ length (4 B) │ type (1B) │ payload (N bytes) │
//! └──────────────┴───────────┴──────────────────┘
//! ```
//!
//! - **length**: `u32` little-endian, size of the payload only (not including the 5-byte header).
//! - **type**: one byte mapping to [`MessageType`].
//! - **payload**: JSON-encoded body (may be empty).
//!
//! Typed errors do not cross the wire; every error field is a plain string.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors that can occur during protocol message parsing.
#[derive(Debug)]
pub enum ProtocolError {
    /// Message buffer too short, incomplete, or over the frame cap.
    InvalidMessage(String),
    /// The type byte does not map to a known [`MessageType`].
    UnknownMessageType(u8),
    /// An I/O error occurred while reading or writing.
    Io(std::io::Error),
    /// JSON (de)serialization failed.
    Json(serde_json::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidMessage(msg) => write!(f, "invalid message: {}", msg),
            ProtocolError::UnknownMessageType(b) => write!(f, "unknown message type: {}", b),
            ProtocolError::Io(e) => write!(f, "io error: {}", e),
            ProtocolError::Json(e) => write!(f, "json error: {}", e),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Header size in bytes: 4 (length) + 1 (type).
pub const HEADER_SIZE: usize = 5;

/// Upper bound on a single frame's payload. Anything larger is treated as a
/// corrupt stream rather than an allocation request.
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Message types carried across the mesh and the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// A command to execute on the receiving hosts
    Command = 1,
    /// A batch of responses correlated to a command by TID
    Response = 2,
    /// A request to schedule-and-launch VMs on the receiving host
    RemoteLaunch = 3,
    /// Launch outcome, one per remote-launch request
    RemoteLaunchResponse = 4,
    /// A file pushed between hosts
    FileTransfer = 5,
    /// Membership state advertisement, flooded across the mesh
    Msa = 6,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            1 => Ok(MessageType::Command),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::RemoteLaunch),
            4 => Ok(MessageType::RemoteLaunchResponse),
            5 => Ok(MessageType::FileTransfer),
            6 => Ok(MessageType::Msa),
            _ => Err(ProtocolError::UnknownMessageType(byte)),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A framed protocol message consisting of a type tag and a payload.
///
/// Use [`Frame::serialize`] / [`Frame::deserialize`] for in-memory
/// conversion and [`Frame::read_from_sync`] for streaming from a reader.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Type of message.
    pub msg_type: MessageType,
    /// Message payload (JSON-encoded).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize this frame into a byte buffer (header + payload).
    pub fn serialize(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&payload_len.to_le_bytes());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a frame from a contiguous byte slice.
    pub fn deserialize(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage("frame too short".into()));
        }

        let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if length > MAX_PAYLOAD {
            return Err(ProtocolError::InvalidMessage(format!(
                "payload of {} bytes exceeds frame cap",
                length
            )));
        }
        let msg_type = MessageType::try_from(data[4])?;

        if data.len() < HEADER_SIZE + length {
            return Err(ProtocolError::InvalidMessage("incomplete frame".into()));
        }

        let payload = data[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        Ok(Self { msg_type, payload })
    }

    /// Read a complete frame from a synchronous [`std::io::Read`] stream.
    ///
    /// Used by the one-shot control-socket client; the mesh reads frames
    /// asynchronously with the same header layout.
    pub fn read_from_sync<R: std::io::Read>(reader: &mut R) -> Result<Self, ProtocolError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length > MAX_PAYLOAD {
            return Err(ProtocolError::InvalidMessage(format!(
                "payload of {} bytes exceeds frame cap",
                length
            )));
        }
        let msg_type = MessageType::try_from(header[4])?;

        let mut payload = vec![0u8; length];
        if length > 0 {
            reader.read_exact(&mut payload)?;
        }

        Ok(Self { msg_type, payload })
    }

    /// Write this frame to a synchronous [`std::io::Write`] stream.
    pub fn write_to_sync<W: std::io::Write>(&self, writer: &mut W) -> Result<(), ProtocolError> {
        writer.write_all(&self.serialize())?;
        writer.flush()?;
        Ok(())
    }

    /// Encode a body into a frame of the given type.
    pub fn encode<T: Serialize>(msg_type: MessageType, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            msg_type,
            payload: serde_json::to_vec(body)?,
        })
    }

    /// Decode this frame's payload into a typed body.
    pub fn decode<'a, T: Deserialize<'a>>(&'a self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Routing header attached to every mesh body.
///
/// Frames are flooded; a host that is not in `to` forwards the frame and
/// otherwise ignores it. `seq` pairs with `from` to suppress re-floods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Hostname of the sender.
    pub from: String,
    /// Recipient hostnames. Empty means every host.
    pub to: Vec<String>,
    /// Per-sender monotonic sequence number, used for flood suppression.
    pub seq: u64,
    /// The typed body.
    pub body: T,
}

// ---------------------------------------------------------------------------
// Bodies
// ---------------------------------------------------------------------------

/// A compiled command as it travels between hosts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WireCommand {
    /// The original command text.
    pub original: String,
    /// Resolved subcommand path, e.g. `["vm", "info"]`.
    pub path: Vec<String>,
    #[serde(default)]
    pub bool_args: HashMap<String, bool>,
    #[serde(default)]
    pub string_args: HashMap<String, String>,
    #[serde(default)]
    pub list_args: HashMap<String, Vec<String>>,
}

/// A command envelope correlated by transaction id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Transaction id assigned by the sender, 31-bit.
    pub tid: i32,
    pub command: WireCommand,
}

/// One host's answer to a command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WireResponse {
    /// Host that produced this response.
    pub host: String,
    /// Error text; empty on success. Typed errors cannot cross the encoder.
    #[serde(default)]
    pub error: String,
    /// Free-form response text.
    #[serde(default)]
    pub response: String,
    /// Column names for `tabular`, empty when the response is plain text.
    #[serde(default)]
    pub header: Vec<String>,
    /// Tabular rows, one `Vec<String>` per row.
    #[serde(default)]
    pub tabular: Vec<Vec<String>>,
}

impl WireResponse {
    /// A plain-text response from `host`.
    pub fn text(host: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            response: response.into(),
            ..Default::default()
        }
    }

    /// An error response from `host`.
    pub fn error(host: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            error: error.into(),
            ..Default::default()
        }
    }
}

/// A batch of responses correlated to one command send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// Transaction id copied from the originating command.
    pub tid: i32,
    pub responses: Vec<WireResponse>,
}

/// The slice of a VM launch request that travels to a remote host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireQueuedVms {
    /// VM names to launch, in order.
    pub names: Vec<String>,
    /// JSON dump of the effective VM configuration.
    pub config: serde_json::Value,
}

/// Request to launch a batch of VMs on the receiving host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLaunchMessage {
    pub tid: i32,
    /// Namespace the VMs belong to.
    pub namespace: String,
    pub queued: Vec<WireQueuedVms>,
}

/// Launch outcome for a remote-launch request. Errors are strings joined
/// with newline by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLaunchResponseMessage {
    pub tid: i32,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// A file pushed between hosts, delivered under the receiver's files dir.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferMessage {
    pub tid: i32,
    /// Path relative to the files directory.
    pub filename: String,
    /// Chunk offset in bytes.
    pub offset: u64,
    pub data: Vec<u8>,
    /// True on the final chunk.
    pub eof: bool,
}

/// Membership state advertisement: one host's direct neighbors.
///
/// Flooding these gives every node the full adjacency list of the mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MsaMessage {
    /// Advertising host.
    pub host: String,
    /// Hosts it currently holds connections to.
    pub neighbors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
