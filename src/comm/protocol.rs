//! Wire format and schema validation for comm frames.
//!
//! Every frame is a JSON object `{ "comm_id": ..., "body": { "type": ... } }`.
//! Calls carry the sender's priority-lane port on every payload; there is no
//! dedicated control message for port advertisement.
//!
//! # Security
//! - Frame size limits prevent memory exhaustion
//! - Size is checked before parsing

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::settings::CallSettings;

/// Protocol version announced in the open handshake.
pub const CURRENT_PROTOCOL_VERSION: u32 = 1;

/// Target name used when opening a comm.
pub const COMM_TARGET_NAME: &str = "kernel_comm";

/// Built-in call: the sender's priority lane listens on `args[0]`.
pub const SET_COMM_PORT: &str = "_set_comm_port";

/// Built-in call: ask the peer to re-advertise its priority port.
pub const SEND_COMM_CONFIG: &str = "_send_comm_config";

/// Built-in call: an error raised on the sender's side, `args[0]` is an `ErrorWrapper`.
pub const ASYNC_ERROR: &str = "_async_error";

/// Maximum encoded frame size.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16 MB

/// Pick the version both ends understand.
pub fn negotiate_version(peer_max: u32) -> u32 {
    peer_max.clamp(1, CURRENT_PROTOCOL_VERSION)
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame format: {0}")]
    InvalidFormat(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Opaque comm identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommId(pub Uuid);

impl CommId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CommId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Remote failure carried as ordinary payload data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorWrapper {
    /// Kind tag, e.g. the failing error type.
    pub kind: String,
    /// Formatted description, one entry per line.
    pub lines: Vec<String>,
}

impl ErrorWrapper {
    pub fn new(kind: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            lines,
        }
    }

    /// Build a wrapper from a possibly multi-line message.
    pub fn from_message(kind: impl Into<String>, message: &str) -> Self {
        Self::new(kind, message.lines().map(str::to_string).collect())
    }

    /// Ordered lines for display.
    pub fn format_error(&self) -> &[String] {
        &self.lines
    }
}

impl fmt::Display for ErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.lines.join("\n"))
    }
}

/// Outgoing call payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    pub call_id: CallId,
    #[serde(default)]
    pub settings: CallSettings,
    /// Sender's current priority-lane listening port, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_port: Option<u16>,
}

impl CallRequest {
    pub fn new(method: impl Into<String>, args: Vec<Value>, settings: CallSettings) -> Self {
        Self {
            method: method.into(),
            args,
            kwargs: Map::new(),
            call_id: CallId::new(),
            settings,
            priority_port: None,
        }
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.method.is_empty() {
            return Err(ProtocolError::MissingField("method".into()));
        }
        Ok(())
    }
}

/// Result half of a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyResult {
    Ok(Value),
    Err(ErrorWrapper),
}

impl ReplyResult {
    pub fn into_result(self) -> Result<Value, ErrorWrapper> {
        match self {
            ReplyResult::Ok(value) => Ok(value),
            ReplyResult::Err(wrapper) => Err(wrapper),
        }
    }
}

/// Reply to a blocking call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReply {
    pub call_id: CallId,
    pub result: ReplyResult,
}

impl CallReply {
    pub fn success(call_id: CallId, value: Value) -> Self {
        Self {
            call_id,
            result: ReplyResult::Ok(value),
        }
    }

    pub fn error(call_id: CallId, wrapper: ErrorWrapper) -> Self {
        Self {
            call_id,
            result: ReplyResult::Err(wrapper),
        }
    }
}

/// All frame bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameBody {
    #[serde(rename = "comm_open")]
    CommOpen {
        target_name: String,
        /// Highest protocol version the sender supports.
        protocol_version: u32,
    },

    #[serde(rename = "remote_call")]
    RemoteCall(CallRequest),

    #[serde(rename = "call_reply")]
    CallReply(CallReply),

    /// Close notice, sent outside call/reply framing.
    #[serde(rename = "comm_close")]
    CommClose,

    /// Sent over the priority lane when it is torn down.
    #[serde(rename = "shutdown_request")]
    ShutdownRequest,
}

/// A frame addressed to one comm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub comm_id: CommId,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(comm_id: CommId, body: FrameBody) -> Self {
        Self { comm_id, body }
    }
}

/// Encode frame to JSON bytes with size limit enforcement.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(frame)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode frame from JSON bytes with size limit enforcement.
///
/// # Security
/// Size check happens BEFORE parsing to prevent allocation attacks.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let frame: Frame = serde_json::from_slice(bytes)?;
    if let FrameBody::RemoteCall(request) = &frame.body {
        request.validate()?;
    }
    Ok(frame)
}
