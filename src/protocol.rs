//! Wire protocol: record variants, error codes, and shared constants.
//!
//! Every record on the wire is a JSON object tagged by a snake_case `type`
//! field; all other field names are camelCase. Records travel in two
//! encodings — 4-byte length-prefixed frames on the browser side and
//! newline-delimited lines on the unix socket — but the record model is
//! shared (see [`crate::transport`]).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hard cap on a single encoded record, both framed and line-delimited.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Serialized records above this size are gzip-wrapped on the socket and
/// split into chunks on the framed channel.
pub const CHUNK_THRESHOLD_BYTES: usize = 768 * 1024;

/// Protocol version carried in `session_init` by both peers.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Request to execute one tool on the extension worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub agent_id: String,
    pub tool: String,
    pub input: Value,
    pub timestamp: i64,
}

/// Error payload carried inside a failed [`ToolResult`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

/// Result of one tool call, correlated to its [`ToolCall`] by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub id: String,
    pub agent_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub timestamp: i64,
}

impl ToolResult {
    /// Successful result for the given call.
    pub fn ok(call: &ToolCall, result: Value) -> Self {
        Self {
            id: call.id.clone(),
            agent_id: call.agent_id.clone(),
            success: true,
            result: Some(result),
            error: None,
            timestamp: unix_time_ms(),
        }
    }

    /// Failed result for the given call.
    pub fn err(call: &ToolCall, error: ToolError) -> Self {
        Self {
            id: call.id.clone(),
            agent_id: call.agent_id.clone(),
            success: false,
            result: None,
            error: Some(error),
            timestamp: unix_time_ms(),
        }
    }
}

/// Unsolicited event emitted by the worker on its own timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BrowserEvent {
    pub id: String,
    pub agent_id: String,
    pub event_type: String,
    pub payload: Value,
    pub tab_id: u32,
    pub url: String,
    pub timestamp: i64,
    pub sequence_number: u64,
}

/// Shared shape of the four session lifecycle records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    pub timestamp: i64,
}

impl SessionRecord {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            protocol_version: None,
            config: None,
            timestamp: unix_time_ms(),
        }
    }

    #[must_use]
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

/// One slice of a payload too large for a single frame. A chunk set shares a
/// `request_id`; indices run `0..total_chunks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub request_id: String,
    pub agent_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub total_size: u64,
    pub compressed: bool,
    pub data: String,
}

/// Socket-only gzip envelope wrapping another serialized record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressedEnvelope {
    pub data: String,
}

/// Every record variant that travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    BrowserEvent(BrowserEvent),
    SessionInit(SessionRecord),
    SessionHeartbeat(SessionRecord),
    SessionRecovery(SessionRecord),
    SessionClose(SessionRecord),
    Chunk(ChunkRecord),
    Compressed(CompressedEnvelope),
}

const KNOWN_RECORD_TYPES: &[&str] = &[
    "tool_call",
    "tool_result",
    "browser_event",
    "session_init",
    "session_heartbeat",
    "session_recovery",
    "session_close",
    "chunk",
    "compressed",
];

impl Record {
    /// Decode a record from a parsed JSON value.
    ///
    /// Returns `Ok(None)` for objects whose `type` tag is absent or unknown —
    /// those are ignored for forward compatibility. A known tag with
    /// malformed fields is an error.
    pub fn from_value(value: Value) -> Result<Option<Self>, serde_json::Error> {
        let Some(tag) = value.get("type").and_then(Value::as_str) else {
            return Ok(None);
        };
        if !KNOWN_RECORD_TYPES.contains(&tag) {
            tracing::debug!("ignoring record with unknown type tag {tag:?}");
            return Ok(None);
        }
        serde_json::from_value(value).map(Some)
    }

    /// The agent this record belongs to, when the variant carries one.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Self::ToolCall(r) => Some(&r.agent_id),
            Self::ToolResult(r) => Some(&r.agent_id),
            Self::BrowserEvent(r) => Some(&r.agent_id),
            Self::SessionInit(r)
            | Self::SessionHeartbeat(r)
            | Self::SessionRecovery(r)
            | Self::SessionClose(r) => Some(&r.agent_id),
            Self::Chunk(r) => Some(&r.agent_id),
            Self::Compressed(_) => None,
        }
    }
}

/// Error codes carried on the wire inside tool results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ExtensionNotConnected,
    TabNotFound,
    TabAccessDenied,
    TabLocked,
    DebuggerAttachFailed,
    CdpError,
    Timeout,
    MessageTooLarge,
    ChunkReassemblyFailed,
    /// Reserved: defined on the wire, never raised by this implementation.
    SessionExpired,
    InvalidParams,
    UnknownTool,
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExtensionNotConnected => "EXTENSION_NOT_CONNECTED",
            Self::TabNotFound => "TAB_NOT_FOUND",
            Self::TabAccessDenied => "TAB_ACCESS_DENIED",
            Self::TabLocked => "TAB_LOCKED",
            Self::DebuggerAttachFailed => "DEBUGGER_ATTACH_FAILED",
            Self::CdpError => "CDP_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::ChunkReassemblyFailed => "CHUNK_REASSEMBLY_FAILED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::UnknownTool => "UNKNOWN_TOOL",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Current wall-clock time as unix milliseconds.
#[must_use]
pub fn unix_time_ms() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

/// Fresh UUID string for record, session, and subscription ids.
#[must_use]
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
