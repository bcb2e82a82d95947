//! Run stream wire schema.
//!
//! The server speaks a small event protocol over one SSE connection per run.
//! Each SSE payload is a [`StreamFrame`] envelope (`{type, data, thread_id?}`)
//! that decodes into exactly one [`StreamEvent`] variant; the engine matches
//! on that enum exhaustively.

use crate::types::{Message, MessageKind, RunConfig};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Body of the `POST` that opens a run stream.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub input: RunInput,
    pub configurable: RunConfigurable,
    pub is_test_mode: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunInput {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunConfigurable {
    /// `None` asks the server to allocate a new thread.
    pub thread_id: Option<String>,
    pub run_config: RunConfig,
}

impl RunRequest {
    pub fn human(
        content: impl Into<String>,
        thread_id: Option<String>,
        run_config: RunConfig,
        is_test_mode: bool,
    ) -> Self {
        Self {
            input: RunInput {
                kind: MessageKind::Human,
                content: content.into(),
            },
            configurable: RunConfigurable {
                thread_id,
                run_config,
            },
            is_test_mode,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Raw event envelope as delivered on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl StreamFrame {
    pub fn new(kind: impl Into<String>, data: Value, thread_id: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            data,
            thread_id: thread_id.map(str::to_string),
        }
    }
}

/// Typed run events.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    RunStart(RunStart),
    Chunk(Chunk),
    AiToolChunk(AiToolChunk),
    ToolResult(ToolResult),
    Error(BackendError),
    End(End),
}

impl StreamEvent {
    /// Decode a frame's `data` according to its `type`.
    pub fn decode(frame: &StreamFrame) -> Result<Self, FrameDecodeError> {
        let data = frame.data.clone();
        let decoded = match frame.kind.as_str() {
            "run_start" => serde_json::from_value(data).map(Self::RunStart),
            "chunk" => serde_json::from_value(data).map(Self::Chunk),
            "ai_tool_chunk" => serde_json::from_value(data).map(Self::AiToolChunk),
            "tool_result" => serde_json::from_value(data).map(Self::ToolResult),
            "error" => serde_json::from_value(data).map(Self::Error),
            // `end` frames may carry no data at all.
            "end" if frame.data.is_null() => Ok(Self::End(End::default())),
            "end" => serde_json::from_value(data).map(Self::End),
            other => return Err(FrameDecodeError::UnknownType(other.to_string())),
        };
        decoded.map_err(|err| FrameDecodeError::Malformed {
            kind: frame.kind.clone(),
            message: err.to_string(),
        })
    }

    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RunStart(_) => "run_start",
            Self::Chunk(_) => "chunk",
            Self::AiToolChunk(_) => "ai_tool_chunk",
            Self::ToolResult(_) => "tool_result",
            Self::Error(_) => "error",
            Self::End(_) => "end",
        }
    }
}

/// Why a frame could not become a [`StreamEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    UnknownType(String),
    Malformed { kind: String, message: String },
}

impl fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(kind) => write!(f, "unknown event type `{kind}`"),
            Self::Malformed { kind, message } => write!(f, "malformed `{kind}` event: {message}"),
        }
    }
}

impl std::error::Error for FrameDecodeError {}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// First event of every run.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RunStart {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default, alias = "checkpointId")]
    pub checkpoint_id: Option<String>,
    #[serde(default, rename = "initialMessages", alias = "initial_messages")]
    pub initial_messages: Vec<Message>,
    #[serde(default, rename = "runConfig", alias = "run_config")]
    pub run_config: Option<RunConfig>,
}

/// Streamed assistant text from one node.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    #[serde(default)]
    pub node: String,
    #[serde(default, deserialize_with = "text_or_json")]
    pub content: String,
}

/// Streamed tool-call fragment. A fragment with `id` opens a new call; one
/// with only `args` extends the most recent call.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AiToolChunk {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Option<String>,
}

/// Output of a tool the server executed.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ToolResult {
    #[serde(default)]
    pub node: String,
    #[serde(default, alias = "name")]
    pub tool_name: String,
    #[serde(default, deserialize_with = "text_or_json")]
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

/// Server-side failure reported in-band.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct BackendError {
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default, deserialize_with = "text_or_json")]
    pub error: String,
}

impl BackendError {
    /// User-facing message, e.g. `Backend Error (n1): boom`.
    pub fn message(&self) -> String {
        let node = self.node.as_deref().unwrap_or("unknown");
        format!("Backend Error ({node}): {}", self.error)
    }
}

/// Last event of a successful run.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct End {
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Accept either a JSON string or any other JSON value (rendered compactly).
fn text_or_json<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}
