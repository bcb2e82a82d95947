//! Conversation data model shared by the stores, the stream engine and the
//! REST client.
//!
//! Field names follow the server's camelCase JSON so snapshots can be
//! deserialized straight off the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Discriminant of [`Message`], used for `(type, content)` comparisons.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Human,
    Ai,
    Tool,
    System,
}

/// One entry of a thread's message history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Human(TextMessage),
    Ai(AiMessage),
    Tool(ToolMessage),
    System(TextMessage),
}

/// Body shared by `human` and `system` messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TextMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Assistant output: streamed text plus any tool calls it requested.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AiMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

/// Result of executing a tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_error: bool,
}

/// A tool invocation requested by the assistant.
///
/// `args` is the raw JSON text as streamed; it may be incomplete while the
/// run is still in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: String,
}

impl Message {
    pub fn human(content: impl Into<String>) -> Self {
        Self::Human(TextMessage {
            content: content.into(),
            node_id: None,
        })
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System(TextMessage {
            content: content.into(),
            node_id: None,
        })
    }

    /// Start an empty assistant message attributed to `node`.
    pub fn ai_for_node(node: impl Into<String>) -> Self {
        Self::Ai(AiMessage {
            content: String::new(),
            node_id: Some(node.into()),
            tool_calls: Vec::new(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Human(_) => MessageKind::Human,
            Self::Ai(_) => MessageKind::Ai,
            Self::Tool(_) => MessageKind::Tool,
            Self::System(_) => MessageKind::System,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Human(m) | Self::System(m) => &m.content,
            Self::Ai(m) => &m.content,
            Self::Tool(m) => &m.content,
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Human(m) | Self::System(m) => m.node_id.as_deref(),
            Self::Ai(m) => m.node_id.as_deref(),
            Self::Tool(m) => m.node_id.as_deref(),
        }
    }

    /// True when both messages have the same type and identical content.
    pub fn same_type_and_content(&self, other: &Message) -> bool {
        self.kind() == other.kind() && self.content() == other.content()
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

/// Opaque run configuration (selected policy modules, adherence levels).
///
/// The client never interprets it; it travels to the server with each run
/// and comes back in `run_start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RunConfig(pub Value);

impl RunConfig {
    /// Build the configuration the CLI sends for a set of constitution
    /// modules and an optional adherence level (1-5).
    pub fn for_modules(modules: &[String], adherence: Option<u8>) -> Self {
        let configured = modules
            .iter()
            .map(|module| {
                let mut entry = serde_json::Map::new();
                entry.insert("id".to_string(), Value::String(module.clone()));
                if let Some(level) = adherence {
                    entry.insert("adherence_level".to_string(), Value::from(level));
                }
                Value::Object(entry)
            })
            .collect::<Vec<_>>();
        Self(serde_json::json!({ "configuredModules": configured }))
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }
}

/// Last known state of a thread's conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadHistory {
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    pub thread_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub run_config: Option<RunConfig>,
}

impl ThreadHistory {
    pub fn empty(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            ..Self::default()
        }
    }
}

/// Run status of a cached thread.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    #[default]
    Idle,
    Streaming,
    Error,
}

/// Thread cache entry.
///
/// `error` is `Some` exactly when `status` is [`ThreadStatus::Error`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub history: Option<ThreadHistory>,
    pub status: ThreadStatus,
    pub error: Option<String>,
}

impl Thread {
    pub fn messages(&self) -> &[Message] {
        self.history
            .as_ref()
            .map(|history| history.messages.as_slice())
            .unwrap_or_default()
    }

    /// Accepts stream events only while streaming and error-free.
    pub fn accepts_stream_events(&self) -> bool {
        self.status == ThreadStatus::Streaming && self.error.is_none()
    }
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// `GET` latest-history response body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    pub thread_id: String,
    #[serde(default)]
    pub values: HistoryValues,
    #[serde(default)]
    pub run_config: Option<RunConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryValues {
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl From<HistoryResponse> for ThreadHistory {
    fn from(response: HistoryResponse) -> Self {
        Self {
            checkpoint_id: response.checkpoint_id,
            thread_id: response.thread_id,
            messages: response.values.messages,
            run_config: response.run_config,
        }
    }
}
