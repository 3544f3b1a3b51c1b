use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

/// --- CORE ROLES ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = BeebotError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(BeebotError::InvalidRequest(format!(
                "unknown role: {}",
                other
            ))),
        }
    }
}

/// One turn of conversation history as the orchestrator sees it. An
/// assistant turn that carried only tool calls has `content = None`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_call_id: None,
        }
    }
}

/// Returns the content of the most recent user turn, if any.
pub fn latest_user_content(history: &[ChatMessage]) -> Option<&str> {
    history
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .and_then(|m| m.content.as_deref())
}

/// --- TOOLS ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// One tool call, reassembled incrementally from upstream deltas. The
/// provider may split `name` and `arguments` across many chunks, keyed by
/// `index`; `arguments` is only parsed as JSON once the stream signals the
/// call is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Incremental delta for one tool call within an upstream chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Accumulates [`ToolCallDelta`]s by index. Fragments come back in the
/// order their index first appeared, which fixes the invocation order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    fragments: Vec<ToolCallFragment>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, delta: &ToolCallDelta) {
        match self.fragments.iter_mut().find(|f| f.index == delta.index) {
            Some(frag) => {
                if let Some(id) = &delta.id {
                    frag.id = id.clone();
                }
                if let Some(name) = &delta.name {
                    frag.name.push_str(name);
                }
                if let Some(args) = &delta.arguments {
                    frag.arguments.push_str(args);
                }
            }
            None => {
                let id = match &delta.id {
                    Some(id) => id.clone(),
                    // Some providers omit the id; a stable synthetic id per
                    // index keeps follow-up deltas associated.
                    None => format!("call_{}_{}", Uuid::new_v4().simple(), delta.index),
                };
                self.fragments.push(ToolCallFragment {
                    index: delta.index,
                    id,
                    name: delta.name.clone().unwrap_or_default(),
                    arguments: delta.arguments.clone().unwrap_or_default(),
                });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn into_fragments(self) -> Vec<ToolCallFragment> {
        self.fragments
    }
}

/// --- STREAM EVENTS (the SSE-visible union) ---

/// Exactly one `Finished` or `Error` terminates a stream; nothing is valid
/// after either. `ToolStatus` is progress text and shares the `content`
/// wire key with `Content`; the tool name rides along for server-side
/// accounting and never reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Content { text: String },
    ToolStatus { name: String, text: String },
    Finished,
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finished | StreamEvent::Error { .. })
    }

    /// Canonical wire encoding: a single-line JSON object with exactly one
    /// of the keys `content`, `error`, `finished`. Shared by the server
    /// transport and the client consumer so the two cannot drift.
    pub fn encode(&self) -> String {
        let value = match self {
            StreamEvent::Content { text } | StreamEvent::ToolStatus { text, .. } => {
                serde_json::json!({ "content": text })
            }
            StreamEvent::Error { message } => serde_json::json!({ "error": message }),
            StreamEvent::Finished => serde_json::json!({ "finished": true }),
        };
        value.to_string()
    }

    /// Decodes one frame payload. Status text is indistinguishable from
    /// content on the wire, so it decodes as `Content`.
    pub fn decode(payload: &str) -> Option<StreamEvent> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
            return Some(StreamEvent::Error {
                message: message.to_string(),
            });
        }
        if value.get("finished").and_then(|v| v.as_bool()) == Some(true) {
            return Some(StreamEvent::Finished);
        }
        if let Some(text) = value.get("content").and_then(|v| v.as_str()) {
            return Some(StreamEvent::Content {
                text: text.to_string(),
            });
        }
        None
    }
}

/// --- CONNECTOR DELTAS ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Other,
}

impl FinishReason {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" => FinishReason::Stop,
            "tool_calls" => FinishReason::ToolCalls,
            _ => FinishReason::Other,
        }
    }
}

/// Low-level unit yielded by the upstream connector. The stream is lazy,
/// finite and non-restartable; `Finish` or `Error` is last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamDelta {
    Text(String),
    ToolCall(ToolCallDelta),
    Finish(FinishReason),
    Error(String),
}

/// --- ERRORS ---

#[derive(Error, Debug)]
pub enum BeebotError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Wire-visible message; the client surfaces it verbatim on the error
    // frame, so the format is part of the protocol.
    #[error("HTTP error! status: {status}")]
    Upstream { status: u16, body: String },

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

/// Carries a [`SpanTrace`] captured at the point the error crossed a
/// `?` boundary.
#[derive(Debug)]
pub struct ObservedError {
    pub inner: BeebotError,
    pub span_trace: SpanTrace,
}

impl fmt::Display for ObservedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<BeebotError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let (status, msg, code) = match &self.inner {
            BeebotError::InvalidRequest(m) => {
                (StatusCode::BAD_REQUEST, m.clone(), "INVALID_REQUEST")
            }
            BeebotError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            BeebotError::Network(e) => (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR"),
            BeebotError::Upstream { status, .. } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
                self.inner.to_string(),
                "UPSTREAM_ERROR",
            ),
            BeebotError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            BeebotError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            BeebotError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "IO_ERROR"),
            BeebotError::Internal(m, _) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({ "error": msg, "code": code })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
