//! Provider wire schema: the OpenAI-style request we send upstream and the
//! streaming chunk ("pulse") shapes we read back, plus the defensive
//! line-level parser. One malformed line is dropped, never fatal.

use crate::types::{
    ChatMessage, FinishReason, Role, ToolCallDelta, ToolDescriptor, UpstreamDelta,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// --- REQUEST SIDE ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTool {
    pub r#type: String,
    pub function: WireFunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

impl From<&ToolDescriptor> for WireTool {
    fn from(t: &ToolDescriptor) -> Self {
        Self {
            r#type: "function".to_string(),
            function: WireFunctionDefinition {
                name: t.name.clone(),
                description: Some(t.description.clone()),
                parameters: t.input_schema.clone(),
            },
        }
    }
}

/// --- RESPONSE SIDE (streaming pulses) ---

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProviderPulse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub choices: Vec<PulseChoice>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PulseChoice {
    pub delta: PulseDelta,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct PulseDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WireToolCallDelta {
    #[serde(default)]
    pub index: u32,
    pub id: Option<String>,
    pub function: Option<WireFunctionDelta>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WireFunctionDelta {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ProviderError {
    pub error: ProviderErrorDetails,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct ProviderErrorDetails {
    pub message: String,
    pub code: Option<u16>,
}

#[derive(Debug)]
pub enum LineEvent {
    Pulse(ProviderPulse),
    Error(ProviderError),
    Done,
    Unknown,
}

/// Parses one `data: ` payload from the upstream stream. Error is tried
/// first (it is the more specific shape: requires an `error` key); a pulse
/// must carry at least one choice; anything else is `Unknown` and skipped
/// by the caller.
pub fn parse_provider_line(data: &str) -> LineEvent {
    if data == "[DONE]" {
        return LineEvent::Done;
    }
    if let Ok(err) = serde_json::from_str::<ProviderError>(data) {
        return LineEvent::Error(err);
    }
    if let Ok(pulse) = serde_json::from_str::<ProviderPulse>(data) {
        if !pulse.choices.is_empty() {
            return LineEvent::Pulse(pulse);
        }
    }
    let snippet = crate::str_utils::prefix_chars(data, 200);
    tracing::debug!("[☁️  -> ⚙️ ] Skipping unknown line format: {}", snippet);
    LineEvent::Unknown
}

/// Flattens one pulse into connector deltas: tool-call parts first, then
/// text, then the finish marker, matching the upstream's own ordering
/// within a chunk.
pub fn pulse_to_deltas(pulse: &ProviderPulse) -> Vec<UpstreamDelta> {
    let mut out = Vec::new();
    let choice = match pulse.choices.first() {
        Some(c) => c,
        None => return out,
    };

    if let Some(tool_deltas) = &choice.delta.tool_calls {
        for td in tool_deltas {
            out.push(UpstreamDelta::ToolCall(ToolCallDelta {
                index: td.index,
                id: td.id.clone(),
                name: td.function.as_ref().and_then(|f| f.name.clone()),
                arguments: td.function.as_ref().and_then(|f| f.arguments.clone()),
            }));
        }
    }

    if let Some(text) = &choice.delta.content {
        if !text.is_empty() {
            out.push(UpstreamDelta::Text(text.clone()));
        }
    }

    if let Some(reason) = &choice.finish_reason {
        out.push(UpstreamDelta::Finish(FinishReason::from_wire(reason)));
    }

    out
}
