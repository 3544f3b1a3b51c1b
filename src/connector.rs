//! Upstream model connector. Opens a streaming chat completion against the
//! provider, pumps the line-delimited response through a bounded channel,
//! and exposes it as a flat stream of [`UpstreamDelta`]s.

use crate::constants::{
    COMPLETION_TEMPERATURE, DEEPSEEK_BASE_URL, DEFAULT_MODEL, DELTA_CHANNEL_CAPACITY,
    MAX_COMPLETION_TOKENS, MAX_LINE_BYTES, MAX_STREAM_LINES, TITLE_FALLBACK_WORDS, TITLE_MAX_TOKENS,
    TITLE_SYSTEM_PROMPT,
};
use crate::str_utils::first_words;
use crate::types::{BeebotError, ChatMessage, Result, Role, ToolDescriptor, UpstreamDelta};
use crate::wire::{parse_provider_line, ChatRequest, LineEvent, WireMessage, WireTool};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};

pub type DeltaStream = Pin<Box<dyn Stream<Item = UpstreamDelta> + Send>>;

/// Seam between the orchestrator and the model provider. Tests substitute
/// a scripted connector; production uses [`DeepSeekConnector`].
pub trait UpstreamConnector: Send + Sync {
    fn open(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> impl std::future::Future<Output = Result<DeltaStream>> + Send;
}

#[derive(Clone)]
pub struct DeepSeekConnector {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl DeepSeekConnector {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            base_url: DEEPSEEK_BASE_URL.to_string(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_request(
        &self,
        history: &[ChatMessage],
        tools: &[ToolDescriptor],
        stream: bool,
    ) -> ChatRequest {
        let wire_tools: Option<Vec<WireTool>> = if tools.is_empty() {
            None
        } else {
            Some(tools.iter().map(WireTool::from).collect())
        };
        let tool_choice = if wire_tools.is_some() {
            Some("auto".to_string())
        } else {
            Some("none".to_string())
        };
        ChatRequest {
            model: self.model.clone(),
            messages: history.iter().map(WireMessage::from).collect(),
            stream: Some(stream),
            temperature: Some(COMPLETION_TEMPERATURE),
            max_tokens: Some(MAX_COMPLETION_TOKENS),
            tools: wire_tools,
            tool_choice,
            extra: HashMap::new(),
        }
    }

    async fn post(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);
        if !status.is_success() {
            let body = match response.text().await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!("Failed to read error body: {}", e);
                    format!("Upstream error (body unreadable): {}", e)
                }
            };
            tracing::error!("[☁️  -> ⚙️ ] Upstream Error: {}", body);
            return Err(BeebotError::Upstream {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        Ok(response)
    }

    /// One-shot (non-streaming) title generation for a fresh conversation.
    /// Any failure falls back to the first words of the user message.
    pub async fn generate_title(&self, first_message: &str) -> String {
        let fallback = first_words(first_message, TITLE_FALLBACK_WORDS);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                WireMessage {
                    role: Role::System,
                    content: Some(TITLE_SYSTEM_PROMPT.to_string()),
                    tool_call_id: None,
                },
                WireMessage {
                    role: Role::User,
                    content: Some(first_message.to_string()),
                    tool_call_id: None,
                },
            ],
            stream: Some(false),
            temperature: None,
            max_tokens: Some(TITLE_MAX_TOKENS),
            tools: None,
            tool_choice: None,
            extra: HashMap::new(),
        };

        let response = match self.post(&request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Title generation request failed: {}", e);
                return fallback;
            }
        };

        #[derive(serde::Deserialize)]
        struct Completion {
            choices: Vec<CompletionChoice>,
        }
        #[derive(serde::Deserialize)]
        struct CompletionChoice {
            message: CompletionMessage,
        }
        #[derive(serde::Deserialize)]
        struct CompletionMessage {
            content: Option<String>,
        }

        match response.json::<Completion>().await {
            Ok(completion) => completion
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .map(|t| t.trim().trim_matches('"').to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or(fallback),
            Err(e) => {
                tracing::warn!("Title generation parse failed: {}", e);
                fallback
            }
        }
    }
}

impl UpstreamConnector for DeepSeekConnector {
    async fn open(&self, history: &[ChatMessage], tools: &[ToolDescriptor]) -> Result<DeltaStream> {
        let request = self.build_request(history, tools, true);
        tracing::debug!(
            "[⚙️  -> ☁️ ] Opening stream: {} messages, {} tools",
            request.messages.len(),
            tools.len()
        );
        let response = self.post(&request).await?;

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines_stream = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );

        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        tokio::spawn(pump_lines(lines_stream, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Reads provider lines until `[DONE]`, EOF, or the consumer hangs up,
/// translating each pulse into deltas. Malformed lines are skipped.
async fn pump_lines<R>(
    mut lines_stream: FramedRead<tokio_util::io::StreamReader<R, bytes::Bytes>, LinesCodec>,
    tx: mpsc::Sender<UpstreamDelta>,
) where
    R: Stream<Item = std::io::Result<bytes::Bytes>> + Unpin + Send + 'static,
{
    let mut line_count: usize = 0;

    while let Some(line_result) = lines_stream.next().await {
        line_count += 1;
        if line_count > MAX_STREAM_LINES {
            tracing::error!("Stream exceeded {} lines, aborting", MAX_STREAM_LINES);
            let _ = tx
                .send(UpstreamDelta::Error("Stream line limit exceeded".into()))
                .await;
            return;
        }

        let line = match line_result {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("[☁️  -> ⚙️ ] Stream read error: {}", e);
                let _ = tx
                    .send(UpstreamDelta::Error(format!("Stream read error: {}", e)))
                    .await;
                return;
            }
        };

        let data = match line.strip_prefix("data: ") {
            Some(data) => data.trim(),
            None => continue,
        };
        if data.is_empty() {
            continue;
        }

        match parse_provider_line(data) {
            LineEvent::Done => {
                tracing::debug!("[☁️  -> ⚙️ ] Stream complete after {} lines", line_count);
                return;
            }
            LineEvent::Pulse(pulse) => {
                for delta in crate::wire::pulse_to_deltas(&pulse) {
                    if tx.send(delta).await.is_err() {
                        tracing::debug!("Delta consumer dropped, closing upstream pump");
                        return;
                    }
                }
            }
            LineEvent::Error(err) => {
                tracing::error!("[☁️  -> ⚙️ ] Provider error: {}", err.error.message);
                let _ = tx.send(UpstreamDelta::Error(err.error.message)).await;
                return;
            }
            LineEvent::Unknown => {}
        }
    }
    tracing::debug!("[☁️  -> ⚙️ ] Upstream closed after {} lines", line_count);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> DeepSeekConnector {
        DeepSeekConnector::new(reqwest::Client::new(), "test-key".into())
    }

    #[test]
    fn request_advertises_tools_with_auto_choice() {
        let tools = vec![ToolDescriptor {
            name: "get_weather".into(),
            description: "Forecast".into(),
            input_schema: serde_json::json!({"type": "object"}),
        }];
        let req = connector().build_request(&[ChatMessage::user("hi")], &tools, true);
        assert_eq!(req.tool_choice.as_deref(), Some("auto"));
        assert_eq!(req.tools.as_ref().map(Vec::len), Some(1));
        assert_eq!(req.max_tokens, Some(MAX_COMPLETION_TOKENS));
    }

    #[test]
    fn empty_toolset_disables_tool_choice() {
        let req = connector().build_request(&[ChatMessage::user("think hard")], &[], true);
        assert_eq!(req.tool_choice.as_deref(), Some("none"));
        assert!(req.tools.is_none());
    }

    #[tokio::test]
    async fn pump_translates_lines_and_stops_at_done() {
        let raw = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n",
            "not a data line\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after\"},\"finish_reason\":null}]}\n",
        );
        let byte_stream = futures_util::stream::iter(vec![Ok(bytes::Bytes::from_static(
            raw.as_bytes(),
        ))]);
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(byte_stream),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );
        let (tx, mut rx) = mpsc::channel(16);
        pump_lines(lines, tx).await;

        let mut deltas = Vec::new();
        while let Some(d) = rx.recv().await {
            deltas.push(d);
        }
        assert_eq!(
            deltas,
            vec![
                UpstreamDelta::Text("Hel".into()),
                UpstreamDelta::Text("lo".into()),
                UpstreamDelta::Finish(crate::types::FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn pump_surfaces_provider_error() {
        let raw = "data: {\"error\":{\"message\":\"overloaded\",\"code\":529}}\n";
        let byte_stream = futures_util::stream::iter(vec![Ok(bytes::Bytes::from_static(
            raw.as_bytes(),
        ))]);
        let lines = FramedRead::new(
            tokio_util::io::StreamReader::new(byte_stream),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );
        let (tx, mut rx) = mpsc::channel(16);
        pump_lines(lines, tx).await;

        assert_eq!(
            rx.recv().await,
            Some(UpstreamDelta::Error("overloaded".into()))
        );
        assert_eq!(rx.recv().await, None);
    }
}
