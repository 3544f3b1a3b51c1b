//! Full turn pipeline: scripted upstream deltas through the turn engine,
//! framed as SSE bytes, then decoded and accumulated exactly the way the
//! client does.

use beebot::connector::{DeltaStream, UpstreamConnector};
use beebot::consumer::{FrameDecoder, StreamConsumer, TurnOutcome};
use beebot::orchestrator::run_turn;
use beebot::registry::ToolInvoker;
use beebot::types::{
    BeebotError, ChatMessage, FinishReason, Result, StreamEvent, ToolCallDelta, ToolDescriptor,
    UpstreamDelta,
};
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;

struct ScriptedConnector {
    scripts: Mutex<Vec<Result<Vec<UpstreamDelta>>>>,
}

impl ScriptedConnector {
    fn new(scripts: Vec<Result<Vec<UpstreamDelta>>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
        }
    }
}

impl UpstreamConnector for ScriptedConnector {
    async fn open(
        &self,
        _history: &[ChatMessage],
        _tools: &[ToolDescriptor],
    ) -> Result<DeltaStream> {
        let script = self.scripts.lock().unwrap().remove(0);
        script.map(|deltas| Box::pin(futures_util::stream::iter(deltas)) as DeltaStream)
    }
}

struct CannedTools;

impl ToolInvoker for CannedTools {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "get_weather_by_city".into(),
                description: "Weather forecast by city name".into(),
                input_schema: serde_json::json!({"type": "object"}),
            },
            ToolDescriptor {
                name: "web_search".into(),
                description: "Web search".into(),
                input_schema: serde_json::json!({"type": "object"}),
            },
        ]
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> String {
        match name {
            "get_weather_by_city" => format!(
                "Forecast for {}: 31°C, humid",
                arguments["city"].as_str().unwrap_or("?")
            ),
            "web_search" => "1. Example result".to_string(),
            other => format!("Unknown tool: {}", other),
        }
    }
}

/// Runs a turn and pushes every event through the SSE wire format and the
/// client decoder, returning what the client would have seen.
async fn run_through_wire(
    connector: &ScriptedConnector,
    history: &[ChatMessage],
    selected_tool: Option<&str>,
) -> (String, Option<TurnOutcome>, Vec<StreamEvent>) {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(32);
    let tools = CannedTools;
    let engine = run_turn(connector, &tools, history, selected_tool, tx);

    let client = async {
        let mut wire = Vec::new();
        while let Some(event) = rx.recv().await {
            wire.extend_from_slice(&beebot::sse::frame(&event));
        }
        wire
    };
    let (_, wire) = tokio::join!(engine, client);

    // Feed in awkward 7-byte chunks so framing cannot depend on chunk
    // boundaries.
    let mut decoder = FrameDecoder::new();
    let mut consumer = StreamConsumer::new();
    let mut decoded = Vec::new();
    for chunk in wire.chunks(7) {
        for event in decoder.feed(chunk) {
            decoded.push(event.clone());
            consumer.apply(event);
        }
    }
    (
        consumer.text().to_string(),
        consumer.outcome().cloned(),
        decoded,
    )
}

#[tokio::test]
async fn weather_question_streams_status_then_result() {
    let connector = ScriptedConnector::new(vec![Ok(vec![
        UpstreamDelta::ToolCall(ToolCallDelta {
            index: 0,
            id: Some("call_1".into()),
            name: Some("get_weather_by_city".into()),
            arguments: Some(r#"{"city":"#.into()),
        }),
        UpstreamDelta::ToolCall(ToolCallDelta {
            index: 0,
            id: None,
            name: None,
            arguments: Some(r#""Dhaka"}"#.into()),
        }),
        UpstreamDelta::Finish(FinishReason::ToolCalls),
    ])]);
    let history = vec![ChatMessage::user("What's the weather in Dhaka?")];

    let (text, outcome, events) = run_through_wire(&connector, &history, None).await;

    assert_eq!(
        text,
        "\n\n🌤️ Getting weather forecast for Dhaka...\n\nForecast for Dhaka: 31°C, humid"
    );
    assert_eq!(outcome, Some(TurnOutcome::Finished));
    assert_eq!(events.last(), Some(&StreamEvent::Finished));
    // Exactly one terminal event on the wire.
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn explicit_web_search_skips_the_model() {
    // No scripts: any connector.open() call would panic.
    let connector = ScriptedConnector::new(vec![]);
    let history = vec![ChatMessage::user("latest rust release")];

    let (text, outcome, _) = run_through_wire(&connector, &history, Some("web-search")).await;

    assert_eq!(
        text,
        "Searching the web on \"latest rust release\"...\n\n1. Example result\n\n"
    );
    assert_eq!(outcome, Some(TurnOutcome::Finished));
}

#[tokio::test]
async fn upstream_failure_reaches_the_client_verbatim() {
    let connector = ScriptedConnector::new(vec![Err(BeebotError::Upstream {
        status: 500,
        body: "internal".into(),
    }
    .into())]);
    let history = vec![ChatMessage::user("hi")];

    let (text, outcome, events) = run_through_wire(&connector, &history, None).await;

    assert_eq!(text, "");
    assert_eq!(
        outcome,
        Some(TurnOutcome::Errored("HTTP error! status: 500".into()))
    );
    assert_eq!(
        events,
        vec![StreamEvent::Error {
            message: "HTTP error! status: 500".into()
        }]
    );
}

#[tokio::test]
async fn text_and_tool_turns_share_one_wire_grammar() {
    let connector = ScriptedConnector::new(vec![Ok(vec![
        UpstreamDelta::Text("Plain ".into()),
        UpstreamDelta::Text("answer.".into()),
        UpstreamDelta::Finish(FinishReason::Stop),
    ])]);
    let history = vec![ChatMessage::user("say something")];

    let (text, outcome, events) = run_through_wire(&connector, &history, None).await;

    assert_eq!(text, "Plain answer.");
    assert_eq!(outcome, Some(TurnOutcome::Finished));
    // Status and content frames are indistinguishable on the wire, so the
    // decoded stream is all Content plus the terminal.
    assert!(events[..events.len() - 1]
        .iter()
        .all(|e| matches!(e, StreamEvent::Content { .. })));
}
