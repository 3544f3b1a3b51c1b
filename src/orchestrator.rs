//! The turn engine. Drives one assistant response end to end: opens the
//! upstream stream (or bypasses it for an explicitly selected tool),
//! forwards text deltas, reassembles tool calls, invokes them in order,
//! and guarantees exactly one terminal event on the channel. A failed
//! send means the client hung up; every path stops immediately on it.

use crate::connector::UpstreamConnector;
use crate::registry::ToolInvoker;
use crate::types::{
    latest_user_content, ChatMessage, FinishReason, StreamEvent, ToolCallAccumulator,
    ToolCallFragment, ToolDescriptor, UpstreamDelta,
};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

/// Client-side tool pickers the UI can send alongside a message.
pub const PICKER_WEB_SEARCH: &str = "web-search";
pub const PICKER_DEEP_RESEARCH: &str = "deep-research";
pub const PICKER_REASONING: &str = "reasoning";

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    if tx.send(event).await.is_err() {
        tracing::debug!("Event consumer dropped, stopping turn");
        return false;
    }
    true
}

/// Progress line shown in the transcript before a tool runs. Tools
/// without an entry run silently.
fn status_line(name: &str, args: &Value) -> Option<String> {
    let s = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or("");
    let line = match name {
        "get_forecast" => format!(
            "\n\n🌤️ Getting weather forecast for coordinates {}, {}...\n\n",
            args.get("latitude").cloned().unwrap_or(Value::Null),
            args.get("longitude").cloned().unwrap_or(Value::Null)
        ),
        "get_weather_by_city" => {
            format!("\n\n🌤️ Getting weather forecast for {}...\n\n", s("city"))
        }
        "get_alerts" => format!("\n\n⚠️ Getting weather alerts for {}...\n\n", s("state")),
        "web_search" => format!("\n\n🔍 Searching the web for \"{}\"...\n\n", s("query")),
        "deep_research" => format!(
            "\n\n🔬 Conducting deep research on \"{}\"...\n\n",
            s("query")
        ),
        "read_url" => format!("\n\n📄 Reading content from {}...\n\n", s("url")),
        "capture_screenshot_url" => {
            format!("\n\n📸 Capturing screenshot of {}...\n\n", s("url"))
        }
        "search_web_jina" => format!(
            "\n\n🌐 Searching the web for \"{}\" using Jina AI...\n\n",
            s("query")
        ),
        "search_arxiv" => format!("\n\n🔬 Searching arXiv papers for \"{}\"...\n\n", s("query")),
        _ => return None,
    };
    Some(line)
}

/// Runs one turn, writing events into `tx`. The channel gets at most one
/// terminal event; if the receiver goes away mid-turn, nothing else runs.
pub async fn run_turn<C, T>(
    connector: &C,
    tools: &T,
    history: &[ChatMessage],
    selected_tool: Option<&str>,
    tx: mpsc::Sender<StreamEvent>,
) where
    C: UpstreamConnector,
    T: ToolInvoker,
{
    // Explicit picker selections skip the model entirely; the tool result
    // is the whole answer.
    if let Some(picker) = selected_tool {
        if picker != PICKER_REASONING {
            if let Some(query) = latest_user_content(history) {
                match picker {
                    PICKER_WEB_SEARCH => {
                        direct_tool_turn(
                            tools,
                            "web_search",
                            serde_json::json!({ "query": query }),
                            format!("Searching the web on \"{}\"...\n\n", query),
                            tx,
                        )
                        .await;
                        return;
                    }
                    PICKER_DEEP_RESEARCH => {
                        direct_tool_turn(
                            tools,
                            "deep_research",
                            serde_json::json!({ "topic": query }),
                            format!("🔬 Conducting deep research on \"{}\"...\n\n", query),
                            tx,
                        )
                        .await;
                        return;
                    }
                    // Unrecognized pickers fall through to auto mode.
                    _ => {}
                }
            }
        }
    }

    let advertised: Vec<ToolDescriptor> = match selected_tool {
        Some(PICKER_REASONING) => Vec::new(),
        Some(PICKER_WEB_SEARCH) => tools
            .list_tools()
            .into_iter()
            .filter(|t| t.name == "web_search")
            .collect(),
        Some(PICKER_DEEP_RESEARCH) => tools
            .list_tools()
            .into_iter()
            .filter(|t| t.name == "deep_research")
            .collect(),
        _ => tools.list_tools(),
    };

    let mut stream = match connector.open(history, &advertised).await {
        Ok(stream) => stream,
        Err(e) => {
            emit(&tx, StreamEvent::Error { message: e.to_string() }).await;
            return;
        }
    };

    let mut accumulator = ToolCallAccumulator::new();

    while let Some(delta) = stream.next().await {
        match delta {
            UpstreamDelta::Text(text) => {
                if !emit(&tx, StreamEvent::Content { text }).await {
                    return;
                }
            }
            UpstreamDelta::ToolCall(delta) => {
                accumulator.apply(&delta);
            }
            UpstreamDelta::Finish(FinishReason::ToolCalls) => {
                run_tool_phase(tools, accumulator.into_fragments(), tx).await;
                return;
            }
            UpstreamDelta::Finish(_) => {
                emit(&tx, StreamEvent::Finished).await;
                return;
            }
            UpstreamDelta::Error(message) => {
                emit(&tx, StreamEvent::Error { message }).await;
                return;
            }
        }
    }

    // Upstream closed without a finish marker. The turn still terminates
    // cleanly from the client's point of view.
    emit(&tx, StreamEvent::Finished).await;
}

async fn direct_tool_turn<T: ToolInvoker>(
    tools: &T,
    name: &str,
    arguments: Value,
    status: String,
    tx: mpsc::Sender<StreamEvent>,
) {
    let status = StreamEvent::ToolStatus {
        name: name.to_string(),
        text: status,
    };
    if !emit(&tx, status).await {
        return;
    }
    let result = tools.invoke(name, &arguments).await;
    if !emit(&tx, StreamEvent::Content { text: result }).await {
        return;
    }
    emit(&tx, StreamEvent::Finished).await;
}

/// Invokes reassembled tool calls one at a time, in the order the model
/// introduced them. Results stream straight to the client; there is no
/// follow-up model round.
async fn run_tool_phase<T: ToolInvoker>(
    tools: &T,
    fragments: Vec<ToolCallFragment>,
    tx: mpsc::Sender<StreamEvent>,
) {
    for fragment in fragments {
        let arguments: Value = match serde_json::from_str(&fragment.arguments) {
            Ok(v) => v,
            Err(_) => {
                let text = format!(
                    "\n\nError parsing tool arguments for {}: {}",
                    fragment.name, fragment.arguments
                );
                if !emit(&tx, StreamEvent::Content { text }).await {
                    return;
                }
                continue;
            }
        };

        if let Some(status) = status_line(&fragment.name, &arguments) {
            let status = StreamEvent::ToolStatus {
                name: fragment.name.clone(),
                text: status,
            };
            if !emit(&tx, status).await {
                return;
            }
        }

        tracing::info!("[⚙️ ] Invoking tool '{}'", fragment.name);
        let result = tools.invoke(&fragment.name, &arguments).await;

        // Search results read better with a blank line after them.
        let text = if fragment.name == "web_search" || fragment.name == "deep_research" {
            format!("{}\n\n", result)
        } else {
            result
        };
        if !emit(&tx, StreamEvent::Content { text }).await {
            return;
        }
    }

    emit(&tx, StreamEvent::Finished).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::DeltaStream;
    use crate::types::{Result, ToolCallDelta};
    use std::sync::Mutex;

    /// Scripted connector: each `open` call hands out the next recorded
    /// delta sequence, or an error.
    struct FakeConnector {
        scripts: Mutex<Vec<Result<Vec<UpstreamDelta>>>>,
        opened_with: Mutex<Vec<Vec<String>>>,
    }

    impl FakeConnector {
        fn new(scripts: Vec<Result<Vec<UpstreamDelta>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts),
                opened_with: Mutex::new(Vec::new()),
            }
        }
    }

    impl UpstreamConnector for FakeConnector {
        async fn open(
            &self,
            _history: &[ChatMessage],
            tools: &[ToolDescriptor],
        ) -> Result<DeltaStream> {
            self.opened_with
                .lock()
                .unwrap()
                .push(tools.iter().map(|t| t.name.clone()).collect());
            let script = self.scripts.lock().unwrap().remove(0);
            script.map(|deltas| {
                Box::pin(futures_util::stream::iter(deltas)) as DeltaStream
            })
        }
    }

    struct FakeInvoker {
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeInvoker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ToolInvoker for FakeInvoker {
        fn list_tools(&self) -> Vec<ToolDescriptor> {
            ["web_search", "deep_research", "get_weather_by_city"]
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    description: String::new(),
                    input_schema: serde_json::json!({"type": "object"}),
                })
                .collect()
        }

        async fn invoke(&self, name: &str, arguments: &Value) -> String {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            format!("result of {}", name)
        }
    }

    async fn collect(
        connector: &FakeConnector,
        invoker: &FakeInvoker,
        history: &[ChatMessage],
        selected_tool: Option<&str>,
    ) -> Vec<StreamEvent> {
        let (tx, mut rx) = mpsc::channel(32);
        run_turn(connector, invoker, history, selected_tool, tx).await;
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        events
    }

    fn tool_call(index: u32, id: &str, name: &str, arguments: &str) -> UpstreamDelta {
        UpstreamDelta::ToolCall(ToolCallDelta {
            index,
            id: Some(id.into()),
            name: Some(name.into()),
            arguments: Some(arguments.into()),
        })
    }

    #[tokio::test]
    async fn plain_text_turn_ends_with_finished() {
        let connector = FakeConnector::new(vec![Ok(vec![
            UpstreamDelta::Text("Hello".into()),
            UpstreamDelta::Text(" world".into()),
            UpstreamDelta::Finish(FinishReason::Stop),
        ])]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("hi")];

        let events = collect(&connector, &invoker, &history, None).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Content { text: "Hello".into() },
                StreamEvent::Content { text: " world".into() },
                StreamEvent::Finished,
            ]
        );
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_turn_runs_status_result_finished() {
        let connector = FakeConnector::new(vec![Ok(vec![
            tool_call(0, "call_1", "get_weather_by_city", r#"{"city":"Paris"}"#),
            UpstreamDelta::Finish(FinishReason::ToolCalls),
        ])]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("weather in paris?")];

        let events = collect(&connector, &invoker, &history, None).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolStatus {
                    name: "get_weather_by_city".into(),
                    text: "\n\n🌤️ Getting weather forecast for Paris...\n\n".into()
                },
                StreamEvent::Content { text: "result of get_weather_by_city".into() },
                StreamEvent::Finished,
            ]
        );
        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "get_weather_by_city");
    }

    #[tokio::test]
    async fn upstream_http_error_becomes_single_error_event() {
        let connector = FakeConnector::new(vec![Err(crate::types::BeebotError::Upstream {
            status: 500,
            body: "boom".into(),
        }
        .into())]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("hi")];

        let events = collect(&connector, &invoker, &history, None).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "HTTP error! status: 500".into()
            }]
        );
    }

    #[tokio::test]
    async fn web_search_picker_bypasses_connector() {
        let connector = FakeConnector::new(vec![]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("rust 1.80 release notes")];

        let events = collect(&connector, &invoker, &history, Some("web-search")).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::ToolStatus {
                    name: "web_search".into(),
                    text: "Searching the web on \"rust 1.80 release notes\"...\n\n".into()
                },
                StreamEvent::Content { text: "result of web_search\n\n".into() },
                StreamEvent::Finished,
            ]
        );
        assert!(connector.opened_with.lock().unwrap().is_empty());
        let calls = invoker.calls.lock().unwrap();
        assert_eq!(
            calls[0].1,
            serde_json::json!({ "query": "rust 1.80 release notes" })
        );
    }

    #[tokio::test]
    async fn deep_research_picker_sends_topic() {
        let connector = FakeConnector::new(vec![]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("quantum error correction")];

        let events = collect(&connector, &invoker, &history, Some("deep-research")).await;
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls[0].0, "deep_research");
        assert_eq!(
            calls[0].1,
            serde_json::json!({ "topic": "quantum error correction" })
        );
    }

    #[tokio::test]
    async fn reasoning_picker_advertises_no_tools() {
        let connector = FakeConnector::new(vec![Ok(vec![
            UpstreamDelta::Text("thinking".into()),
            UpstreamDelta::Finish(FinishReason::Stop),
        ])]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("prove it")];

        let events = collect(&connector, &invoker, &history, Some("reasoning")).await;
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
        let opened = connector.opened_with.lock().unwrap();
        assert_eq!(opened.as_slice(), &[Vec::<String>::new()]);
    }

    #[tokio::test]
    async fn malformed_tool_arguments_skip_that_call_only() {
        let connector = FakeConnector::new(vec![Ok(vec![
            tool_call(0, "call_1", "web_search", "{not json"),
            tool_call(1, "call_2", "get_weather_by_city", r#"{"city":"Oslo"}"#),
            UpstreamDelta::Finish(FinishReason::ToolCalls),
        ])]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("hm")];

        let events = collect(&connector, &invoker, &history, None).await;
        assert_eq!(
            events[0],
            StreamEvent::Content {
                text: "\n\nError parsing tool arguments for web_search: {not json".into()
            }
        );
        assert_eq!(events.last(), Some(&StreamEvent::Finished));
        let calls = invoker.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "get_weather_by_city");
    }

    #[tokio::test]
    async fn tools_run_in_first_appearance_order() {
        let connector = FakeConnector::new(vec![Ok(vec![
            tool_call(1, "call_b", "get_weather_by_city", r#"{"city":"Lyon"}"#),
            tool_call(0, "call_a", "web_search", r#"{"query":"x"}"#),
            UpstreamDelta::Finish(FinishReason::ToolCalls),
        ])]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("both please")];

        collect(&connector, &invoker, &history, None).await;
        let calls = invoker.calls.lock().unwrap();
        let names: Vec<&str> = calls.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["get_weather_by_city", "web_search"]);
    }

    #[tokio::test]
    async fn dropped_receiver_stops_tool_invocation() {
        let connector = FakeConnector::new(vec![Ok(vec![
            tool_call(0, "call_1", "web_search", r#"{"query":"x"}"#),
            tool_call(1, "call_2", "deep_research", r#"{"query":"y"}"#),
            UpstreamDelta::Finish(FinishReason::ToolCalls),
        ])]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("go")];

        let (tx, rx) = mpsc::channel(32);
        drop(rx);
        run_turn(&connector, &invoker, &history, None, tx).await;
        // First status send fails, so no tool ever runs.
        assert!(invoker.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_ending_without_finish_still_terminates() {
        let connector = FakeConnector::new(vec![Ok(vec![UpstreamDelta::Text("partial".into())])]);
        let invoker = FakeInvoker::new();
        let history = vec![ChatMessage::user("hi")];

        let events = collect(&connector, &invoker, &history, None).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Content { text: "partial".into() },
                StreamEvent::Finished,
            ]
        );
    }
}
