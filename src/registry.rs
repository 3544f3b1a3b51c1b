//! Tool registry and invoker. Tools live behind two kinds of backend: a
//! line-delimited JSON-RPC subprocess (stdio) and the Jina reader/search
//! HTTP endpoints. The registry owns the backends, routes calls by tool
//! name, and never lets a failure escape as anything but a result string.

use crate::constants::{JINA_READER_URL, JINA_SEARCH_URL, TOOL_CALL_TIMEOUT_SECS};
use crate::str_utils::prefix_chars;
use crate::types::{BeebotError, Result, ToolDescriptor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

/// Seam between the orchestrator and tool execution. `invoke` is
/// intentionally infallible: whatever goes wrong becomes the tool's
/// result text so the model turn can still complete.
pub trait ToolInvoker: Send + Sync {
    fn list_tools(&self) -> Vec<ToolDescriptor>;
    fn invoke(
        &self,
        name: &str,
        arguments: &Value,
    ) -> impl std::future::Future<Output = String> + Send;
}

/// --- STDIO BACKEND ---

#[derive(Debug, Clone)]
pub struct StdioServerConfig {
    pub label: String,
    pub command: String,
    pub args: Vec<String>,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<std::result::Result<Value, String>>>>>;

/// One subprocess speaking line-delimited JSON-RPC 2.0 over stdin/stdout.
/// Requests are correlated by id through a pending map; the reader task
/// resolves them as responses arrive and drains the map on EOF.
pub struct StdioToolServer {
    label: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
}

impl StdioToolServer {
    pub async fn spawn(config: &StdioServerConfig) -> Result<Self> {
        tracing::info!(
            "[🔧] Starting tool server '{}': {} {}",
            config.label,
            config.command,
            config.args.join(" ")
        );
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            BeebotError::Internal(
                format!("Tool server '{}' has no stdin", config.label),
                tracing_error::SpanTrace::capture(),
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BeebotError::Internal(
                format!("Tool server '{}' has no stdout", config.label),
                tracing_error::SpanTrace::capture(),
            )
        })?;
        let stderr = child.stderr.take();

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let reader_pending = pending.clone();
        let reader_label = config.label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        Self::dispatch_line(&reader_label, &line, &reader_pending).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[🔧 {}] stdout read error: {}", reader_label, e);
                        break;
                    }
                }
            }
            // EOF: every caller still waiting gets told the server is gone.
            let mut map = reader_pending.lock().await;
            for (_, waiter) in map.drain() {
                let _ = waiter.send(Err("tool server closed".to_string()));
            }
            tracing::warn!("[🔧 {}] stdout closed", reader_label);
        });

        if let Some(stderr) = stderr {
            let stderr_label = config.label.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[🔧 {} stderr] {}", stderr_label, line);
                }
            });
        }

        // No handshake. The backend contract is tools/list and tools/call
        // only; some servers reject anything else with "Unknown method".
        Ok(Self {
            label: config.label.clone(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
        })
    }

    async fn dispatch_line(label: &str, line: &str, pending: &PendingMap) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                tracing::debug!("[🔧 {}] non-JSON line: {}", label, prefix_chars(line, 200));
                return;
            }
        };
        let id = match value.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => return,
        };
        let waiter = pending.lock().await.remove(&id);
        let Some(waiter) = waiter else {
            tracing::debug!("[🔧 {}] response for unknown id {}", label, id);
            return;
        };
        let outcome = if let Some(err) = value.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(message)
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = waiter.send(outcome);
    }

    /// Sends one request and waits for its correlated response. On timeout
    /// the pending entry is removed so a late reply is dropped silently.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> std::result::Result<Value, String> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = payload.to_string();
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&id);
                return Err(format!("write failed: {}", e));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.lock().await.remove(&id);
                return Err(format!("flush failed: {}", e));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                Err("tool server closed".to_string())
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(format!("timed out after {:?}", timeout))
            }
        }
    }

    pub async fn list_tools(&self) -> std::result::Result<Vec<ToolDescriptor>, String> {
        let result = self
            .request("tools/list", json!({}), Duration::from_secs(10))
            .await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut out = Vec::with_capacity(tools.len());
        for tool in tools {
            match serde_json::from_value::<ToolDescriptor>(tool) {
                Ok(descriptor) => out.push(descriptor),
                Err(e) => tracing::warn!("[🔧 {}] bad tool descriptor: {}", self.label, e),
            }
        }
        Ok(out)
    }

    pub async fn call(
        &self,
        name: &str,
        arguments: &Value,
        timeout: Duration,
    ) -> std::result::Result<String, String> {
        let params = json!({ "name": name, "arguments": arguments });
        let result = self.request("tools/call", params, timeout).await?;
        Ok(render_tool_result(&result))
    }

    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::warn!("[🔧 {}] kill failed: {}", self.label, e);
        }
    }
}

/// Flattens a tools/call result into display text. The content array's
/// text items are joined; anything else falls back to raw JSON.
fn render_tool_result(result: &Value) -> String {
    if let Some(items) = result.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = items
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    if let Some(text) = result.as_str() {
        return text.to_string();
    }
    result.to_string()
}

/// --- JINA HTTP BACKEND ---

/// Reader and search endpoints exposed as tools. No subprocess; each call
/// is a single HTTP request.
pub struct JinaBackend {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl JinaBackend {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }

    pub fn descriptors() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: "read_url".into(),
                description: "Fetch a web page and return its content as clean markdown".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "The URL to read" }
                    },
                    "required": ["url"]
                }),
            },
            ToolDescriptor {
                name: "capture_screenshot_url".into(),
                description: "Capture a screenshot of a web page and return its URL".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "The URL to screenshot" }
                    },
                    "required": ["url"]
                }),
            },
            ToolDescriptor {
                name: "search_web_jina".into(),
                description: "Search the web and return top results with content".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "The search query" }
                    },
                    "required": ["query"]
                }),
            },
            ToolDescriptor {
                name: "search_arxiv".into(),
                description: "Search arxiv.org for academic papers".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "The paper search query" }
                    },
                    "required": ["query"]
                }),
            },
        ]
    }

    async fn get(&self, url: String, extra_header: Option<(&str, &str)>) -> std::result::Result<String, String> {
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some((name, value)) = extra_header {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP error! status: {}", status.as_u16()));
        }
        response.text().await.map_err(|e| e.to_string())
    }

    fn string_arg<'a>(arguments: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
        arguments
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| format!("missing required argument '{}'", key))
    }

    pub async fn call(&self, name: &str, arguments: &Value) -> std::result::Result<String, String> {
        match name {
            "read_url" => {
                let url = Self::string_arg(arguments, "url")?;
                self.get(format!("{}/{}", JINA_READER_URL, url), None).await
            }
            "capture_screenshot_url" => {
                let url = Self::string_arg(arguments, "url")?;
                self.get(
                    format!("{}/{}", JINA_READER_URL, url),
                    Some(("X-Return-Format", "screenshot")),
                )
                .await
            }
            "search_web_jina" => {
                let query = Self::string_arg(arguments, "query")?;
                self.get(format!("{}/{}", JINA_SEARCH_URL, query), None).await
            }
            "search_arxiv" => {
                let query = Self::string_arg(arguments, "query")?;
                self.get(
                    format!("{}/{}", JINA_SEARCH_URL, query),
                    Some(("X-Site", "arxiv.org")),
                )
                .await
            }
            other => Err(format!("unknown jina tool '{}'", other)),
        }
    }
}

/// --- REGISTRY ---

enum BackendRef {
    Stdio(usize),
    Jina,
}

/// Owns every backend and the merged tool list. Routing is by tool name;
/// on a name collision the first backend to register wins.
pub struct ToolRegistry {
    stdio: Vec<Arc<StdioToolServer>>,
    jina: Option<JinaBackend>,
    routes: HashMap<String, BackendRef>,
    tools: Vec<ToolDescriptor>,
    call_timeout: Duration,
}

impl ToolRegistry {
    /// Spawns the configured subprocess servers, queries their tool lists,
    /// and merges in the Jina tools. A server that fails to start is
    /// logged and skipped so the chat surface stays up without it.
    pub async fn start(
        configs: &[StdioServerConfig],
        jina: Option<JinaBackend>,
    ) -> Self {
        let mut registry = Self {
            stdio: Vec::new(),
            jina,
            routes: HashMap::new(),
            tools: Vec::new(),
            call_timeout: Duration::from_secs(TOOL_CALL_TIMEOUT_SECS),
        };

        for config in configs {
            match StdioToolServer::spawn(config).await {
                Ok(server) => registry.stdio.push(Arc::new(server)),
                Err(e) => {
                    tracing::error!("[🔧] Tool server '{}' failed to start: {}", config.label, e);
                }
            }
        }
        registry.refresh_tools().await;
        registry
    }

    pub async fn refresh_tools(&mut self) {
        self.routes.clear();
        self.tools.clear();

        for (idx, server) in self.stdio.iter().enumerate() {
            match server.list_tools().await {
                Ok(tools) => {
                    for tool in tools {
                        if self.routes.contains_key(&tool.name) {
                            tracing::warn!("[🔧] Duplicate tool '{}' ignored", tool.name);
                            continue;
                        }
                        self.routes.insert(tool.name.clone(), BackendRef::Stdio(idx));
                        self.tools.push(tool);
                    }
                }
                Err(e) => {
                    tracing::error!("[🔧 {}] tools/list failed: {}", server.label, e);
                }
            }
        }

        if self.jina.is_some() {
            for tool in JinaBackend::descriptors() {
                if self.routes.contains_key(&tool.name) {
                    continue;
                }
                self.routes.insert(tool.name.clone(), BackendRef::Jina);
                self.tools.push(tool);
            }
        }

        tracing::info!(
            "[🔧] Registry ready with {} tools: {}",
            self.tools.len(),
            self.tools
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    pub async fn shutdown(&self) {
        for server in &self.stdio {
            server.shutdown().await;
        }
    }
}

impl ToolInvoker for ToolRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.clone()
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> String {
        let backend = match self.routes.get(name) {
            Some(backend) => backend,
            None => return format!("Unknown tool: {}", name),
        };
        tracing::info!("[🔧] Calling tool '{}'", name);

        let outcome = match backend {
            BackendRef::Stdio(idx) => {
                self.stdio[*idx].call(name, arguments, self.call_timeout).await
            }
            BackendRef::Jina => {
                let jina = match &self.jina {
                    Some(jina) => jina,
                    None => return format!("Unknown tool: {}", name),
                };
                match tokio::time::timeout(self.call_timeout, jina.call(name, arguments)).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("timed out after {:?}", self.call_timeout)),
                }
            }
        };

        match outcome {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("[🔧] Tool '{}' failed: {}", name, e);
                format!("Error calling tool {}: {}", name, e)
            }
        }
    }
}
