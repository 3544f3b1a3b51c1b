//! HTTP surface: conversation CRUD, the two chat endpoints, and health
//! probes. The stream handler owns the plumbing between the turn engine
//! and the SSE body, and persists the assistant's text once the turn
//! terminates.

use crate::connector::DeepSeekConnector;
use crate::constants::{DEMO_USER_ID, EVENT_CHANNEL_CAPACITY, TITLE_FALLBACK_WORDS};
use crate::logging::StreamMetric;
use crate::orchestrator::run_turn;
use crate::registry::ToolRegistry;
use crate::storage::Storage;
use crate::str_utils::first_words;
use crate::types::{BeebotError, ChatMessage, Result, Role, StreamEvent};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 3000)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "beebot.db")]
    pub database: String,
    /// Command line for the stdio weather tool server, e.g. "python weather.py".
    #[arg(long)]
    pub weather_server: Option<String>,
    /// Command line for the stdio search tool server.
    #[arg(long)]
    pub search_server: Option<String>,
    /// Override the upstream model name.
    #[arg(long)]
    pub model: Option<String>,
    /// Override the upstream chat completions base URL.
    #[arg(long)]
    pub api_base_url: Option<String>,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
}

#[derive(Clone)]
pub struct AppState {
    pub connector: DeepSeekConnector,
    pub registry: Arc<ToolRegistry>,
    pub storage: Storage,
    pub args: Arc<Args>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations", post(create_conversation))
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id", delete(delete_conversation))
        .route("/api/chat/new", post(chat_new))
        .route("/api/chat/:conversation_id", post(chat_stream))
        .route("/health", get(liveness))
        .route("/readyz", get(readiness))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(crate::logging::turn_id_middleware))
        .with_state(state)
}

/// --- CONVERSATION CRUD ---

async fn list_conversations(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let conversations = state.storage.list_conversations(DEMO_USER_ID).await?;
    Ok(Json(conversations))
}

#[derive(Deserialize)]
struct CreateConversationRequest {
    title: String,
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse> {
    if payload.title.trim().is_empty() {
        return Err(BeebotError::InvalidRequest("title must not be empty".into()).into());
    }
    let conversation = state
        .storage
        .create_conversation(DEMO_USER_ID, payload.title.trim())
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

#[derive(Serialize)]
struct ConversationDetail {
    conversation: crate::storage::ConversationRecord,
    messages: Vec<crate::storage::MessageRecord>,
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let conversation = state
        .storage
        .get_conversation(&id)
        .await?
        .ok_or_else(|| BeebotError::NotFound("Conversation not found".into()))?;
    let messages = state.storage.messages_by_conversation(&id).await?;
    Ok(Json(ConversationDetail {
        conversation,
        messages,
    }))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let deleted = state.storage.delete_conversation(&id).await?;
    if !deleted {
        return Err(BeebotError::NotFound("Conversation not found".into()).into());
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

/// --- CHAT ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewChatRequest {
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewChatResponse {
    conversation_id: String,
}

/// Creates a conversation with a provisional title, saves the first user
/// message, and returns the id right away. The real title is generated in
/// the background so the first turn never waits on the model.
async fn chat_new(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewChatRequest>,
) -> Result<impl IntoResponse> {
    let message = payload.message.trim();
    if message.is_empty() {
        return Err(BeebotError::InvalidRequest("message must not be empty".into()).into());
    }

    let provisional = first_words(message, TITLE_FALLBACK_WORDS);
    let conversation = state
        .storage
        .create_conversation(DEMO_USER_ID, &provisional)
        .await?;
    state
        .storage
        .create_message(&conversation.id, Role::User, message, None)
        .await?;

    let connector = state.connector.clone();
    let storage = state.storage.clone();
    let conversation_id = conversation.id.clone();
    let message = message.to_string();
    tokio::spawn(async move {
        let title = connector.generate_title(&message).await;
        if let Err(e) = storage
            .update_conversation_title(&conversation_id, &title)
            .await
        {
            tracing::warn!("Failed to store generated title: {}", e);
        }
    });

    Ok((
        StatusCode::CREATED,
        Json(NewChatResponse {
            conversation_id: conversation.id,
        }),
    ))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ChatStreamRequest {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    skip_save_message: bool,
    #[serde(default)]
    selected_tool: Option<String>,
}

/// Streams one assistant turn over SSE. The turn engine writes into an
/// event channel; a bridge task frames events into the body, accumulates
/// the assistant text, and persists it when the turn terminates. A client
/// disconnect drops the body, which fails the next bridge send, which
/// drops the event receiver, which stops the engine.
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(payload): Json<ChatStreamRequest>,
) -> Result<Response> {
    state
        .storage
        .get_conversation(&conversation_id)
        .await?
        .ok_or_else(|| BeebotError::NotFound("Conversation not found".into()))?;

    if let Some(message) = payload.message.as_deref().map(str::trim) {
        if !message.is_empty() && !payload.skip_save_message {
            state
                .storage
                .create_message(&conversation_id, Role::User, message, None)
                .await?;
        }
    }

    let records = state
        .storage
        .messages_by_conversation(&conversation_id)
        .await?;
    let history: Vec<ChatMessage> = records.iter().map(|r| r.to_chat_message()).collect();
    if history.is_empty() {
        return Err(BeebotError::InvalidRequest(
            "Conversation has no messages to respond to".into(),
        )
        .into());
    }

    let (event_tx, mut event_rx) = mpsc::channel::<StreamEvent>(EVENT_CHANNEL_CAPACITY);
    let (frame_tx, frame_rx) = mpsc::channel::<bytes::Bytes>(EVENT_CHANNEL_CAPACITY);

    let connector = state.connector.clone();
    let registry = state.registry.clone();
    let selected_tool = payload.selected_tool.clone();
    tokio::spawn(async move {
        run_turn(
            &connector,
            registry.as_ref(),
            &history,
            selected_tool.as_deref(),
            event_tx,
        )
        .await;
    });

    let storage = state.storage.clone();
    tokio::spawn(async move {
        let mut accumulated = String::new();
        let mut metric = StreamMetric::new();
        let mut terminated = false;

        while let Some(event) = event_rx.recv().await {
            metric.record_event(&event);
            if let StreamEvent::Content { text } | StreamEvent::ToolStatus { text, .. } = &event {
                accumulated.push_str(text);
            }
            let is_terminal = event.is_terminal();
            if frame_tx.send(crate::sse::frame(&event)).await.is_err() {
                tracing::debug!("Client disconnected mid-stream");
                break;
            }
            if is_terminal {
                terminated = true;
                break;
            }
        }

        // Partial text with no terminal means the client hung up; the
        // transcript keeps only completed turns.
        if terminated && !accumulated.is_empty() {
            if let Err(e) = storage
                .create_message(&conversation_id, Role::Assistant, &accumulated, None)
                .await
            {
                tracing::error!("Failed to persist assistant message: {}", e);
            }
        }
        metric.log_summary(&conversation_id);
    });

    Ok(crate::sse::response(frame_rx))
}

/// --- HEALTH ---

#[derive(Serialize)]
struct LivenessResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: String,
    database: String,
    tools: usize,
}

async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    use crate::registry::ToolInvoker;

    let db_ok = match state.storage.message_count("readiness-probe").await {
        Ok(_) => true,
        Err(e) => {
            tracing::error!("Readiness check: DB error: {}", e);
            false
        }
    };
    let tools = state.registry.list_tools().len();

    let status_code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status_code,
        Json(ReadinessResponse {
            status: if db_ok { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
            tools,
        }),
    )
}
