#![allow(clippy::manual_unwrap_or_default)]
#![allow(clippy::manual_unwrap_or)]

use beebot::connector::DeepSeekConnector;
use beebot::logging::setup_panic_hook;
use beebot::registry::{JinaBackend, StdioServerConfig, ToolRegistry};
use beebot::server::{router, AppState, Args};
use beebot::storage::Storage;

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

fn stdio_config(label: &str, command_line: &str) -> Option<StdioServerConfig> {
    let mut parts = command_line.split_whitespace().map(str::to_string);
    let command = parts.next()?;
    Some(StdioServerConfig {
        label: label.to_string(),
        command,
        args: parts.collect(),
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "beebot=debug".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "beebot.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_error::ErrorLayer::default())
        .init();

    setup_panic_hook();

    let args = Args::parse();

    let api_key = match std::env::var("DEEPSEEK_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => {
            tracing::error!("DEEPSEEK_API_KEY is not set");
            std::process::exit(1);
        }
    };
    let jina_key = std::env::var("JINA_API_KEY").ok().filter(|k| !k.is_empty());

    let storage = match Storage::init(&args.database).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(args.request_timeout_secs))
        .connect_timeout(Duration::from_secs(args.connect_timeout_secs))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let mut stdio_configs = Vec::new();
    if let Some(cmd) = args
        .weather_server
        .as_deref()
        .and_then(|c| stdio_config("weather", c))
    {
        stdio_configs.push(cmd);
    }
    if let Some(cmd) = args
        .search_server
        .as_deref()
        .and_then(|c| stdio_config("search", c))
    {
        stdio_configs.push(cmd);
    }

    let jina = JinaBackend::new(client.clone(), jina_key);
    let registry = Arc::new(ToolRegistry::start(&stdio_configs, Some(jina)).await);

    let mut connector = DeepSeekConnector::new(client, api_key);
    if let Some(base_url) = args.api_base_url.as_deref() {
        connector = connector.with_base_url(base_url);
    }
    if let Some(model) = args.model.as_deref() {
        connector = connector.with_model(model);
    }

    let state = Arc::new(AppState {
        connector,
        registry: registry.clone(),
        storage,
        args: Arc::new(args),
    });

    let app = router(state.clone());

    let addr = format!("{}:{}", state.args.host, state.args.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    tracing::info!("Beebot listening on {}", addr);
    let serve = axum::serve(listener, app);
    tokio::select! {
        result = serve => {
            if let Err(e) = result {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }
    registry.shutdown().await;
}
