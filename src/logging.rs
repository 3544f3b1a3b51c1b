use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const TURN_ID_HEADER: &str = "x-beebot-turn-id";

/// Global panic hook that routes panics through tracing before the
/// default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with a turn id and wraps its handling in a span.
pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    if let Ok(val) = turn_id.parse() {
        req.headers_mut().insert(TURN_ID_HEADER, val);
    }

    let span = info_span!("request", turn_id = %turn_id);
    next.run(req).instrument(span).await
}

/// Per-turn counters, logged once when the stream terminates.
#[derive(Default)]
pub struct StreamMetric {
    pub events: usize,
    pub text_chars: usize,
    pub tool_names: Vec<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, event: &crate::types::StreamEvent) {
        use crate::types::StreamEvent;
        self.events += 1;
        match event {
            StreamEvent::Content { text } => self.text_chars += text.len(),
            StreamEvent::ToolStatus { name, text } => {
                self.tool_names.push(name.clone());
                self.text_chars += text.len();
            }
            StreamEvent::Finished | StreamEvent::Error { .. } => {}
        }
    }

    pub fn log_summary(&self, conversation_id: &str) {
        let tools_str = if self.tool_names.is_empty() {
            "none".to_string()
        } else {
            self.tool_names.join(", ")
        };
        info!(
            target: "flight_recorder",
            "[STREAM END] Conversation: {} | Events: {} | Tools: {} | Text: {} chars",
            conversation_id, self.events, tools_str, self.text_chars
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamEvent;

    #[test]
    fn metric_counts_tool_statuses_by_name() {
        let mut metric = StreamMetric::new();
        metric.record_event(&StreamEvent::ToolStatus {
            name: "get_weather_by_city".into(),
            text: "\n\nGetting weather...\n\n".into(),
        });
        metric.record_event(&StreamEvent::Content { text: "sunny".into() });
        metric.record_event(&StreamEvent::Finished);

        assert_eq!(metric.events, 3);
        assert_eq!(metric.tool_names, vec!["get_weather_by_city".to_string()]);
        assert_eq!(
            metric.text_chars,
            "\n\nGetting weather...\n\n".len() + "sunny".len()
        );
    }
}
