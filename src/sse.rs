//! SSE framing. Every event leaves the server as `data: <json>\n\n` with a
//! single-key JSON object; no event names, ids, or comment lines. The
//! client's frame decoder in [`crate::consumer`] parses exactly this shape.

use crate::types::StreamEvent;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// Encodes one event as a complete wire frame.
pub fn frame(event: &StreamEvent) -> Bytes {
    Bytes::from(format!("data: {}\n\n", event.encode()))
}

/// Builds the streaming response around a frame channel. The body ends
/// when the sender side is dropped.
pub fn response(rx: tokio::sync::mpsc::Receiver<Bytes>) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        // Tells nginx-style proxies not to buffer the stream.
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
