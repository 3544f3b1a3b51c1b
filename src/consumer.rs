//! Client-side stream consumption: byte-level frame decoding, event
//! accumulation, and the per-conversation session state machine with its
//! busy guard, stop semantics, and debounced reconciliation.

use crate::constants::{RECONCILE_DEBOUNCE_MS, STOPPED_BY_USER};
use crate::types::StreamEvent;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reassembles frames from arbitrary network chunk boundaries. Bytes are
/// buffered until a newline lands; the trailing partial line is retained
/// for the next feed, so chunking never changes the decoded events.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let line_end = start + pos;
            let line = &self.buf[start..line_end];
            start = line_end + 1;

            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            let Some(payload) = line.strip_prefix("data: ") else {
                continue;
            };
            if let Some(event) = StreamEvent::decode(payload.trim()) {
                events.push(event);
            }
        }
        self.buf.drain(..start);
        events
    }
}

/// How a consumed turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Finished,
    Errored(String),
    Stopped,
}

/// Accumulates one turn's events into display text plus an outcome.
/// Anything arriving after the terminal event is discarded.
#[derive(Debug, Default)]
pub struct StreamConsumer {
    text: String,
    outcome: Option<TurnOutcome>,
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: StreamEvent) {
        if self.outcome.is_some() {
            tracing::debug!("Discarding event after terminal: {:?}", event);
            return;
        }
        match event {
            StreamEvent::Content { text } | StreamEvent::ToolStatus { text, .. } => {
                self.text.push_str(&text);
            }
            StreamEvent::Finished => self.outcome = Some(TurnOutcome::Finished),
            StreamEvent::Error { message } => self.outcome = Some(TurnOutcome::Errored(message)),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn outcome(&self) -> Option<&TurnOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

struct ActiveTurn {
    generation: u64,
    consumer: StreamConsumer,
    cancel: CancellationToken,
}

/// One conversation's sending side. At most one turn is in flight; events
/// are tagged with a generation so a turn that was stopped or superseded
/// can never write into its successor.
#[derive(Default)]
pub struct ChatSession {
    generation: u64,
    turn: Option<ActiveTurn>,
}

impl ChatSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.turn
            .as_ref()
            .map(|t| !t.consumer.is_terminal())
            .unwrap_or(false)
    }

    /// Starts a turn. Returns the generation tag and a cancellation token
    /// for the transport, or `None` while a turn is still streaming.
    pub fn begin(&mut self) -> Option<(u64, CancellationToken)> {
        if self.is_busy() {
            tracing::warn!("Rejecting send: a response is already streaming");
            return None;
        }
        self.generation += 1;
        let cancel = CancellationToken::new();
        self.turn = Some(ActiveTurn {
            generation: self.generation,
            consumer: StreamConsumer::new(),
            cancel: cancel.clone(),
        });
        Some((self.generation, cancel))
    }

    /// Feeds events from the transport. Events tagged with a stale
    /// generation are dropped wholesale.
    pub fn feed(&mut self, generation: u64, events: Vec<StreamEvent>) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.generation != generation {
            tracing::debug!(
                "Dropping {} event(s) from stale generation {}",
                events.len(),
                generation
            );
            return;
        }
        for event in events {
            turn.consumer.apply(event);
        }
    }

    /// User-initiated stop. Idempotent: a second call, or a call after the
    /// turn already terminated, does nothing. A stop mid-stream appends a
    /// visible marker only when partial text exists.
    pub fn stop(&mut self) {
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        if turn.consumer.is_terminal() {
            return;
        }
        turn.cancel.cancel();
        if !turn.consumer.text.is_empty() {
            turn.consumer.text.push_str(STOPPED_BY_USER);
        }
        turn.consumer.outcome = Some(TurnOutcome::Stopped);
    }

    /// The in-flight or just-finished assistant text.
    pub fn current_text(&self) -> &str {
        self.turn.as_ref().map(|t| t.consumer.text()).unwrap_or("")
    }

    pub fn current_outcome(&self) -> Option<&TurnOutcome> {
        self.turn.as_ref().and_then(|t| t.consumer.outcome())
    }
}

/// Debounced follow-up fetch: after a turn terminates the canonical
/// transcript is re-read from the server, but several triggers close
/// together collapse into one fetch.
pub struct Reconciler {
    pending: Option<tokio::task::JoinHandle<()>>,
    delay: Duration,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            pending: None,
            delay: Duration::from_millis(RECONCILE_DEBOUNCE_MS),
        }
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_delay(delay: Duration) -> Self {
        Self {
            pending: None,
            delay,
        }
    }

    /// Schedules `fetch` to run after the debounce window; a newer call
    /// cancels the older one.
    pub fn schedule<F, Fut>(&mut self, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fetch().await;
        }));
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}
