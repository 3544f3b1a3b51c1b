/// DeepSeek-compatible chat completions API.
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Generation knobs for the chat completion request.
pub const MAX_COMPLETION_TOKENS: u32 = 2000;
pub const COMPLETION_TEMPERATURE: f32 = 0.7;

/// Ceiling for a single tool invocation. One slow backend must never hang
/// the user-visible stream longer than this.
pub const TOOL_CALL_TIMEOUT_SECS: u64 = 45;

/// Per-line cap when decoding the upstream SSE byte stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Hard cap on upstream lines per stream, against runaway providers.
pub const MAX_STREAM_LINES: usize = 100_000;

/// Bounded event channel between the orchestrator and the SSE body. Small
/// on purpose: a slow client backpressures tool execution.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the connector's delta channel.
pub const DELTA_CHANNEL_CAPACITY: usize = 64;

/// Delay before the consumer re-fetches durable history after `finished`.
pub const RECONCILE_DEBOUNCE_MS: u64 = 100;

/// Auth is out of scope; every conversation belongs to this user.
pub const DEMO_USER_ID: &str = "demo-user";

/// Local terminal bubble synthesized when the user aborts mid-stream.
pub const STOPPED_BY_USER: &str = "Response stopped by user.";

pub const TITLE_SYSTEM_PROMPT: &str = "You are a helpful assistant that creates short, descriptive titles for conversations. Generate a brief title (max 6 words) that captures the essence of the user's message. Return only the title, no extra text.";
pub const TITLE_MAX_TOKENS: u32 = 20;
pub const TITLE_FALLBACK_WORDS: usize = 6;

/// Conversations untouched for this long are purged at startup.
pub const DB_CLEANUP_RETENTION_DAYS: i64 = 90;
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
    "PRAGMA foreign_keys = ON",
];

pub const JINA_READER_URL: &str = "https://r.jina.ai";
pub const JINA_SEARCH_URL: &str = "https://s.jina.ai";
