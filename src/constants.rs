use std::time::Duration;

/// SSE wire format
pub const SSE_DATA_PREFIX: &str = "data: ";
pub const SSE_FRAME_DELIMITER: &str = "\n\n";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";

/// Response headers for the event stream
pub const SSE_HEADERS: &[(&str, &str)] = &[
    ("content-type", "text/event-stream"),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
    ("x-accel-buffering", "no"),
];

/// Client retry defaults
pub const CLIENT_MAX_RETRIES: u32 = 3;
pub const CLIENT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const OVERLOADED_MARKER: &str = "overloaded";
pub const CLIENT_APOLOGY: &str =
    "Sorry, I encountered an error while processing your message. Please try again in a moment.";

/// Context assembly
pub const SYNTHETIC_USER_TURN: &str = "Hello";
pub const UNPROCESSED_FILE_PLACEHOLDER: &str = "[File content not yet processed]";
pub const DEFAULT_MAX_HISTORY_MESSAGES: usize = 2048;

pub const WELCOME_MESSAGE: &str =
    "Hello! I'm Intellecta, your AI assistant. How can I help you today?";

pub const SYSTEM_MESSAGE: &str = r#"
You are Intellecta, a friendly and knowledgeable AI assistant. Your goal is to provide accurate, helpful, and concise responses.

- Always be polite, respectful, and engaging.
- If you don't know the answer, say so clearly rather than making up information.
- Keep your responses to the point, but don't be so brief that they're unhelpful.
- When asked for opinions, present a balanced view or state that you are an AI and do not have personal opinions.
- If the user's query is ambiguous, ask for clarification.
- **When providing code, always wrap it in a markdown code block with the appropriate language identifier (e.g., ```python). This is crucial for proper rendering.**
- For non-code responses that require structure (like lists or steps), use markdown lists to ensure readability.
- Add comments to the code you provide to help the user understand it better.
"#;

/// Anthropic Messages API
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";
pub const OVERLOADED_STATUS: u16 = 529;

/// Upper bound on lines read from one upstream stream
pub const MAX_UPSTREAM_LINES: usize = 100_000;
pub const MAX_UPSTREAM_LINE_BYTES: usize = 1024 * 1024;
pub const MODEL_EVENT_BUFFER: usize = 32;

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
