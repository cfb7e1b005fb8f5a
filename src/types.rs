use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

macro_rules! string_id {
    ($name:ident, $short:expr) => {
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Log-friendly prefix of the identifier.
            pub fn short(&self) -> &str {
                prefix_chars(&self.0, $short)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(ConversationId, 8);
string_id!(MessageId, 8);
string_id!(FileId, 8);
string_id!(UserId, 12);

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an uploaded file. Content lives in file storage, never here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub file_id: FileId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
}

impl AttachmentRef {
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.file_id.as_str().trim().is_empty() {
            return Err(ChatError::Validation(format!(
                "Attachment {} is missing a fileId",
                index
            ))
            .into());
        }
        if self.file_name.trim().is_empty() {
            return Err(ChatError::Validation(format!(
                "Attachment {} is missing a fileName",
                index
            ))
            .into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub owner: UserId,
    pub created_at: i64,
    pub latest_message_text: Option<String>,
    pub latest_message_time: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub owner: UserId,
    pub role: Role,
    pub content: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl Message {
    /// Placeholder rows belong to an in-flight stream.
    pub fn is_placeholder(&self) -> bool {
        self.is_complete == Some(false)
    }
}

/// Input to [`ConversationStore::append_message`](crate::store::ConversationStore::append_message).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub owner: UserId,
    pub role: Role,
    pub content: String,
    pub is_complete: Option<bool>,
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub owner: UserId,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub storage_id: String,
    pub uploaded_at: i64,
    pub is_processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
}

/// One turn handed to the model provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Unauthorized: {0}")]
    Auth(String),

    #[error("{0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream overloaded: {0}")]
    UpstreamOverloaded(String),

    #[error("Upstream transport error: {0}")]
    UpstreamTransport(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl ChatError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ChatError::Internal(msg.into(), SpanTrace::capture())
    }

    /// Whether a client may retry the whole request after seeing this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::UpstreamOverloaded(_)
                | ChatError::UpstreamTransport(_)
                | ChatError::Network(_)
                | ChatError::Io(_)
        )
    }

    fn status_and_code(&self) -> (axum::http::StatusCode, &'static str) {
        use axum::http::StatusCode;
        match self {
            ChatError::Auth(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ChatError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            ChatError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ChatError::UpstreamOverloaded(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_OVERLOADED")
            }
            ChatError::UpstreamTransport(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_TRANSPORT"),
            ChatError::Upstream(s, _) => (*s, "UPSTREAM_ERROR"),
            ChatError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            ChatError::Persistence(_) => (StatusCode::INTERNAL_SERVER_ERROR, "PERSISTENCE_ERROR"),
            ChatError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR")
            }
            ChatError::Network(_) => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
            ChatError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            ChatError::Internal(_, _) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChatError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChatError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.inner.status_and_code();
        if status.is_server_error() {
            tracing::error!(
                code,
                "Request failed: {}\n\nSpan Trace:\n{}",
                self.inner,
                self.span_trace
            );
        } else {
            tracing::debug!(code, "Request rejected: {}", self.inner);
        }
        let msg = match &self.inner {
            ChatError::Validation(m) | ChatError::Auth(m) | ChatError::NotFound(m) => m.clone(),
            other => other.to_string(),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
