//! Consumer side of `/chat/stream`: submits a turn, decodes the SSE feed into a
//! local transcript and retries the whole request on transient failures.

use crate::constants::CLIENT_APOLOGY;
use crate::retry::{is_overloaded_signal, RetryPolicy};
use crate::sse::{SseDecoder, StreamFrame};
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub conversation_id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

pub enum TransportResponse {
    Stream(ByteStream),
    /// Non-2xx answer before any frame was sent.
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn open(&self, request: &ChatRequest) -> Result<TransportResponse>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, request: &ChatRequest) -> Result<TransportResponse> {
        let url = format!("{}/chat/stream", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            return Ok(TransportResponse::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ObservedError::from));
        Ok(TransportResponse::Stream(Box::pin(stream)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
}

/// Local view of the conversation. Holds at most one assistant entry per
/// submission; retries reuse it.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    assistant_index: Option<usize>,
    loading: bool,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    fn start_turn(&mut self, text: &str) {
        self.entries.push(TranscriptEntry {
            role: Role::User,
            content: text.to_string(),
        });
        self.assistant_index = None;
        self.loading = true;
    }

    /// Empty assistant entry for the reply, or the existing one cleared.
    fn begin_assistant(&mut self) {
        match self.assistant_index.and_then(|i| self.entries.get_mut(i)) {
            Some(entry) => entry.content.clear(),
            None => {
                self.entries.push(TranscriptEntry {
                    role: Role::Assistant,
                    content: String::new(),
                });
                self.assistant_index = Some(self.entries.len() - 1);
            }
        }
    }

    fn set_assistant_text(&mut self, text: &str) {
        if let Some(entry) = self.assistant_index.and_then(|i| self.entries.get_mut(i)) {
            entry.content = text.to_string();
        }
    }

    /// Overwrites the assistant entry, creating it if no reply was started.
    fn show_error(&mut self, message: &str) {
        self.begin_assistant();
        self.set_assistant_text(message);
    }

    fn finish(&mut self) {
        self.loading = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Completed { text: String },
    /// Non-retryable failure, shown as `Error: <message>`.
    Failed { message: String },
    /// Retries used up; the apology was shown.
    GaveUp { last_error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub attempts: u32,
    pub delays: Vec<Duration>,
    pub outcome: SubmitOutcome,
}

enum Attempt {
    Done(String),
    Terminal(String),
    Transient(String),
}

pub struct RetryController {
    transport: Arc<dyn StreamTransport>,
    policy: RetryPolicy,
    transcript: Transcript,
}

impl RetryController {
    pub fn new(transport: Arc<dyn StreamTransport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            transcript: Transcript::new(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub async fn submit(&mut self, request: ChatRequest) -> SubmitReport {
        let shown = match &request.content {
            Some(t) => t.clone(),
            None => String::new(),
        };
        self.transcript.start_turn(&shown);

        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut delays = Vec::new();

        let outcome = loop {
            attempts += 1;
            match self.attempt(&request).await {
                Attempt::Done(text) => break SubmitOutcome::Completed { text },
                Attempt::Terminal(message) => {
                    self.transcript.show_error(&format!("Error: {}", message));
                    break SubmitOutcome::Failed { message };
                }
                Attempt::Transient(reason) => {
                    if !self.policy.allows(retries) {
                        tracing::error!("Giving up after {} attempts: {}", attempts, reason);
                        self.transcript.show_error(CLIENT_APOLOGY);
                        break SubmitOutcome::GaveUp { last_error: reason };
                    }
                    retries += 1;
                    let delay = self.policy.delay_for(retries);
                    tracing::warn!(
                        "Request failed (attempt {}): {}. Retrying ({}/{}) in {:?}...",
                        attempts,
                        reason,
                        retries,
                        self.policy.max_retries,
                        delay
                    );
                    delays.push(delay);
                    tokio::time::sleep(delay).await;
                }
            }
        };

        self.transcript.finish();
        SubmitReport {
            attempts,
            delays,
            outcome,
        }
    }

    async fn attempt(&mut self, request: &ChatRequest) -> Attempt {
        let response = match self.transport.open(request).await {
            Ok(r) => r,
            Err(e) if e.inner.is_transient() => return Attempt::Transient(e.to_string()),
            Err(e) => return Attempt::Terminal(e.to_string()),
        };

        let mut bytes = match response {
            TransportResponse::Stream(s) => s,
            TransportResponse::Rejected { status, body } => {
                let message = error_message(&body);
                if is_overloaded_signal(&body) {
                    return Attempt::Transient(format!("HTTP {}: {}", status, message));
                }
                return Attempt::Terminal(message);
            }
        };

        self.transcript.begin_assistant();
        let mut decoder = SseDecoder::new();
        let mut text = String::new();
        let mut seen_error: Option<String> = None;

        loop {
            let chunk = match bytes.next().await {
                Some(Ok(c)) => c,
                Some(Err(e)) => return Attempt::Transient(e.to_string()),
                None => break,
            };
            for frame in decoder.decode(&chunk) {
                if let Some(result) = self.on_frame(frame, &mut text, &mut seen_error) {
                    return result;
                }
            }
        }
        for frame in decoder.finish() {
            if let Some(result) = self.on_frame(frame, &mut text, &mut seen_error) {
                return result;
            }
        }

        match seen_error {
            Some(message) => Attempt::Terminal(message),
            None => Attempt::Transient("stream ended before a terminal frame".into()),
        }
    }

    fn on_frame(
        &mut self,
        frame: StreamFrame,
        text: &mut String,
        seen_error: &mut Option<String>,
    ) -> Option<Attempt> {
        match frame {
            StreamFrame::Connected => None,
            StreamFrame::Token { token } => {
                text.push_str(&token);
                self.transcript.set_assistant_text(text);
                None
            }
            StreamFrame::ToolStart { tool, .. } => {
                tracing::debug!("Tool started: {}", tool);
                None
            }
            StreamFrame::ToolEnd { tool, .. } => {
                tracing::debug!("Tool finished: {}", tool);
                None
            }
            StreamFrame::Done => match seen_error.take() {
                Some(message) => Some(Attempt::Terminal(message)),
                None => Some(Attempt::Done(std::mem::take(text))),
            },
            StreamFrame::Error { error } => {
                if is_overloaded_signal(&error) {
                    return Some(Attempt::Transient(error));
                }
                // Shown right away; the connection keeps being read.
                tracing::warn!("Stream error: {}", error);
                self.transcript.show_error(&format!("Error: {}", error));
                *seen_error = Some(error);
                None
            }
        }
    }
}

/// Pulls a readable message out of an error response body.
fn error_message(body: &str) -> String {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return body.to_string(),
    };
    let message = match value.get("error") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(obj) => obj
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string()),
        None => None,
    };
    match message {
        Some(m) => m,
        None => body.to_string(),
    }
}
