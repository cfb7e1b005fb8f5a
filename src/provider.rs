use crate::constants::{
    ANTHROPIC_VERSION, MAX_UPSTREAM_LINES, MAX_UPSTREAM_LINE_BYTES, MODEL_EVENT_BUFFER,
    OVERLOADED_STATUS,
};
use crate::specs::anthropic::*;
use crate::types::*;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::Instrument;

/// One event from the model, already lifted out of the provider's wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Token(String),
    ToolStart {
        name: String,
        input: serde_json::Value,
    },
    ToolEnd {
        name: String,
        output: serde_json::Value,
    },
    /// Anything the driver has no use for (pings, usage updates, ...).
    Other(String),
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

pub type ModelEventStream = Pin<Box<dyn Stream<Item = Result<ModelEvent>> + Send>>;

/// A hosted model that streams its answer. Dropping the returned stream must
/// cancel the upstream call.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_chat(&self, request: GenerationRequest) -> Result<ModelEventStream>;
}

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(client: reqwest::Client, config: AnthropicConfig) -> Self {
        Self { client, config }
    }

    fn build_request(&self, request: &GenerationRequest) -> AnthropicRequest {
        AnthropicRequest {
            model: self.config.model.clone(),
            system: Some(request.system.trim().to_string()),
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: self.config.max_tokens,
            stream: Some(true),
            temperature: self.config.temperature,
        }
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream_chat(&self, request: GenerationRequest) -> Result<ModelEventStream> {
        let body = self.build_request(&request);
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        tracing::debug!(
            "[⚙️  -> ☁️ ] {} turns to {} for [{}]",
            body.messages.len(),
            self.config.model,
            request.conversation_id.short()
        );

        let response = match self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Err(ChatError::UpstreamTransport(e.to_string()).into()),
        };

        let status = response.status();
        if !status.is_success() {
            let err_body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            tracing::warn!("[☁️  -> ⚙️ ] Upstream rejected request ({}): {}", status, err_body);
            return Err(classify_upstream_failure(status, &err_body).into());
        }

        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_UPSTREAM_LINE_BYTES),
        );

        let (tx, rx) = mpsc::channel(MODEL_EVENT_BUFFER);
        tokio::spawn(pump_lines(lines, tx).instrument(tracing::Span::current()));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Maps a non-2xx upstream response onto the error taxonomy.
pub fn classify_upstream_failure(status: reqwest::StatusCode, body: &str) -> ChatError {
    let parsed: Option<AnthropicErrorEnvelope> = serde_json::from_str(body).ok();
    let message = match &parsed {
        Some(env) => env.error.message.clone(),
        None => body.to_string(),
    };
    let overloaded_kind = matches!(&parsed, Some(env) if env.error.kind == "overloaded_error");

    if status.as_u16() == OVERLOADED_STATUS || overloaded_kind {
        ChatError::UpstreamOverloaded(message)
    } else {
        ChatError::Upstream(status, message)
    }
}

async fn pump_lines<S>(
    mut lines: FramedRead<StreamReader<S, Bytes>, LinesCodec>,
    tx: mpsc::Sender<Result<ModelEvent>>,
) where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin + Send,
{
    let mut decoder = AnthropicEventDecoder::default();
    let mut line_count = 0usize;

    loop {
        // A dropped receiver ends the read even when lines produce no events.
        let line_result = tokio::select! {
            biased;
            _ = tx.closed() => {
                tracing::trace!("Driver dropped the model stream, stopping upstream read");
                return;
            }
            next = lines.next() => match next {
                Some(r) => r,
                None => break,
            },
        };
        line_count += 1;
        if line_count > MAX_UPSTREAM_LINES {
            tracing::error!("[☁️  -> ⚙️ ] Upstream exceeded {} lines", MAX_UPSTREAM_LINES);
            let err = ChatError::UpstreamTransport("upstream stream too long".into());
            let _ = tx.send(Err(err.into())).await;
            return;
        }

        let line = match line_result {
            Ok(l) => l,
            Err(e) => {
                let msg = match e {
                    LinesCodecError::Io(io) => io.to_string(),
                    LinesCodecError::MaxLineLengthExceeded => "Max line length exceeded".into(),
                };
                tracing::error!("[☁️  -> ⚙️ ] Line Parse Error: {}", msg);
                let _ = tx.send(Err(ChatError::UpstreamTransport(msg).into())).await;
                return;
            }
        };

        for item in decoder.feed_line(&line) {
            if tx.send(item).await.is_err() {
                tracing::trace!("Driver dropped the model stream, stopping upstream read");
                return;
            }
        }
        if decoder.is_finished() {
            return;
        }
    }

    if !decoder.is_finished() {
        let err = ChatError::UpstreamTransport("upstream closed before message_stop".into());
        let _ = tx.send(Err(err.into())).await;
    }
}

struct PendingToolUse {
    name: String,
    input: serde_json::Value,
    partial_json: String,
}

/// Turns Anthropic SSE lines into [`ModelEvent`]s. Tool input arrives as JSON
/// fragments and is only reported once its block closes.
#[derive(Default)]
pub struct AnthropicEventDecoder {
    tool_blocks: HashMap<u32, PendingToolUse>,
    finished: bool,
}

impl AnthropicEventDecoder {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn feed_line(&mut self, line: &str) -> Vec<Result<ModelEvent>> {
        let data = match line.trim_end_matches('\r').strip_prefix("data:") {
            Some(d) => d.trim_start(),
            None => return Vec::new(),
        };
        if data.is_empty() {
            return Vec::new();
        }

        let event: AnthropicStreamEvent = match serde_json::from_str(data) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("[☁️  -> ⚙️ ] Unparseable upstream event ({}): {}", e, data);
                return Vec::new();
            }
        };

        match event {
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, input },
            } => {
                tracing::debug!("Tool use block {} opened: {} ({})", index, name, id);
                self.tool_blocks.insert(
                    index,
                    PendingToolUse {
                        name,
                        input,
                        partial_json: String::new(),
                    },
                );
                Vec::new()
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![Ok(ModelEvent::Token(text))],
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some(tool) = self.tool_blocks.get_mut(&index) {
                        tool.partial_json.push_str(&partial_json);
                    }
                    Vec::new()
                }
                BlockDelta::Other => vec![Ok(ModelEvent::Other("content_block_delta".into()))],
            },
            AnthropicStreamEvent::ContentBlockStop { index } => {
                match self.tool_blocks.remove(&index) {
                    Some(tool) => vec![Ok(ModelEvent::ToolStart {
                        input: tool_input(tool.input, &tool.partial_json),
                        name: tool.name,
                    })],
                    None => Vec::new(),
                }
            }
            AnthropicStreamEvent::MessageStop => {
                self.finished = true;
                Vec::new()
            }
            AnthropicStreamEvent::Error { error } => {
                self.finished = true;
                let err = if error.kind == "overloaded_error" {
                    ChatError::UpstreamOverloaded(error.message)
                } else {
                    ChatError::Upstream(
                        reqwest::StatusCode::BAD_GATEWAY,
                        format!("{}: {}", error.kind, error.message),
                    )
                };
                vec![Err(err.into())]
            }
            other => vec![Ok(ModelEvent::Other(other.kind().to_string()))],
        }
    }
}

fn tool_input(initial: serde_json::Value, partial_json: &str) -> serde_json::Value {
    if partial_json.trim().is_empty() {
        return initial;
    }
    match serde_json::from_str(partial_json) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Tool input was not valid JSON ({}), passing it through raw", e);
            serde_json::Value::String(partial_json.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(decoder: &mut AnthropicEventDecoder, lines: &[&str]) -> Vec<ModelEvent> {
        lines
            .iter()
            .flat_map(|l| decoder.feed_line(l))
            .map(|r| match r {
                Ok(e) => e,
                Err(e) => panic!("Unexpected error event: {}", e),
            })
            .collect()
    }

    #[test]
    fn test_text_deltas_become_tokens() {
        let mut decoder = AnthropicEventDecoder::default();
        let out = events(
            &mut decoder,
            &[
                "event: message_start",
                r#"data: {"type":"message_start","message":{"id":"msg_1"}}"#,
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                r#"data: {"type":"ping"}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"4"}}"#,
                r#"data: {"type":"content_block_stop","index":0}"#,
            ],
        );
        let tokens: Vec<_> = out
            .iter()
            .filter_map(|e| match e {
                ModelEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["4"]);
        assert!(!decoder.is_finished());

        assert!(decoder
            .feed_line(r#"data: {"type":"message_stop"}"#)
            .is_empty());
        assert!(decoder.is_finished());
    }

    #[test]
    fn test_tool_input_is_assembled_from_fragments() {
        let mut decoder = AnthropicEventDecoder::default();
        let out = events(
            &mut decoder,
            &[
                r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"search","input":{}}}"#,
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"q\":"}}"#,
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"rust\"}"}}"#,
                r#"data: {"type":"content_block_stop","index":1}"#,
            ],
        );
        assert_eq!(
            out,
            vec![ModelEvent::ToolStart {
                name: "search".into(),
                input: serde_json::json!({"q": "rust"}),
            }]
        );
    }

    #[test]
    fn test_overloaded_error_event() {
        let mut decoder = AnthropicEventDecoder::default();
        let out = decoder.feed_line(
            r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Err(e) => assert!(matches!(e.inner, ChatError::UpstreamOverloaded(_))),
            Ok(ev) => panic!("Expected error, got {:?}", ev),
        }
        assert!(decoder.is_finished());
    }

    fn counted_lines(
        lines: Vec<&'static str>,
        pulled: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    ) -> FramedRead<StreamReader<impl Stream<Item = std::io::Result<Bytes>> + Unpin + Send, Bytes>, LinesCodec>
    {
        let chunks = futures_util::stream::iter(lines).map(move |l| {
            pulled.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<Bytes, std::io::Error>(Bytes::from(format!("{}\n", l)))
        });
        FramedRead::new(StreamReader::new(chunks), LinesCodec::new())
    }

    #[tokio::test]
    async fn test_pump_stops_reading_once_receiver_is_gone() {
        let pulled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fragment = r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{"}}"#;
        let mut script = vec![
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"search","input":{}}}"#,
        ];
        script.extend(std::iter::repeat(fragment).take(500));

        let (tx, rx) = mpsc::channel(MODEL_EVENT_BUFFER);
        drop(rx);
        pump_lines(counted_lines(script, pulled.clone()), tx).await;

        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pump_forwards_events_until_message_stop() {
        let pulled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let script = vec![
            "event: content_block_delta",
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"4"}}"#,
            "",
            r#"data: {"type":"message_stop"}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"late"}}"#,
        ];

        let (tx, mut rx) = mpsc::channel(MODEL_EVENT_BUFFER);
        pump_lines(counted_lines(script, pulled), tx).await;

        let mut tokens = Vec::new();
        while let Some(item) = rx.recv().await {
            match item {
                Ok(ModelEvent::Token(t)) => tokens.push(t),
                Ok(_) => {}
                Err(e) => panic!("Unexpected error: {}", e),
            }
        }
        assert_eq!(tokens, vec!["4".to_string()]);
    }

    #[test]
    fn test_classify_upstream_failure() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let err = classify_upstream_failure(reqwest::StatusCode::SERVICE_UNAVAILABLE, body);
        assert!(matches!(err, ChatError::UpstreamOverloaded(ref m) if m == "Overloaded"));

        let status = match reqwest::StatusCode::from_u16(529) {
            Ok(s) => s,
            Err(e) => panic!("bad status: {}", e),
        };
        assert!(matches!(
            classify_upstream_failure(status, "busy"),
            ChatError::UpstreamOverloaded(_)
        ));

        let body = r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#;
        match classify_upstream_failure(reqwest::StatusCode::BAD_REQUEST, body) {
            ChatError::Upstream(s, m) => {
                assert_eq!(s, reqwest::StatusCode::BAD_REQUEST);
                assert_eq!(m, "bad");
            }
            other => panic!("Expected Upstream, got {:?}", other),
        }
    }
}
