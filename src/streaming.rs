//! Drives one generation stream: model events in, SSE frames out, and the
//! assistant turn persisted once the model finishes.

use crate::delta::RunningResponse;
use crate::logging::StreamMetric;
use crate::persistence::PendingTurn;
use crate::provider::{GenerationRequest, ModelEvent, ModelProvider};
use crate::sse::{encode, StreamFrame};
use crate::types::*;
use bytes::Bytes;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type FrameItem = std::result::Result<Bytes, Infallible>;

/// The reader side of the frame channel went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;

/// Write half of a stream's frame channel. `close` consumes the sink, so the
/// channel is closed exactly once.
pub struct FrameSink {
    tx: mpsc::Sender<FrameItem>,
}

impl FrameSink {
    pub fn new(tx: mpsc::Sender<FrameItem>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, frame: &StreamFrame) -> std::result::Result<(), ClientGone> {
        match self.tx.send(Ok(encode(frame))).await {
            Ok(()) => Ok(()),
            Err(_) => Err(ClientGone),
        }
    }

    pub fn close(self) {
        drop(self.tx);
    }
}

/// A bounded frame channel; the receiver becomes the HTTP body.
pub fn frame_channel(capacity: usize) -> (FrameSink, ReceiverStream<FrameItem>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (FrameSink::new(tx), ReceiverStream::new(rx))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Connected,
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolState {
    NoTool,
    ToolRunning {
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    /// `message_id` is `None` when nothing was persisted (blank answer or a
    /// failed write).
    Completed {
        message_id: Option<MessageId>,
        text: String,
    },
    Failed {
        error: String,
    },
    Disconnected,
}

impl StreamOutcome {
    fn label(&self) -> &'static str {
        match self {
            StreamOutcome::Completed { .. } => "completed",
            StreamOutcome::Failed { .. } => "failed",
            StreamOutcome::Disconnected => "disconnected",
        }
    }
}

enum Exit {
    Finished,
    Failed(ObservedError),
    ClientGone,
}

pub struct StreamDriver {
    state: DriverState,
    tool: ToolState,
    response: RunningResponse,
    metric: StreamMetric,
}

impl Default for StreamDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDriver {
    pub fn new() -> Self {
        Self {
            state: DriverState::Idle,
            tool: ToolState::NoTool,
            response: RunningResponse::new(),
            metric: StreamMetric::new(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn tool_state(&self) -> &ToolState {
        &self.tool
    }

    fn transition(&mut self, next: DriverState) {
        if self.state != next {
            tracing::trace!("Stream state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Maps one model event to the frames it produces. Unknown events produce none.
    pub fn on_event(&mut self, event: ModelEvent) -> Vec<StreamFrame> {
        match event {
            ModelEvent::Token(token) => {
                self.transition(DriverState::Streaming);
                match self.response.apply(&token) {
                    Some(delta) => vec![StreamFrame::Token { token: delta }],
                    None => Vec::new(),
                }
            }
            ModelEvent::ToolStart { name, input } => {
                self.transition(DriverState::Streaming);
                if let ToolState::ToolRunning { name: running, .. } = &self.tool {
                    tracing::warn!("Tool {} started while {} was still running", name, running);
                }
                self.tool = ToolState::ToolRunning {
                    name: name.clone(),
                    input: input.clone(),
                };
                vec![StreamFrame::ToolStart { tool: name, input }]
            }
            ModelEvent::ToolEnd { name, output } => {
                self.transition(DriverState::Streaming);
                let mut frames = Vec::with_capacity(2);
                if self.tool == ToolState::NoTool {
                    tracing::warn!("Tool {} ended without a start; synthesizing one", name);
                    frames.push(StreamFrame::ToolStart {
                        tool: name.clone(),
                        input: serde_json::Value::Null,
                    });
                }
                self.tool = ToolState::NoTool;
                frames.push(StreamFrame::ToolEnd { tool: name, output });
                frames
            }
            ModelEvent::Other(kind) => {
                tracing::trace!("Ignoring model event {}", kind);
                Vec::new()
            }
        }
    }

    async fn emit(
        &mut self,
        sink: &FrameSink,
        frame: StreamFrame,
    ) -> std::result::Result<(), ClientGone> {
        sink.send(&frame).await?;
        self.metric.record_frame(&frame);
        Ok(())
    }

    /// Runs the stream to its end. Never returns an error: failures become an
    /// `error` frame, and a vanished client stops the upstream read.
    pub async fn run(
        mut self,
        provider: Arc<dyn ModelProvider>,
        request: GenerationRequest,
        pending: PendingTurn,
        sink: FrameSink,
    ) -> StreamOutcome {
        if self.emit(&sink, StreamFrame::Connected).await.is_err() {
            return self.disconnected(pending).await;
        }
        self.transition(DriverState::Connected);

        let mut events = match provider.stream_chat(request).await {
            Ok(s) => s,
            Err(e) => return self.fail(e, pending, sink).await,
        };

        let exit = 'read: loop {
            let event = match events.next().await {
                Some(Ok(ev)) => ev,
                Some(Err(e)) => break 'read Exit::Failed(e),
                None => break 'read Exit::Finished,
            };
            for frame in self.on_event(event) {
                if self.emit(&sink, frame).await.is_err() {
                    break 'read Exit::ClientGone;
                }
            }
        };
        // Dropping the model stream cancels the upstream call.
        drop(events);

        match exit {
            Exit::Finished => self.complete(pending, sink).await,
            Exit::Failed(e) => self.fail(e, pending, sink).await,
            Exit::ClientGone => self.disconnected(pending).await,
        }
    }

    async fn complete(mut self, pending: PendingTurn, sink: FrameSink) -> StreamOutcome {
        if let ToolState::ToolRunning { name, .. } = &self.tool {
            tracing::warn!("Model finished with tool {} still running", name);
        }

        let message_id = if self.response.is_blank() {
            tracing::debug!("Empty answer; dropping placeholder [{}]", pending.message_id().short());
            if let Err(e) = pending.commit_without_answer().await {
                tracing::error!("Failed to persist user turn: {}", e);
            }
            None
        } else {
            match pending.commit(self.response.text()).await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::error!("Failed to persist assistant turn: {}", e);
                    None
                }
            }
        };

        self.transition(DriverState::Completed);
        if self.emit(&sink, StreamFrame::Done).await.is_err() {
            tracing::debug!("Client left before the done frame");
        }
        sink.close();

        let outcome = StreamOutcome::Completed {
            message_id,
            text: std::mem::take(&mut self.response).into_text(),
        };
        self.metric.log_summary(outcome.label());
        outcome
    }

    async fn fail(
        mut self,
        error: ObservedError,
        pending: PendingTurn,
        sink: FrameSink,
    ) -> StreamOutcome {
        tracing::error!("[☁️  -> ⚙️ ] Generation failed: {}", error);
        self.transition(DriverState::Failed);

        // The turn is gone before the client can see the error and retry.
        if let Err(e) = pending.abandon().await {
            tracing::error!("Failed to drop pending turn: {}", e);
        }

        let message = error.inner.to_string();
        if self.emit(&sink, StreamFrame::error(message.clone())).await.is_err() {
            tracing::debug!("Client left before the error frame");
        }
        sink.close();

        let outcome = StreamOutcome::Failed { error: message };
        self.metric.log_summary(outcome.label());
        outcome
    }

    async fn disconnected(self, pending: PendingTurn) -> StreamOutcome {
        tracing::info!(
            "[⚙️  -> 🌐] Client disconnected after {} chars; stopping generation",
            self.response.emitted_len()
        );
        if let Err(e) = pending.abandon().await {
            tracing::error!("Failed to drop pending turn: {}", e);
        }
        let outcome = StreamOutcome::Disconnected;
        self.metric.log_summary(outcome.label());
        outcome
    }
}
