use crate::sse::StreamFrame;
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Sets up a global panic hook that logs panics using tracing.
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

        let location = match panic_info.location() {
            Some(l) => format!("{}:{}:{}", l.file(), l.line(), l.column()),
            None => "unknown location".to_string(),
        };

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

/// Tags every request with an id (reusing the caller's if it sent one) and runs
/// the rest of the stack inside a `request` span.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
    {
        Some(id) => id.to_string(),
        None => Uuid::new_v4().to_string(),
    };
    let header_value = HeaderValue::from_str(&request_id).ok();
    if let Some(val) = &header_value {
        req.headers_mut().insert(REQUEST_ID_HEADER, val.clone());
    }

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %req.method(),
        path = %req.uri().path()
    );
    let mut response = next.run(req).instrument(span).await;
    if let Some(val) = header_value {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-stream counters, logged once when the stream ends.
pub struct StreamMetric {
    pub started: Instant,
    pub frames: usize,
    pub tokens: usize,
    pub text_chars: usize,
    pub tool_names: Vec<String>,
    pub first_token_ms: Option<u128>,
}

impl Default for StreamMetric {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            frames: 0,
            tokens: 0,
            text_chars: 0,
            tool_names: Vec::new(),
            first_token_ms: None,
        }
    }
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&mut self, frame: &StreamFrame) {
        self.frames += 1;
        match frame {
            StreamFrame::Token { token } => {
                if self.first_token_ms.is_none() {
                    self.first_token_ms = Some(self.started.elapsed().as_millis());
                }
                self.tokens += 1;
                self.text_chars += token.chars().count();
            }
            StreamFrame::ToolStart { tool, .. } => self.tool_names.push(tool.clone()),
            _ => {}
        }
    }

    pub fn log_summary(&self, outcome: &str) {
        let tools_str = if self.tool_names.is_empty() {
            "0".to_string()
        } else {
            format!("{} ({})", self.tool_names.len(), self.tool_names.join(", "))
        };
        let ttft = match self.first_token_ms {
            Some(ms) => format!("{}ms", ms),
            None => "-".to_string(),
        };

        info!(
            target: "flight_recorder",
            "[STREAM END] Outcome: {} | Frames: {} | Tokens: {} | Tools: {} | Text: {} chars | TTFT: {} | Total: {}ms",
            outcome,
            self.frames,
            self.tokens,
            tools_str,
            self.text_chars,
            ttft,
            self.started.elapsed().as_millis()
        );
    }
}
