//! Server-Sent-Events framing shared by the server and the client.
//!
//! Every frame is a single `data: <json>\n\n` record. The decoder is fed raw
//! network chunks and keeps whatever it could not finish (a partial line, or a
//! UTF-8 sequence split across reads) until the next call.

use crate::constants::{SSE_DATA_PREFIX, SSE_DONE_SENTINEL, SSE_FRAME_DELIMITER};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One SSE record sent to the client, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Connected,
    Token {
        token: String,
    },
    ToolStart {
        tool: String,
        input: serde_json::Value,
    },
    /// Tool output travels in the `input` field on the wire.
    ToolEnd {
        tool: String,
        #[serde(rename = "input")]
        output: serde_json::Value,
    },
    Done,
    Error {
        error: String,
    },
}

impl StreamFrame {
    pub fn error(msg: impl Into<String>) -> Self {
        StreamFrame::Error { error: msg.into() }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Done | StreamFrame::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamFrame::Connected => "connected",
            StreamFrame::Token { .. } => "token",
            StreamFrame::ToolStart { .. } => "tool_start",
            StreamFrame::ToolEnd { .. } => "tool_end",
            StreamFrame::Done => "done",
            StreamFrame::Error { .. } => "error",
        }
    }
}

/// Serializes one frame into its wire bytes.
pub fn encode(frame: &StreamFrame) -> Bytes {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            tracing::warn!("Failed to serialize {} frame: {}", frame.kind(), e);
            serde_json::json!({ "type": "error", "error": "failed to serialize frame" })
                .to_string()
        }
    };
    let mut out = String::with_capacity(SSE_DATA_PREFIX.len() + json.len() + 2);
    out.push_str(SSE_DATA_PREFIX);
    out.push_str(&json);
    out.push_str(SSE_FRAME_DELIMITER);
    Bytes::from(out)
}

/// The `[DONE]` sentinel form of the terminal frame.
pub fn encode_done_sentinel() -> Bytes {
    Bytes::from(format!(
        "{}{}{}",
        SSE_DATA_PREFIX, SSE_DONE_SENTINEL, SSE_FRAME_DELIMITER
    ))
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    line_buf: String,
    utf8_tail: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every frame completed by it.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.push_bytes(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            if let Some(frame) = parse_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Partial line held until the next chunk arrives.
    pub fn leftover(&self) -> &str {
        &self.line_buf
    }

    /// Flushes an unterminated final line at end of input.
    pub fn finish(mut self) -> Vec<StreamFrame> {
        if !self.utf8_tail.is_empty() {
            let tail = std::mem::take(&mut self.utf8_tail);
            self.line_buf.push_str(&String::from_utf8_lossy(&tail));
        }
        let line = std::mem::take(&mut self.line_buf);
        parse_line(&line).into_iter().collect()
    }

    fn push_bytes(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.utf8_tail);
        bytes.extend_from_slice(chunk);

        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    self.line_buf.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.line_buf.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            self.utf8_tail = after.to_vec();
                            break;
                        }
                        Some(n) => {
                            self.line_buf.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[n..];
                        }
                    }
                }
            }
        }
    }
}

fn parse_line(line: &str) -> Option<StreamFrame> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let payload = trimmed.strip_prefix(SSE_DATA_PREFIX.trim_end())?.trim_start();
    if payload == SSE_DONE_SENTINEL {
        return Some(StreamFrame::Done);
    }
    match serde_json::from_str::<StreamFrame>(payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::debug!("Unparseable SSE payload ({}): {}", e, payload);
            Some(StreamFrame::error("failed to parse SSE message"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_stream() -> Vec<u8> {
        let frames = vec![
            StreamFrame::Connected,
            StreamFrame::Token {
                token: "Grüße, ".into(),
            },
            StreamFrame::ToolStart {
                tool: "search".into(),
                input: json!({"q": "日本"}),
            },
            StreamFrame::ToolEnd {
                tool: "search".into(),
                output: json!(["hit"]),
            },
            StreamFrame::Token {
                token: "world 🌍".into(),
            },
            StreamFrame::Done,
        ];
        let mut out = Vec::new();
        for f in &frames {
            out.extend_from_slice(&encode(f));
        }
        out
    }

    #[test]
    fn test_encode_wire_format() {
        let bytes = encode(&StreamFrame::Token { token: "Hi".into() });
        assert_eq!(&bytes[..], b"data: {\"type\":\"token\",\"token\":\"Hi\"}\n\n");

        let bytes = encode(&StreamFrame::Connected);
        assert_eq!(&bytes[..], b"data: {\"type\":\"connected\"}\n\n");
    }

    #[test]
    fn test_tool_end_keeps_input_field_on_wire() {
        let bytes = encode(&StreamFrame::ToolEnd {
            tool: "calc".into(),
            output: json!(4),
        });
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("\"input\":4"), "got {}", text);
        assert!(!text.contains("output"));
    }

    #[test]
    fn test_decode_across_two_chunks() {
        let mut decoder = SseDecoder::new();
        let first = decoder.decode(b"data: {\"type\":\"token\",\"token\":\"Hi\"}\n\nda");
        assert_eq!(first, vec![StreamFrame::Token { token: "Hi".into() }]);
        assert_eq!(decoder.leftover(), "da");

        let second = decoder.decode(b"ta: {\"type\":\"done\"}\n\n");
        assert_eq!(second, vec![StreamFrame::Done]);
        assert_eq!(decoder.leftover(), "");
    }

    #[test]
    fn test_done_sentinel_equivalent_to_done_frame() {
        let mut a = SseDecoder::new();
        let mut b = SseDecoder::new();
        assert_eq!(a.decode(&encode_done_sentinel()), vec![StreamFrame::Done]);
        assert_eq!(b.decode(b"data: {\"type\":\"done\"}\n\n"), vec![StreamFrame::Done]);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let stream = sample_stream();
        let mut whole = SseDecoder::new();
        let expected = whole.decode(&stream);
        assert_eq!(expected.len(), 6);

        for split in 0..=stream.len() {
            let mut decoder = SseDecoder::new();
            let mut got = decoder.decode(&stream[..split]);
            got.extend(decoder.decode(&stream[split..]));
            assert_eq!(got, expected, "split at byte {}", split);
        }

        // Byte-at-a-time feeding.
        let mut decoder = SseDecoder::new();
        let mut got = Vec::new();
        for b in &stream {
            got.extend(decoder.decode(std::slice::from_ref(b)));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_garbage_becomes_error_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.decode(b"data: {not json}\n\ndata: {\"type\":\"mystery\"}\n\n");
        assert_eq!(frames.len(), 2);
        assert!(frames
            .iter()
            .all(|f| matches!(f, StreamFrame::Error { .. })));
    }

    #[test]
    fn test_skips_blank_comment_and_foreign_lines() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.decode(
            b": keepalive\n\nevent: ping\nid: 7\n\r\ndata: {\"type\":\"connected\"}\r\n\r\n",
        );
        assert_eq!(frames, vec![StreamFrame::Connected]);
        assert!(decoder.decode(b"").is_empty());
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), vec![StreamFrame::Done]);
    }
}
