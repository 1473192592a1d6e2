//! SSE streaming parser for chat completions.
//!
//! Reads the HTTP body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`), parses each event as a `ChatCompletionChunk`, and yields
//! text chunks. The sequence is one-shot and finite: it ends cleanly after
//! `[DONE]` or a `finish_reason`, and ends with a single
//! `GenerationEvent::Interrupted` on any abnormal termination.

use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::types::ChatCompletionChunk;

// ─── Events ──────────────────────────────────────────────────────────────────

/// One item of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// Incremental answer text, in arrival order.
    Chunk(String),
    /// Terminal marker: the stream ended abnormally. Always the last item.
    Interrupted { reason: String },
}

/// Lazy, finite, non-restartable sequence of generation events.
pub type GenerationStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

// ─── SSE parser ──────────────────────────────────────────────────────────────

/// Parse a streaming response body into generation events.
///
/// `idle_timeout` bounds the gap between two reads; a stalled connection
/// ends the stream with `Interrupted`.
pub fn parse_sse_stream(response: reqwest::Response, idle_timeout: Duration) -> GenerationStream {
    parse_sse_bytes(response.bytes_stream(), idle_timeout)
}

/// Byte-stream core of [`parse_sse_stream`], usable with any chunk source.
pub fn parse_sse_bytes<S, B, E>(bytes: S, idle_timeout: Duration) -> GenerationStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        terminated: false,
    };

    let stream = stream::unfold(state, move |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.terminated {
                return None;
            }

            // A complete SSE event is already buffered
            if let Some(end) = find_event_end(&state.buffer) {
                let raw: Vec<u8> = state.buffer.drain(..end + 2).collect();
                let event = String::from_utf8_lossy(&raw[..end]).into_owned();
                state.process_event(&event);
                continue;
            }

            // Finish reason seen and nothing left buffered: done without waiting on the socket
            if state.finished {
                state.terminated = true;
                continue;
            }

            match tokio::time::timeout(idle_timeout, state.bytes.next()).await {
                Ok(Some(Ok(chunk))) => {
                    // Normalize CRLF framing; keep multi-byte text intact across reads
                    state
                        .buffer
                        .extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));
                }
                Ok(Some(Err(e))) => {
                    state.interrupt(format!("stream read error: {e}"));
                }
                Ok(None) => {
                    let rest = std::mem::take(&mut state.buffer);
                    let rest = String::from_utf8_lossy(&rest).into_owned();
                    if !rest.trim().is_empty() {
                        state.process_event(rest.trim());
                    }
                    state.interrupt("connection closed before the stream completed".to_string());
                }
                Err(_) => {
                    state.interrupt(format!(
                        "no data from model for {}ms",
                        idle_timeout.as_millis()
                    ));
                }
            }
        }
    });

    Box::pin(stream)
}

fn find_event_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

// ─── Stream State ────────────────────────────────────────────────────────────

struct SseState<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<GenerationEvent>,
    /// A `finish_reason` was seen; a close after this point is clean.
    finished: bool,
    /// No further events will be produced once `pending` drains.
    terminated: bool,
}

impl<S> SseState<S> {
    /// Process a single SSE event (may contain several `data:` lines).
    fn process_event(&mut self, event: &str) {
        if self.terminated {
            return;
        }

        let mut data = String::new();
        for line in event.lines() {
            if let Some(d) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let d = d.trim();
                if d == "[DONE]" {
                    self.finished = true;
                    self.terminated = true;
                    return;
                }
                data.push_str(d);
            }
            // Comments, `event:` and `id:` lines carry nothing we use
        }

        if data.is_empty() {
            return; // keep-alive
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                self.interrupt(format!("failed to parse SSE chunk: {e}"));
                return;
            }
        };

        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        let text = choice
            .delta
            .and_then(|d| d.content)
            .or(choice.text)
            .unwrap_or_default();
        if !text.is_empty() {
            self.pending.push_back(GenerationEvent::Chunk(text));
        }

        if choice.finish_reason.is_some_and(|r| !r.is_empty()) {
            self.finished = true;
        }
    }

    /// End the stream. Abnormal unless a finish reason was already seen.
    fn interrupt(&mut self, reason: String) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if !self.finished {
            tracing::warn!(reason = %reason, "generation stream interrupted");
            self.pending.push_back(GenerationEvent::Interrupted { reason });
        }
    }
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

/// Extract answer text from a non-streaming completion body.
///
/// Accepts chat (`choices[0].message.content`), completion
/// (`choices[0].text`) and Ollama-native (`message.content`, `response`)
/// shapes.
pub fn parse_completion_body(endpoint: &str, body: &serde_json::Value) -> Result<String, InferenceError> {
    let candidates = [
        body.pointer("/choices/0/message/content"),
        body.pointer("/choices/0/text"),
        body.pointer("/message/content"),
        body.pointer("/response"),
    ];

    let Some(found) = candidates.into_iter().flatten().next() else {
        return Err(InferenceError::Parse {
            what: "completion response",
            reason: "no choices, message or response field".to_string(),
        });
    };

    match found {
        serde_json::Value::String(text) if !text.trim().is_empty() => Ok(text.clone()),
        serde_json::Value::String(_) | serde_json::Value::Null => Err(InferenceError::EmptyResponse {
            endpoint: endpoint.to_string(),
        }),
        other => Err(InferenceError::Parse {
            what: "completion response",
            reason: format!("content is not text: {other}"),
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
