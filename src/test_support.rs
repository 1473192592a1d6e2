//! Test doubles.
//!
//! `ScriptedServer` is a scripted HTTP/1.1 server for transport tests: each
//! accepted connection consumes the next `Reply` in the script and the last
//! one repeats once the script runs out. Every response is sent with
//! `Connection: close` so one connection carries exactly one request.
//!
//! `FakeModel` and `FakeTools` are in-memory stand-ins for the model and tool
//! servers used by the agent core tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::inference::{ChatMessage, GenerationEvent, GenerationStream, InferenceError, LanguageModel, SamplingParams};
use crate::tools::{FailureKind, ToolInvoker, ToolRequest, ToolResponse};
use crate::transport::{RetryPolicy, TransportError};

/// What the server does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond with a status and body.
    Body {
        status: u16,
        content_type: &'static str,
        body: String,
    },
    /// Read the request and never answer.
    Hang,
    /// Read the request and close the socket without a response.
    Close,
    /// Stream SSE body pieces, flushing each one, then close (or stall).
    Sse {
        pieces: Vec<String>,
        stall_after: bool,
    },
}

impl Reply {
    pub fn json(status: u16, body: &str) -> Self {
        Reply::Body {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Reply::Body {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }

    pub fn sse(pieces: &[&str]) -> Self {
        Reply::Sse {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            stall_after: false,
        }
    }

    pub fn sse_then_stall(pieces: &[&str]) -> Self {
        Reply::Sse {
            pieces: pieces.iter().map(|p| p.to_string()).collect(),
            stall_after: true,
        }
    }
}

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct Captured {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl Captured {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

pub struct ScriptedServer {
    addr: std::net::SocketAddr,
    captured: Arc<Mutex<Vec<Captured>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl ScriptedServer {
    pub async fn start(script: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&captured);

        let handle = tokio::spawn(async move {
            let mut index = 0usize;
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let reply = script
                    .get(index)
                    .or_else(|| script.last())
                    .cloned()
                    .unwrap_or(Reply::Close);
                index += 1;
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    serve(socket, reply, log).await;
                });
            }
        });

        Self {
            addr,
            captured,
            handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    /// Number of requests received so far.
    pub fn requests(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    pub fn captured(&self) -> Vec<Captured> {
        self.captured.lock().unwrap().clone()
    }
}

impl Drop for ScriptedServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A URL on which nothing is listening.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

async fn serve(mut socket: TcpStream, reply: Reply, log: Arc<Mutex<Vec<Captured>>>) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    log.lock().unwrap().push(request);

    match reply {
        Reply::Body {
            status,
            content_type,
            body,
        } => {
            let head = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reason(status),
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Reply::Close => {
            drop(socket);
        }
        Reply::Sse {
            pieces,
            stall_after,
        } => {
            let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
            if socket.write_all(head.as_bytes()).await.is_err() {
                return;
            }
            for piece in pieces {
                if socket.write_all(piece.as_bytes()).await.is_err() {
                    return;
                }
                let _ = socket.flush().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            if stall_after {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let _ = socket.shutdown().await;
        }
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<Captured> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body_end = (header_end + content_length).min(buf.len());
    let body = String::from_utf8_lossy(&buf[header_end..body_end]).to_string();

    Some(Captured { method, path, body })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

// ─── FakeModel ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Answer {
    Text(String),
    Fail,
    Hang,
}

#[derive(Debug, Clone)]
enum StreamScript {
    Chunks(Vec<String>),
    Interrupted(Vec<String>, String),
    Fail,
    Endless,
}

/// Sets its flag when dropped, so tests can observe stream cancellation.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// In-memory `LanguageModel`.
pub struct FakeModel {
    answer: Answer,
    stream: StreamScript,
    chat_calls: Mutex<Vec<Vec<ChatMessage>>>,
    stream_calls: Mutex<Vec<Vec<ChatMessage>>>,
    stream_dropped: Arc<AtomicBool>,
}

impl FakeModel {
    /// Completions fail; streams yield a single "ok" chunk.
    pub fn new() -> Self {
        Self {
            answer: Answer::Fail,
            stream: StreamScript::Chunks(vec!["ok".into()]),
            chat_calls: Mutex::new(Vec::new()),
            stream_calls: Mutex::new(Vec::new()),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn answering(mut self, text: &str) -> Self {
        self.answer = Answer::Text(text.into());
        self
    }

    pub fn hanging(mut self) -> Self {
        self.answer = Answer::Hang;
        self
    }

    pub fn streaming(mut self, chunks: &[&str]) -> Self {
        self.stream = StreamScript::Chunks(chunks.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn interrupted(mut self, chunks: &[&str], reason: &str) -> Self {
        self.stream = StreamScript::Interrupted(chunks.iter().map(|c| c.to_string()).collect(), reason.into());
        self
    }

    pub fn stream_fails(mut self) -> Self {
        self.stream = StreamScript::Fail;
        self
    }

    /// A stream that never ends on its own.
    pub fn endless(mut self) -> Self {
        self.stream = StreamScript::Endless;
        self
    }

    pub fn chat_calls(&self) -> Vec<Vec<ChatMessage>> {
        self.chat_calls.lock().unwrap().clone()
    }

    pub fn stream_calls(&self) -> Vec<Vec<ChatMessage>> {
        self.stream_calls.lock().unwrap().clone()
    }

    pub fn stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }
}

fn unavailable() -> InferenceError {
    InferenceError::Transport(TransportError::Unavailable {
        endpoint: "fake-model".into(),
        reason: "connection refused".into(),
    })
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn complete_chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _sampling: SamplingParams,
    ) -> Result<String, InferenceError> {
        self.chat_calls.lock().unwrap().push(messages.to_vec());
        match &self.answer {
            Answer::Text(text) => Ok(text.clone()),
            Answer::Fail => Err(unavailable()),
            Answer::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(unavailable())
            }
        }
    }

    async fn stream_generate(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _sampling: SamplingParams,
    ) -> Result<GenerationStream, InferenceError> {
        self.stream_calls.lock().unwrap().push(messages.to_vec());
        let events: Vec<GenerationEvent> = match &self.stream {
            StreamScript::Fail => return Err(unavailable()),
            StreamScript::Endless => {
                let flag = DropFlag(Arc::clone(&self.stream_dropped));
                let stream = futures::stream::unfold(flag, |flag| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Some((GenerationEvent::Chunk("tick ".into()), flag))
                });
                return Ok(Box::pin(stream));
            }
            StreamScript::Chunks(chunks) => chunks.iter().cloned().map(GenerationEvent::Chunk).collect(),
            StreamScript::Interrupted(chunks, reason) => chunks
                .iter()
                .cloned()
                .map(GenerationEvent::Chunk)
                .chain(std::iter::once(GenerationEvent::Interrupted { reason: reason.clone() }))
                .collect(),
        };
        Ok(Box::pin(futures::stream::iter(events)))
    }

    async fn health(&self) -> bool {
        !matches!(self.stream, StreamScript::Fail)
    }
}

// ─── FakeTools ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum ToolScript {
    Result(serde_json::Value),
    Fail(FailureKind),
    Hang,
}

/// In-memory `ToolInvoker` that records every request.
pub struct FakeTools {
    script: ToolScript,
    requests: Mutex<Vec<ToolRequest>>,
    calls: AtomicUsize,
}

impl FakeTools {
    pub fn returning(result: serde_json::Value) -> Self {
        Self::with(ToolScript::Result(result))
    }

    pub fn failing(kind: FailureKind) -> Self {
        Self::with(ToolScript::Fail(kind))
    }

    pub fn hanging() -> Self {
        Self::with(ToolScript::Hang)
    }

    fn with(script: ToolScript) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn requests(&self) -> Vec<ToolRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolInvoker for FakeTools {
    async fn call(&self, request: &ToolRequest, _policy: &RetryPolicy) -> ToolResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        match &self.script {
            ToolScript::Result(value) => ToolResponse::ok(request, value.clone(), Duration::from_millis(3), 1),
            ToolScript::Fail(kind) => {
                ToolResponse::failed(request, *kind, "scripted failure", Duration::from_millis(3), 3)
            }
            ToolScript::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ToolResponse::failed(request, FailureKind::Timeout, "hung", Duration::from_secs(60), 1)
            }
        }
    }

    async fn health(&self) -> bool {
        !matches!(self.script, ToolScript::Fail(_))
    }
}
