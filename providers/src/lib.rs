//! Chat completion transports with streaming support.
//!
//! # Architecture
//!
//! - [`Transport`] - object-safe seam between the request driver and a provider
//! - [`openai`] - OpenAI Chat Completions client (blocking and SSE streaming)
//! - [`retry`] - backoff policy and the attempt loop used by callers
//!
//! A transport makes exactly one attempt per call. Retrying is the caller's
//! decision, driven by [`retry::with_retries`].
//!
//! # Streaming
//!
//! [`Transport::complete_streaming`] resolves once the response headers are in
//! and yields a [`FragmentStream`]: a lazy, finite sequence of text fragments.
//! Dropping the stream drops the underlying HTTP response, which cancels the
//! request. Stream failures (idle timeout, premature EOF, malformed payloads)
//! arrive as an `Err` item, after which the stream ends.

pub mod openai;
pub mod retry;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::{Stream, StreamExt};

use gee_types::{Completion, FunctionDefinition, Message};

pub use gee_types;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
const TCP_KEEPALIVE_SECS: u64 = 60;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

// ============================================================================
// Transport seam
// ============================================================================

/// One provider call: the conversation so far, and optionally the functions
/// the model may request.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub functions: Option<&'a [FunctionDefinition]>,
}

impl CompletionRequest<'_> {
    /// Functions to advertise, if any were offered.
    #[must_use]
    pub fn offered_functions(&self) -> Option<&[FunctionDefinition]> {
        self.functions.filter(|f| !f.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Connection(#[source] reqwest::Error),
    #[error("API error {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("provider error: {0}")]
    Api(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("stream idle timeout")]
    IdleTimeout,
    #[error("connection closed before stream completed")]
    PrematureEof,
}

impl TransportError {
    /// Server-requested delay before retrying, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Lazy sequence of streamed text fragments. Not restartable.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// A chat completion backend.
///
/// Object safe so the driver can hold `Box<dyn Transport>` as readily as a
/// concrete client.
pub trait Transport: Send + Sync {
    /// Single blocking call returning either an answer or a function call.
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> TransportFuture<'a, Completion>;

    /// Open a streaming call. Resolves once the provider accepted the request.
    fn complete_streaming<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> TransportFuture<'a, FragmentStream>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> TransportFuture<'a, Completion> {
        (**self).complete(request)
    }

    fn complete_streaming<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> TransportFuture<'a, FragmentStream> {
        (**self).complete_streaming(request)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> TransportFuture<'a, Completion> {
        (**self).complete(request)
    }

    fn complete_streaming<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> TransportFuture<'a, FragmentStream> {
        (**self).complete_streaming(request)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> TransportFuture<'a, Completion> {
        (**self).complete(request)
    }

    fn complete_streaming<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> TransportFuture<'a, FragmentStream> {
        (**self).complete_streaming(request)
    }
}

// ============================================================================
// HTTP client
// ============================================================================

/// Shared HTTP client. Plain `http://` base URLs stay allowed so local
/// OpenAI-compatible servers work.
pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        base_client_builder().build().unwrap_or_else(|e| {
            tracing::error!("Failed to build configured HTTP client: {e}. Using defaults.");
            reqwest::Client::new()
        })
    })
}

fn base_client_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .user_agent(concat!("gee/", env!("CARGO_PKG_VERSION")))
}

pub(crate) fn stream_idle_timeout() -> Duration {
    static TIMEOUT: OnceLock<Duration> = OnceLock::new();
    *TIMEOUT.get_or_init(|| {
        let timeout = std::env::var("GEE_STREAM_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_STREAM_IDLE_TIMEOUT_SECS);
        Duration::from_secs(timeout)
    })
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

// ============================================================================
// SSE framing
// ============================================================================

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseParseAction {
    /// Nothing to yield for this event.
    Continue,
    Emit(String),
    /// Yield this fragment, then end the stream.
    EmitAndFinish(String),
    /// Provider signalled completion.
    Done,
    Error(String),
}

pub(crate) trait SseParser: Send + 'static {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;
    fn provider_name(&self) -> &'static str;
}

type ByteSource = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

struct SseFragments<P> {
    source: ByteSource,
    parser: P,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, TransportError>>,
    parse_errors: usize,
    idle_timeout: Duration,
    finished: bool,
}

impl<P: SseParser> SseFragments<P> {
    fn finish_with(&mut self, item: Result<String, TransportError>) {
        self.finished = true;
        self.pending.push_back(item);
    }

    /// Parse every complete event currently buffered. Returns once something
    /// is queued or the buffer holds no complete event.
    fn drain_buffer(&mut self) {
        while self.pending.is_empty() && !self.finished {
            let Some(event) = drain_next_sse_event(&mut self.buffer) else {
                return;
            };
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                self.finish_with(Err(TransportError::Malformed(
                    "received invalid UTF-8 from SSE stream".to_string(),
                )));
                return;
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                self.finished = true;
                return;
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    self.parse_errors = 0;
                    match self.parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(text) => self.pending.push_back(Ok(text)),
                        SseParseAction::EmitAndFinish(text) => self.finish_with(Ok(text)),
                        SseParseAction::Done => self.finished = true,
                        SseParseAction::Error(msg) => {
                            self.finish_with(Err(TransportError::Api(msg)));
                        }
                    }
                }
                Err(e) => {
                    self.parse_errors = self.parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = self.parser.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if self.parse_errors >= MAX_SSE_PARSE_ERRORS {
                        self.finish_with(Err(TransportError::Malformed(format!(
                            "invalid stream payload: {e}"
                        ))));
                    }
                }
            }
        }
    }

    async fn next_fragment(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            self.drain_buffer();
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }

            let Ok(next) = tokio::time::timeout(self.idle_timeout, self.source.next()).await else {
                self.finished = true;
                return Some(Err(TransportError::IdleTimeout));
            };

            match next {
                Some(Ok(chunk)) => {
                    self.buffer.extend_from_slice(&chunk);
                    if self.buffer.len() > MAX_SSE_BUFFER_BYTES {
                        self.finished = true;
                        return Some(Err(TransportError::Malformed(
                            "SSE buffer exceeded maximum size (4 MiB)".to_string(),
                        )));
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    return Some(Err(TransportError::PrematureEof));
                }
            }
        }
    }
}

/// Turn a raw SSE byte stream into text fragments using `parser`.
///
/// Ends after `[DONE]`, a parser completion signal, or the first error.
pub(crate) fn sse_fragments<S, P>(source: S, parser: P, idle_timeout: Duration) -> FragmentStream
where
    S: Stream<Item = Result<Vec<u8>, TransportError>> + Send + 'static,
    P: SseParser,
{
    let state = SseFragments {
        source: Box::pin(source),
        parser,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        parse_errors: 0,
        idle_timeout,
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        let item = state.next_fragment().await?;
        Some((item, state))
    }))
}
