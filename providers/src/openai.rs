//! OpenAI Chat Completions client.
//!
//! Talks to `POST {base_url}/chat/completions`. Works with any server that
//! speaks the same protocol; the base URL is configurable.
//!
//! Function calling uses the `functions` / `function_call: "auto"` request
//! fields. A response whose message carries `function_call` becomes
//! [`Completion::FunctionCall`]; anything else is the final answer.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};

use gee_types::{Completion, FunctionCall, Message};

use crate::retry::parse_retry_after;
use crate::{
    CompletionRequest, FragmentStream, SseParseAction, SseParser, Transport, TransportError,
    TransportFuture, http_client, read_capped_error_body, sse_fragments, stream_idle_timeout,
};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAITransport {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl std::fmt::Debug for OpenAITransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAITransport")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl OpenAITransport {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            client: http_client().clone(),
            idle_timeout: stream_idle_timeout(),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Send one request; non-2xx statuses become [`TransportError::Status`].
    async fn send(&self, body: &Value) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(TransportError::Connection)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = read_capped_error_body(response).await;
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }
        Ok(response)
    }
}

fn message_json(message: &Message) -> Value {
    let mut value = json!({
        "role": message.role().as_str(),
        "content": message.content(),
    });
    if let Some(name) = message.name() {
        value["name"] = json!(name);
    }
    value
}

pub(crate) fn build_request_body(request: &CompletionRequest<'_>, stream: bool) -> Value {
    let messages: Vec<Value> = request.messages.iter().map(message_json).collect();
    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if let Some(functions) = request.offered_functions() {
        let functions: Vec<Value> = functions.iter().map(|f| f.to_json()).collect();
        body["functions"] = json!(functions);
        body["function_call"] = json!("auto");
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

pub(crate) fn parse_completion(body: &Value) -> Result<Completion, TransportError> {
    let message = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .ok_or_else(|| TransportError::Malformed("response has no choices[0].message".into()))?;

    if let Some(call) = message.get("function_call").filter(|v| !v.is_null()) {
        let name = call
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TransportError::Malformed("function_call without a name".into()))?;
        let arguments = call.get("arguments").and_then(Value::as_str).unwrap_or("");
        return Ok(Completion::FunctionCall(FunctionCall::new(name, arguments)));
    }

    let content = match message.get("content") {
        None | Some(Value::Null) => "",
        Some(Value::String(text)) => text.as_str(),
        Some(other) => {
            return Err(TransportError::Malformed(format!(
                "unexpected message content: {other}"
            )));
        }
    };
    Ok(Completion::Answer(Message::assistant(content)))
}

// ========================================================================
// SSE parser
// ========================================================================

#[derive(Debug, Default)]
struct ChatChunkParser;

impl SseParser for ChatChunkParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        if let Some(error) = json.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            return SseParseAction::Error(message);
        }

        let Some(choice) = json.get("choices").and_then(|c| c.get(0)) else {
            return SseParseAction::Continue;
        };
        let content = choice
            .get("delta")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty());
        let finished = choice.get("finish_reason").is_some_and(|r| !r.is_null());

        match (content, finished) {
            (Some(text), false) => SseParseAction::Emit(text.to_string()),
            (Some(text), true) => SseParseAction::EmitAndFinish(text.to_string()),
            (None, true) => SseParseAction::Done,
            (None, false) => SseParseAction::Continue,
        }
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

impl Transport for OpenAITransport {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> TransportFuture<'a, Completion> {
        Box::pin(async move {
            let body = build_request_body(&request, false);
            tracing::debug!(
                model = request.model,
                messages = request.messages.len(),
                functions = request.offered_functions().map_or(0, <[_]>::len),
                "Sending chat completion"
            );

            let response = self.send(&body).await?;
            let bytes = response.bytes().await.map_err(TransportError::Connection)?;
            let value: Value = serde_json::from_slice(&bytes)
                .map_err(|e| TransportError::Malformed(format!("invalid JSON body: {e}")))?;
            parse_completion(&value)
        })
    }

    fn complete_streaming<'a>(
        &'a self,
        request: CompletionRequest<'a>,
    ) -> TransportFuture<'a, FragmentStream> {
        Box::pin(async move {
            let body = build_request_body(&request, true);
            tracing::debug!(
                model = request.model,
                messages = request.messages.len(),
                "Opening streaming chat completion"
            );

            let response = self.send(&body).await?;
            let source = response.bytes_stream().map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(TransportError::Connection)
            });
            Ok(sse_fragments(source, ChatChunkParser, self.idle_timeout))
        })
    }
}
