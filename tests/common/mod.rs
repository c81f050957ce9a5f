//! Shared test utilities and fixtures
//!
//! Mock OpenAI responses and a driver wired to a mock server.

#![allow(dead_code)]

use gee_engine::{DriverConfig, Message, OpenAITransport, RequestDriver, Role};
use gee_providers::retry::RetryConfig;
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const CHAT_PATH: &str = "/v1/chat/completions";

pub fn base_url(server: &MockServer) -> String {
    format!("{}/v1", server.uri())
}

/// Driver against `server` that retries without sleeping.
pub fn driver(server: &MockServer) -> RequestDriver<OpenAITransport> {
    let transport = OpenAITransport::new("test-key", base_url(server));
    RequestDriver::new(
        transport,
        DriverConfig {
            retry: RetryConfig::immediate(),
            ..DriverConfig::default()
        },
    )
}

pub fn answer_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop"
        }]
    })
}

pub fn function_call_body(name: &str, arguments: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": null,
                "function_call": { "name": name, "arguments": arguments }
            },
            "finish_reason": "function_call"
        }]
    })
}

/// Server-sent events carrying `fragments` as chat completion chunks.
pub fn sse_body(fragments: &[&str]) -> String {
    let mut body = String::new();
    for fragment in fragments {
        let chunk = json!({ "choices": [{ "index": 0, "delta": { "content": fragment } }] });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

pub async fn mount_answer(server: &MockServer, content: &str) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer_body(content)))
        .mount(server)
        .await;
}

pub async fn mount_stream(server: &MockServer, fragments: &[&str]) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(fragments)),
        )
        .mount(server)
        .await;
}

/// JSON bodies of every request the server received, in order.
pub async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

pub fn roles(messages: &[Message]) -> Vec<Role> {
    messages.iter().map(Message::role).collect()
}

pub fn contents(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(Message::content).collect()
}

/// One token per character, so budgets in tests are easy to reason about.
pub struct Chars;

impl gee_types::Tokenizer for Chars {
    fn encode(&self, text: &str) -> Result<Vec<gee_types::TokenId>, gee_types::TokenizationError> {
        Ok(text.chars().map(u32::from).collect())
    }

    fn decode(&self, tokens: &[gee_types::TokenId]) -> Result<String, gee_types::TokenizationError> {
        Ok(tokens.iter().filter_map(|t| char::from_u32(*t)).collect())
    }
}
