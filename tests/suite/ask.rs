//! Request driver against a mock OpenAI endpoint

use crate::common::{
    CHAT_PATH, Chars, answer_body, contents, driver, function_call_body, mount_answer,
    mount_stream, request_bodies, roles,
};
use gee_engine::{AskError, AskRequest, FunctionSet, LlmFunction, Message, Role, TransportError};
use gee_types::FunctionParameter;
use serde_json::{Value, json};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn blocking_answer_appends_assistant_message() {
    let server = MockServer::start().await;
    mount_answer(&server, "Paris").await;

    let context = vec![
        Message::user("Remember: capitals quiz"),
        Message::assistant("Ready"),
    ];
    let (answer, history) = driver(&server)
        .ask(AskRequest::new("Capital of France?").context(&context))
        .await
        .unwrap();

    assert_eq!(answer, "Paris");
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert_eq!(history[3].content(), "Paris");

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["model"], "gpt-4");
    assert_eq!(
        bodies[0]["messages"],
        json!([
            { "role": "user", "content": "Remember: capitals quiz" },
            { "role": "assistant", "content": "Ready" },
            { "role": "user", "content": "Capital of France?" }
        ])
    );
    assert!(bodies[0].get("functions").is_none());
    assert!(bodies[0].get("stream").is_none());
}

struct Calculator {
    calls: std::sync::atomic::AtomicU32,
}

fn add() -> LlmFunction<Calculator> {
    LlmFunction::new(
        "add",
        "Add two integers",
        vec![
            FunctionParameter::new("a", "integer", "First addend").required(),
            FunctionParameter::new("b", "integer", "Second addend").required(),
        ],
        |args, calc: &Calculator| {
            calc.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let args: Value = serde_json::from_str(args)?;
            let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
            Ok(sum.to_string())
        },
    )
}

#[tokio::test]
async fn function_call_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(body_string_contains("\"role\":\"function\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(answer_body("2 + 3 = 5")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(function_call_body("add", r#"{"a":2,"b":3}"#)),
        )
        .mount(&server)
        .await;

    let functions = FunctionSet::new(vec![add()]).unwrap();
    let calc = Calculator {
        calls: std::sync::atomic::AtomicU32::new(0),
    };
    let (answer, history) = driver(&server)
        .ask(AskRequest::new("What is 2 + 3?").functions(&functions, &calc))
        .await
        .unwrap();

    assert_eq!(answer, "2 + 3 = 5");
    assert_eq!(calc.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Function, Role::Assistant]
    );
    assert_eq!(history[1].name(), Some("add"));
    assert_eq!(history[1].content(), "5");

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["function_call"], "auto");
    assert_eq!(bodies[0]["functions"][0]["name"], "add");
    assert_eq!(
        bodies[0]["functions"][0]["parameters"]["required"],
        json!(["a", "b"])
    );
    assert_eq!(
        bodies[1]["messages"][1],
        json!({ "role": "function", "name": "add", "content": "5" })
    );
}

#[tokio::test]
async fn runaway_function_calls_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(function_call_body("add", r#"{"a":1,"b":1}"#)),
        )
        .mount(&server)
        .await;

    let functions = FunctionSet::new(vec![add()]).unwrap();
    let calc = Calculator {
        calls: std::sync::atomic::AtomicU32::new(0),
    };
    let err = driver(&server)
        .ask(
            AskRequest::new("loop forever")
                .max_function_calls(2)
                .functions(&functions, &calc),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, AskError::TooManyFunctionCalls { limit: 2 }));
    assert_eq!(calc.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(request_bodies(&server).await.len(), 3);
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_answer(&server, "second time lucky").await;

    let (answer, _) = driver(&server)
        .ask(AskRequest::new("hello"))
        .await
        .unwrap();

    assert_eq!(answer, "second time lucky");
    assert_eq!(request_bodies(&server).await.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_surface_the_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("still broken"))
        .expect(3)
        .mount(&server)
        .await;

    let err = driver(&server)
        .ask(AskRequest::new("hello"))
        .await
        .unwrap_err();

    match err {
        AskError::Transport(TransportError::Status { status, body, .. }) => {
            assert_eq!(status, 500);
            assert!(body.contains("still broken"));
        }
        other => panic!("expected a status error, got {other:?}"),
    }
}

#[tokio::test]
async fn streaming_matches_blocking() {
    let streaming = MockServer::start().await;
    mount_stream(&streaming, &["The answer", " is", " 42."]).await;
    let blocking = MockServer::start().await;
    mount_answer(&blocking, "The answer is 42.").await;

    let context = vec![Message::user("Think hard"), Message::assistant("OK")];

    let streamed = driver(&streaming)
        .ask_streaming(AskRequest::new("What is the answer?").context(&context))
        .await
        .unwrap();
    let (streamed_answer, streamed_history) = streamed.finish().await.unwrap();

    let (answer, history) = driver(&blocking)
        .ask(AskRequest::new("What is the answer?").context(&context))
        .await
        .unwrap();

    assert_eq!(streamed_answer, answer);
    assert_eq!(contents(&streamed_history), contents(&history));
    assert_eq!(roles(&streamed_history), roles(&history));

    let bodies = request_bodies(&streaming).await;
    assert_eq!(bodies[0]["stream"], true);
}

#[tokio::test]
async fn history_is_trimmed_to_the_budget() {
    let server = MockServer::start().await;
    mount_answer(&server, "ok").await;

    let context = vec![Message::user("abcdef"), Message::assistant("xyz")];
    let (_, history) = driver(&server)
        .with_tokenizer(Chars)
        .ask(AskRequest::new("q").context(&context).max_tokens(5))
        .await
        .unwrap();

    // 5 - 1 for the query leaves 4: "xyz" whole plus the last char of "abcdef".
    assert_eq!(contents(&history), vec!["f", "xyz", "q", "ok"]);

    let bodies = request_bodies(&server).await;
    assert_eq!(
        bodies[0]["messages"],
        json!([
            { "role": "user", "content": "f" },
            { "role": "assistant", "content": "xyz" },
            { "role": "user", "content": "q" }
        ])
    );
}

#[tokio::test]
async fn system_prompt_leads_a_conversation_without_one() {
    let server = MockServer::start().await;
    mount_answer(&server, "ok").await;

    let context = vec![Message::user("earlier"), Message::assistant("reply")];
    driver(&server)
        .ask(
            AskRequest::new("now")
                .context(&context)
                .system_prompt("Be brief."),
        )
        .await
        .unwrap();

    let bodies = request_bodies(&server).await;
    assert_eq!(
        bodies[0]["messages"][0],
        json!({ "role": "system", "content": "Be brief." })
    );
    assert_eq!(bodies[0]["messages"].as_array().map(Vec::len), Some(4));
}
