//! The `gee` binary end to end, against a mock OpenAI endpoint

use std::path::Path;
use std::process::{Command, Output, Stdio};

use crate::common::{base_url, mount_stream, request_bodies};
use gee_context::HistoryStore;
use gee_types::Role;
use serde_json::json;
use wiremock::MockServer;

fn write_config(home: &Path, server: &MockServer) {
    let config_dir = home.join(".gee");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.toml"),
        format!(
            "[openai]\napi_key = \"test-key\"\nbase_url = \"{}\"\n",
            base_url(server)
        ),
    )
    .unwrap();
}

fn gee_command(home: &Path, args: &[String]) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_gee"));
    command
        .args(args)
        .env("HOME", home)
        .env_remove("OPENAI_API_KEY")
        .env_remove("RUST_LOG")
        .stdin(Stdio::null());
    command
}

/// Run `gee` with `home` as the home directory and a config pointing at
/// `server`. Stdin is closed.
async fn run_gee(home: &Path, server: &MockServer, args: &[&str]) -> Output {
    write_config(home, server);

    let home = home.to_path_buf();
    let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
    tokio::task::spawn_blocking(move || gee_command(&home, &args).output().unwrap())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn one_shot_prompt_streams_and_saves() {
    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    mount_stream(&server, &["Hello", ", ", "world"]).await;

    let output = run_gee(home.path(), &server, &["-s", "greetings", "say", "hello"]).await;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Hello, world\n");

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(
        bodies[0]["messages"],
        json!([{ "role": "user", "content": "say hello" }])
    );

    let store = HistoryStore::new(home.path().join(".gee"));
    let history = store.load_stream("greetings").unwrap();
    assert_eq!(
        history.iter().map(|m| m.role()).collect::<Vec<_>>(),
        vec![Role::User, Role::Assistant]
    );
    assert_eq!(history[1].content(), "Hello, world");

    let logs: Vec<_> = std::fs::read_dir(store.logs_dir()).unwrap().collect();
    assert_eq!(logs.len(), 1);
    assert!(home.path().join(".gee").join("gee.log").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn saved_stream_is_sent_as_context() {
    let home = tempfile::tempdir().unwrap();
    let data = home.path().join("data");
    let server = MockServer::start().await;
    mount_stream(&server, &["Blue."]).await;

    let store = HistoryStore::new(&data);
    store
        .save_stream(
            "colors",
            &[
                gee_types::Message::user("My favorite color is blue."),
                gee_types::Message::assistant("Noted."),
            ],
        )
        .unwrap();

    let output = run_gee(
        home.path(),
        &server,
        &[
            "--data-dir",
            data.to_str().unwrap(),
            "--no-log",
            "--system",
            "Answer in one word.",
            "-m",
            "gpt-4o",
            "-s",
            "colors",
            "What is my favorite color?",
        ],
    )
    .await;
    assert!(output.status.success());

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[0]["model"], "gpt-4o");
    assert_eq!(
        bodies[0]["messages"],
        json!([
            { "role": "system", "content": "Answer in one word." },
            { "role": "user", "content": "My favorite color is blue." },
            { "role": "assistant", "content": "Noted." },
            { "role": "user", "content": "What is my favorite color?" }
        ])
    );

    let saved = store.load_stream("colors").unwrap();
    assert_eq!(saved.len(), 5);
    assert_eq!(saved[0].role(), Role::System);
    assert_eq!(saved[4].content(), "Blue.");
    assert!(!store.logs_dir().exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn list_prints_stream_names() {
    let home = tempfile::tempdir().unwrap();
    let data = home.path().join("data");
    let server = MockServer::start().await;

    let store = HistoryStore::new(&data);
    store.save_stream("beta", &[]).unwrap();
    store.save_stream("alpha", &[]).unwrap();

    let output = run_gee(
        home.path(),
        &server,
        &["--data-dir", data.to_str().unwrap(), "--list"],
    )
    .await;
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "alpha\nbeta\n");
    assert!(request_bodies(&server).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_stream_aborts_startup() {
    let home = tempfile::tempdir().unwrap();
    let data = home.path().join("data");
    let server = MockServer::start().await;
    mount_stream(&server, &["unused"]).await;

    let streams = data.join("streams");
    std::fs::create_dir_all(&streams).unwrap();
    std::fs::write(streams.join("bad.json"), "not json").unwrap();

    let output = run_gee(
        home.path(),
        &server,
        &["--data-dir", data.to_str().unwrap(), "-s", "bad", "hello"],
    )
    .await;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("bad.json"), "stderr: {stderr}");
    assert!(request_bodies(&server).await.is_empty());
    assert_eq!(
        std::fs::read_to_string(streams.join("bad.json")).unwrap(),
        "not json"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn closed_stdin_ends_interactive_session() {
    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    let output = run_gee(home.path(), &server, &["-i"]).await;
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Enter prompt: ");
    assert!(request_bodies(&server).await.is_empty());
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn ctrl_c_while_waiting_for_the_answer_cancels_cleanly() {
    use std::time::Duration;
    use wiremock::matchers::method;
    use wiremock::{Mock, ResponseTemplate};

    let home = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(crate::common::sse_body(&["too late"]))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    write_config(home.path(), &server);

    let args = vec!["-s".to_string(), "slow".to_string(), "hello".to_string()];
    let child = gee_command(home.path(), &args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // Wait until the request is in flight.
    for _ in 0..100 {
        if !request_bodies(&server).await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(request_bodies(&server).await.len(), 1);

    let pid = libc::pid_t::try_from(child.id()).unwrap();
    // SAFETY: signalling a child process we spawned and still own.
    assert_eq!(unsafe { libc::kill(pid, libc::SIGINT) }, 0);

    let output = tokio::task::spawn_blocking(move || child.wait_with_output().unwrap())
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "status: {:?}, stderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(String::from_utf8_lossy(&output.stdout), "\n");

    let store = HistoryStore::new(home.path().join(".gee"));
    assert!(!store.stream_exists("slow").unwrap());
    assert!(!store.logs_dir().exists());
}
