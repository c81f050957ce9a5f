//! gee CLI - chat with an LLM from the terminal.
//!
//! ```text
//! main() -> Settings::resolve(args, config) -> load stream -> chat loop
//!                                                               |
//!                                        prompt -> ask_streaming -> stdout
//!                                                               |
//!                                               save stream + write log
//! ```
//!
//! Answers stream to stdout as they arrive. Ctrl-C stops the current answer,
//! keeps what was received, and ends the session after saving.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use gee_engine::{
    AskRequest, DriverConfig, GeeConfig, HistoryStore, Message, OpenAITransport, RequestDriver,
    Transport,
};

const LOG_FILE_NAME: &str = "gee.log";

#[derive(Debug, Parser)]
#[command(
    name = "gee",
    version,
    about = "Chat with an LLM, keeping named conversation streams"
)]
struct Args {
    /// List saved streams and exit.
    #[arg(long)]
    list: bool,

    /// Load the conversation from this stream and save it back after each answer.
    #[arg(short, long, value_name = "NAME")]
    stream: Option<String>,

    /// System prompt sent ahead of the conversation.
    #[arg(long, value_name = "TEXT")]
    system: Option<String>,

    #[arg(short, long, value_name = "NAME")]
    model: Option<String>,

    /// Do not write a log of each exchange.
    #[arg(long)]
    no_log: bool,

    /// Keep asking for prompts after answering the one given on the command line.
    #[arg(short, long)]
    interactive: bool,

    /// Where streams and logs live (default: ~/.gee).
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Token budget for the whole request; zero or negative sends everything.
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    max_tokens: Option<i64>,

    /// Initial prompt.
    #[arg(trailing_var_arg = true, value_name = "PROMPT")]
    prompt: Vec<String>,
}

/// Effective settings after applying CLI flags over the config file.
#[derive(Debug)]
struct Settings {
    data_dir: PathBuf,
    stream: Option<String>,
    system_prompt: Option<String>,
    prompt: Option<String>,
    one_shot: bool,
    log: bool,
    driver: DriverConfig,
}

impl Settings {
    fn resolve(args: &Args, config: &GeeConfig) -> Result<Self> {
        let data_dir = match &args.data_dir {
            Some(dir) => dir.clone(),
            None => config
                .data_dir()
                .context("could not determine a data directory; pass --data-dir")?,
        };

        let prompt = Some(args.prompt.join(" ")).filter(|p| !p.trim().is_empty());

        let mut driver = config.driver_config();
        if let Some(model) = args.model.as_ref().filter(|m| !m.is_empty()) {
            driver.model.clone_from(model);
        }
        if let Some(max_tokens) = args.max_tokens {
            driver.max_tokens = max_tokens;
        }

        Ok(Self {
            data_dir,
            stream: args.stream.clone(),
            system_prompt: args
                .system
                .clone()
                .filter(|s| !s.is_empty())
                .or_else(|| config.system_prompt()),
            one_shot: prompt.is_some() && !args.interactive,
            prompt,
            log: !args.no_log && config.log_enabled(),
            driver,
        })
    }
}

fn init_tracing(data_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    match open_log_file(data_dir) {
        Ok((log_path, file)) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(env_filter)
                .init();
            tracing::info!(path = %log_path.display(), "Logging initialized");
        }
        // Stdout carries the answer; prefer no logs over interleaving them.
        Err(_) => tracing_subscriber::registry().with(env_filter).init(),
    }
}

fn open_log_file(data_dir: &Path) -> io::Result<(PathBuf, fs::File)> {
    fs::create_dir_all(data_dir)?;
    let path = data_dir.join(LOG_FILE_NAME);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

fn is_quit(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "quit" | "exit")
}

/// Prompt on stdout and read the next non-empty line. `None` on end of input
/// or Ctrl-C.
async fn read_prompt(lines: &mut Lines<BufReader<Stdin>>) -> Result<Option<String>> {
    loop {
        print!("Enter prompt: ");
        io::stdout().flush()?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                None
            }
        };
        match line {
            Some(line) if line.trim().is_empty() => {}
            Some(line) => return Ok(Some(line)),
            None => return Ok(None),
        }
    }
}

/// Outcome of one streamed answer.
enum Turn {
    Answered(Vec<Message>),
    /// Ctrl-C after fragments started; holds the partial answer.
    Interrupted(Vec<Message>),
    /// Ctrl-C before the stream opened; nothing to record.
    Cancelled,
}

async fn stream_answer<T: Transport>(
    driver: &RequestDriver<T>,
    settings: &Settings,
    history: &[Message],
    query: &str,
) -> Result<Turn> {
    let mut request = AskRequest::new(query).context(history);
    if let Some(prompt) = settings.system_prompt.as_deref() {
        request = request.system_prompt(prompt);
    }

    // Opening may spend several seconds in retry backoff.
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    let mut stdout = io::stdout();
    let mut answer = tokio::select! {
        opened = driver.ask_streaming(request) => opened?,
        _ = &mut interrupt => {
            writeln!(stdout)?;
            tracing::info!("Request cancelled before the answer started");
            return Ok(Turn::Cancelled);
        }
    };

    let interrupted = loop {
        tokio::select! {
            fragment = answer.next() => match fragment {
                Some(Ok(text)) => {
                    stdout.write_all(text.as_bytes())?;
                    stdout.flush()?;
                }
                Some(Err(err)) => {
                    writeln!(stdout)?;
                    return Err(err.into());
                }
                None => break false,
            },
            _ = &mut interrupt => break true,
        }
    };
    writeln!(stdout)?;

    if interrupted {
        tracing::info!(
            received_bytes = answer.received().len(),
            "Answer interrupted"
        );
        return Ok(Turn::Interrupted(answer.into_history()));
    }
    Ok(Turn::Answered(answer.into_history()))
}

fn persist(store: &HistoryStore, settings: &Settings, history: &[Message]) {
    if let Some(name) = settings.stream.as_deref()
        && let Err(err) = store.save_stream(name, history)
    {
        tracing::warn!(stream = name, "Failed to save stream: {err}");
        eprintln!("gee: failed to save stream `{name}`: {err}");
    }

    if settings.log
        && let Err(err) = store.write_log(history)
    {
        tracing::warn!("Failed to write log: {err}");
        eprintln!("gee: failed to write log: {err}");
    }
}

async fn chat<T: Transport>(
    driver: &RequestDriver<T>,
    store: &HistoryStore,
    settings: &Settings,
    mut history: Vec<Message>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = settings.prompt.clone();

    loop {
        let query = match pending.take() {
            Some(query) => query,
            None => match read_prompt(&mut lines).await? {
                Some(query) => query,
                None => break,
            },
        };

        if is_quit(&query) {
            println!("Goodbye!");
            break;
        }

        match stream_answer(driver, settings, &history, &query).await {
            Ok(Turn::Answered(updated)) => {
                history = updated;
                persist(store, settings, &history);
            }
            Ok(Turn::Interrupted(updated)) => {
                persist(store, settings, &updated);
                break;
            }
            Ok(Turn::Cancelled) => break,
            Err(err) if settings.one_shot => return Err(err),
            Err(err) => {
                tracing::warn!("Request failed: {err:#}");
                eprintln!("gee: {err:#}");
            }
        }

        if settings.one_shot {
            break;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = GeeConfig::load()?;
    let settings = Settings::resolve(&args, &config)?;

    init_tracing(&settings.data_dir);

    let store = HistoryStore::new(&settings.data_dir);

    if args.list {
        for name in store.list_streams()? {
            println!("{name}");
        }
        return Ok(());
    }

    let history = match settings.stream.as_deref() {
        Some(name) => store
            .load_stream(name)
            .with_context(|| format!("cannot load stream `{name}`"))?,
        None => Vec::new(),
    };
    tracing::info!(
        stream = settings.stream.as_deref().unwrap_or("-"),
        messages = history.len(),
        model = %settings.driver.model,
        "Session started"
    );

    let api_key = config
        .api_key()
        .context("no API key: set OPENAI_API_KEY or [openai] api_key in the config file")?;
    let transport = OpenAITransport::new(api_key, config.base_url());
    let driver = RequestDriver::new(transport, settings.driver.clone());

    chat(&driver, &store, &settings, history).await
}
