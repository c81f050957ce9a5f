//! Request driver: budget fitting, system prompt handling, retries, and the
//! function-calling loop around a [`Transport`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};

use gee_context::{TiktokenTokenizer, TokenBudget, fit};
use gee_providers::retry::{RetryConfig, with_retries};
use gee_providers::{CompletionRequest, FragmentStream, Transport, TransportError};
use gee_types::{Completion, FunctionDefinition, Message, Role, TokenizationError, Tokenizer};

use crate::functions::FunctionSet;

pub const DEFAULT_MODEL: &str = "gpt-4";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_FUNCTION_CALLS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum AskError {
    #[error(transparent)]
    Tokenization(#[from] TokenizationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("model requested unknown function `{name}`")]
    UnknownFunction { name: String },
    #[error("function `{name}` failed")]
    FunctionFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("model kept calling functions after {limit} calls")]
    TooManyFunctionCalls { limit: u32 },
}

/// Defaults applied to every request unless the call site overrides them.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub model: String,
    /// Total token budget for a request; `<= 0` disables trimming.
    pub max_tokens: i64,
    pub max_attempts: u32,
    pub max_function_calls: u32,
    pub retry: RetryConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: -1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_function_calls: DEFAULT_MAX_FUNCTION_CALLS,
            retry: RetryConfig::default(),
        }
    }
}

/// One question to the model plus everything that shapes the request.
///
/// `None` overrides fall back to the driver's [`DriverConfig`].
#[derive(Debug)]
pub struct AskRequest<'a, C = ()> {
    pub query: &'a str,
    pub context: &'a [Message],
    pub system_prompt: Option<&'a str>,
    pub model: Option<&'a str>,
    pub functions: Option<&'a FunctionSet<C>>,
    pub function_context: &'a C,
    pub max_tokens: Option<i64>,
    pub max_attempts: Option<u32>,
    pub max_function_calls: Option<u32>,
}

impl<'a> AskRequest<'a, ()> {
    #[must_use]
    pub fn new(query: &'a str) -> Self {
        Self {
            query,
            context: &[],
            system_prompt: None,
            model: None,
            functions: None,
            function_context: &(),
            max_tokens: None,
            max_attempts: None,
            max_function_calls: None,
        }
    }
}

impl<'a, C> AskRequest<'a, C> {
    #[must_use]
    pub fn context(mut self, context: &'a [Message]) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: &'a str) -> Self {
        self.system_prompt = Some(prompt);
        self
    }

    #[must_use]
    pub fn model(mut self, model: &'a str) -> Self {
        self.model = Some(model);
        self
    }

    #[must_use]
    pub fn max_tokens(mut self, max_tokens: i64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub fn max_function_calls(mut self, limit: u32) -> Self {
        self.max_function_calls = Some(limit);
        self
    }

    /// Offer `functions` to the model; `context` is handed to each invocation.
    #[must_use]
    pub fn functions<D>(self, functions: &'a FunctionSet<D>, context: &'a D) -> AskRequest<'a, D> {
        AskRequest {
            query: self.query,
            context: self.context,
            system_prompt: self.system_prompt,
            model: self.model,
            functions: Some(functions),
            function_context: context,
            max_tokens: self.max_tokens,
            max_attempts: self.max_attempts,
            max_function_calls: self.max_function_calls,
        }
    }
}

/// Result of [`RequestDriver::ask_streaming`].
///
/// Yields text fragments as they arrive and remembers everything consumed, so
/// a caller that stops early still gets a consistent history from
/// [`StreamingAnswer::into_history`].
pub struct StreamingAnswer {
    history: Vec<Message>,
    fragments: FragmentStream,
    received: String,
}

impl StreamingAnswer {
    /// Messages sent with the request, ending with the user query.
    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Text consumed so far.
    #[must_use]
    pub fn received(&self) -> &str {
        &self.received
    }

    /// Stop consuming and append the (possibly partial) assistant message.
    #[must_use]
    pub fn into_history(self) -> Vec<Message> {
        let Self {
            mut history,
            received,
            ..
        } = self;
        history.push(Message::assistant(received));
        history
    }

    /// Consume the remaining fragments and return the full answer along with
    /// the completed history.
    pub async fn finish(mut self) -> Result<(String, Vec<Message>), AskError> {
        while let Some(fragment) = self.next().await {
            fragment?;
        }
        let answer = self.received.clone();
        Ok((answer, self.into_history()))
    }
}

impl Stream for StreamingAnswer {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let poll = self.fragments.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(fragment))) = &poll {
            self.received.push_str(fragment);
        }
        poll
    }
}

impl std::fmt::Debug for StreamingAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAnswer")
            .field("history", &self.history.len())
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

/// Drives requests against a transport with a fixed tokenizer and defaults.
pub struct RequestDriver<T> {
    transport: T,
    tokenizer: Arc<dyn Tokenizer>,
    config: DriverConfig,
}

impl<T: Transport> RequestDriver<T> {
    pub fn new(transport: T, config: DriverConfig) -> Self {
        Self {
            transport,
            tokenizer: Arc::new(TiktokenTokenizer::new()),
            config,
        }
    }

    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: impl Tokenizer + 'static) -> Self {
        self.tokenizer = Arc::new(tokenizer);
        self
    }

    #[must_use]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Build the message list for a request: fitted context, optional system
    /// prompt, then the user query.
    fn prepare<C>(&self, request: &AskRequest<'_, C>) -> Result<Vec<Message>, AskError> {
        let tokenizer = self.tokenizer.as_ref();
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);

        let budget = if max_tokens > 0 {
            let query_tokens = tokenizer.count(request.query)?;
            let system_tokens = match request.system_prompt {
                Some(prompt) => tokenizer.count(prompt)?,
                None => 0,
            };
            let remaining = max_tokens - i64::from(query_tokens) - i64::from(system_tokens);
            TokenBudget::Limited(u32::try_from(remaining.max(0)).unwrap_or(u32::MAX))
        } else {
            TokenBudget::Unbounded
        };

        let mut messages = fit(request.context, budget, tokenizer)?;

        if let Some(prompt) = request.system_prompt.filter(|p| !p.is_empty())
            && request
                .context
                .first()
                .is_some_and(|first| first.role() != Role::System)
        {
            messages.insert(0, Message::system(prompt));
        }

        messages.push(Message::user(request.query));
        Ok(messages)
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        functions: Option<&[FunctionDefinition]>,
        max_attempts: u32,
    ) -> Result<Completion, TransportError> {
        with_retries(max_attempts, &self.config.retry, move |_| {
            self.transport.complete(CompletionRequest {
                model,
                messages,
                functions,
            })
        })
        .await
    }

    /// Ask a question and wait for the final answer, running any functions
    /// the model calls along the way.
    ///
    /// Returns the answer text and the full history sent to the model with
    /// every function result and the final assistant message appended.
    pub async fn ask<C>(
        &self,
        request: AskRequest<'_, C>,
    ) -> Result<(String, Vec<Message>), AskError> {
        let model = request.model.unwrap_or(&self.config.model);
        let max_attempts = request.max_attempts.unwrap_or(self.config.max_attempts);
        let limit = request
            .max_function_calls
            .unwrap_or(self.config.max_function_calls);
        let definitions = request
            .functions
            .map(FunctionSet::definitions)
            .filter(|d| !d.is_empty());

        let mut messages = self.prepare(&request)?;
        let mut calls: u32 = 0;

        loop {
            let completion = self
                .complete(model, &messages, definitions, max_attempts)
                .await?;

            let call = match completion {
                Completion::Answer(answer) => {
                    let content = answer.content().to_string();
                    messages.push(answer);
                    tracing::debug!(
                        model,
                        function_calls = calls,
                        messages = messages.len(),
                        "Request answered"
                    );
                    return Ok((content, messages));
                }
                Completion::FunctionCall(call) => call,
            };

            let Some(functions) = request.functions else {
                return Err(AskError::UnknownFunction { name: call.name });
            };
            if calls >= limit {
                return Err(AskError::TooManyFunctionCalls { limit });
            }
            calls += 1;

            let result = functions.dispatch(&call, request.function_context)?;
            messages.push(result);
        }
    }

    /// Ask a question and stream the answer. No function calling.
    ///
    /// Only opening the stream is retried; once fragments flow, a failure is
    /// delivered through the stream.
    pub async fn ask_streaming(
        &self,
        request: AskRequest<'_, ()>,
    ) -> Result<StreamingAnswer, AskError> {
        let model = request.model.unwrap_or(&self.config.model);
        let max_attempts = request.max_attempts.unwrap_or(self.config.max_attempts);
        let history = self.prepare(&request)?;

        let messages = history.as_slice();
        let fragments = with_retries(max_attempts, &self.config.retry, move |_| {
            self.transport.complete_streaming(CompletionRequest {
                model,
                messages,
                functions: None,
            })
        })
        .await?;

        Ok(StreamingAnswer {
            history,
            fragments,
            received: String::new(),
        })
    }
}

impl<T> std::fmt::Debug for RequestDriver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDriver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
