//! Request orchestration for gee.
//!
//! This crate turns a question plus a stored conversation into provider calls:
//! it fits history to the token budget, adds the system prompt, retries
//! transport failures, and runs the function-calling loop. It has no terminal
//! or filesystem-layout knowledge; the CLI owns those.

mod config;
mod driver;
mod functions;

// ============================================================================
// Requests
// ============================================================================

pub use driver::{
    AskError, AskRequest, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_FUNCTION_CALLS, DEFAULT_MODEL,
    DriverConfig, RequestDriver, StreamingAnswer,
};

// ============================================================================
// Function calling
// ============================================================================

pub use functions::{DuplicateFunction, FunctionSet, LlmFunction};

// ============================================================================
// Configuration
// ============================================================================

pub use config::{
    AppConfig, ConfigError, ContextConfig, GeeConfig, OpenAIConfig, RequestConfig, config_path,
    default_data_dir, expand_env_vars,
};

// Re-exports so the binary needs only this crate for the common path.
pub use gee_context::{self, HistoryStore, StoreError};
pub use gee_providers::{self, Transport, TransportError, openai::OpenAITransport};
pub use gee_types::{self, Message, Role};
