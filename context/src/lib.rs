//! Context window management and conversation persistence.
//!
//! This crate provides:
//! - Exact token counting via tiktoken (`cl100k_base`)
//! - Budget fitting that keeps the newest messages and splits the oldest one
//! - A durable JSON record format for histories
//! - Named streams and write-once logs on disk
//!
//! # Architecture
//!
//! ```text
//! HistoryStore
//! ├── streams/<name>.json   save_stream / load_stream / list_streams
//! └── logs/<stamp>.json     write_log
//!
//! fit(history, TokenBudget, &dyn Tokenizer) -> Vec<Message>
//! └── TiktokenTokenizer (process-wide encoder)
//! ```

mod atomic_write;
mod record;
mod store;
mod tokenizer;
mod window;

pub use record::{StoredMessage, decode_history, encode_history};
pub use store::{HistoryStore, StoreError};
pub use tokenizer::TiktokenTokenizer;
pub use window::{TokenBudget, fit};
