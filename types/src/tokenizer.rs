//! Tokenizer oracle seam.
//!
//! Token counts drive every budget decision, so the tokenizer is a trait here
//! and the concrete tiktoken adapter lives in `gee-context`.

use thiserror::Error;

/// A discrete token identifier produced by a [`Tokenizer`].
pub type TokenId = u32;

#[derive(Debug, Error)]
pub enum TokenizationError {
    #[error("tokenizer unavailable: {0}")]
    Unavailable(String),
    #[error("failed to decode {count} tokens: {message}")]
    Decode { count: usize, message: String },
}

/// Maps text to token identifiers and back.
///
/// Implementations must round-trip: `decode(encode(x)) == x` for any text the
/// application produces. Decoding an arbitrary slice of a valid sequence may
/// fail when the slice starts inside a multi-byte character.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizationError>;

    fn decode(&self, tokens: &[TokenId]) -> Result<String, TokenizationError>;

    fn count(&self, text: &str) -> Result<u32, TokenizationError> {
        let len = self.encode(text)?.len();
        Ok(u32::try_from(len).unwrap_or(u32::MAX))
    }
}

impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizationError> {
        (**self).encode(text)
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, TokenizationError> {
        (**self).decode(tokens)
    }
}
