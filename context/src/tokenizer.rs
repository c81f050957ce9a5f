//! Token counting using tiktoken.
//!
//! Uses the `cl100k_base` encoding, which matches the GPT-3.5/GPT-4 chat model
//! family this client talks to. Other models may tokenize differently, so
//! budgets computed here are exact only for that family.

use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, cl100k_base};

use gee_types::{TokenId, TokenizationError, Tokenizer};

/// The tiktoken encoder is expensive to initialize (loads vocabulary data),
/// so we create it once and reuse it across all `TiktokenTokenizer` instances.
static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| cl100k_base().ok()).as_ref()
}

/// Thread-safe tokenizer backed by tiktoken's `cl100k_base` encoding.
///
/// Uses a singleton encoder instance for efficiency. If the encoder fails to
/// load, every call returns [`TokenizationError::Unavailable`] rather than
/// guessing; budgets built on estimates could overflow the model's window.
///
/// # Example
///
/// ```
/// use gee_context::TiktokenTokenizer;
/// use gee_types::Tokenizer;
///
/// let tokenizer = TiktokenTokenizer::new();
/// let tokens = tokenizer.encode("Hello, world!").unwrap();
/// assert_eq!(tokenizer.decode(&tokens).unwrap(), "Hello, world!");
/// ```
#[derive(Clone, Copy)]
pub struct TiktokenTokenizer {
    encoder: Option<&'static CoreBPE>,
}

impl std::fmt::Debug for TiktokenTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenTokenizer")
            .field("encoder", &self.encoder.as_ref().map(|_| "<CoreBPE>"))
            .finish()
    }
}

impl TiktokenTokenizer {
    #[must_use]
    pub fn new() -> Self {
        let encoder = get_encoder();
        if encoder.is_none() {
            tracing::error!("Failed to initialize tiktoken cl100k_base encoder");
        }

        Self { encoder }
    }

    fn encoder(&self) -> Result<&'static CoreBPE, TokenizationError> {
        self.encoder.ok_or_else(|| {
            TokenizationError::Unavailable("cl100k_base encoder failed to load".to_string())
        })
    }
}

impl Default for TiktokenTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for TiktokenTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizationError> {
        Ok(self.encoder()?.encode_ordinary(text))
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<String, TokenizationError> {
        self.encoder()?
            .decode(tokens.to_vec())
            .map_err(|e| TokenizationError::Decode {
                count: tokens.len(),
                message: e.to_string(),
            })
    }
}
