//! Context window fitting.
//!
//! Produces the longest suffix of a conversation that fits a token budget.
//! The oldest retained message may be cut down to its most recent tokens;
//! everything older than it is dropped.

use gee_types::{Message, TokenId, TokenizationError, Tokenizer};

/// Token budget for the retained history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenBudget {
    /// No trimming; the caller opted out.
    Unbounded,
    Limited(u32),
}

impl TokenBudget {
    /// Interpret an integer limit: any value `<= 0` means unbounded.
    #[must_use]
    pub fn from_limit(limit: i64) -> Self {
        if limit <= 0 {
            Self::Unbounded
        } else {
            Self::Limited(u32::try_from(limit).unwrap_or(u32::MAX))
        }
    }
}

/// Fit `history` into `budget` tokens.
///
/// Walks from newest to oldest, keeping whole messages while they fit. The
/// first message that does not fit is either dropped (no tokens left) or
/// replaced by a copy holding only its last `left` tokens; nothing older is
/// kept. The input is never modified.
pub fn fit(
    history: &[Message],
    budget: TokenBudget,
    tokenizer: &dyn Tokenizer,
) -> Result<Vec<Message>, TokenizationError> {
    let max_tokens = match budget {
        TokenBudget::Unbounded => return Ok(history.to_vec()),
        TokenBudget::Limited(max) => max,
    };

    let mut used: u32 = 0;
    let mut kept: Vec<Message> = Vec::new();

    for message in history.iter().rev() {
        let tokens = message.tokens(tokenizer)?;
        let count = u32::try_from(tokens.len()).unwrap_or(u32::MAX);

        if used.saturating_add(count) <= max_tokens {
            kept.push(message.clone());
            used += count;
            continue;
        }

        let left = max_tokens - used;
        if left > 0 {
            match decode_suffix(tokens, left as usize, tokenizer)? {
                Some(truncated) => {
                    tracing::debug!(
                        role = %message.role(),
                        original_tokens = count,
                        kept_tokens = left,
                        "Split oldest retained message to fit budget"
                    );
                    kept.push(message.with_content(truncated));
                }
                None => tracing::debug!(
                    role = %message.role(),
                    kept_tokens = left,
                    "Dropped oldest message; its last tokens do not form whole characters"
                ),
            }
        }
        break;
    }

    kept.reverse();
    tracing::debug!(
        input = history.len(),
        kept = kept.len(),
        max_tokens,
        "Fitted history to token budget"
    );
    Ok(kept)
}

/// Decode the last `keep` tokens of `tokens`.
///
/// A cut can land inside a multi-byte character, which leaves the first token
/// undecodable on its own. In that case leading tokens are dropped until the
/// rest decodes, so the result never exceeds `keep` tokens. `None` when no
/// suffix decodes, e.g. the cut falls inside the final character.
fn decode_suffix(
    tokens: &[TokenId],
    keep: usize,
    tokenizer: &dyn Tokenizer,
) -> Result<Option<String>, TokenizationError> {
    for start in tokens.len().saturating_sub(keep)..tokens.len() {
        match tokenizer.decode(&tokens[start..]) {
            Ok(text) => return Ok(Some(text)),
            Err(TokenizationError::Decode { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}
