//! Core message domain model.
//!
//! A `Message` is immutable once built: there is no content setter, so the
//! lazily computed token sequence can never go stale.

use std::fmt;
use std::sync::OnceLock;

use crate::tokenizer::{TokenId, TokenizationError, Tokenizer};

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result of a locally executed function, fed back to the model.
    Function,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::System, Role::User, Role::Assistant, Role::Function];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }

    /// Parse a role from its wire name. Exact, lowercase match only.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.as_str() == raw)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single role-tagged conversation entry.
///
/// Two messages with identical fields are still distinct values; the type
/// deliberately has no `PartialEq`.
#[derive(Debug, Clone)]
pub struct Message {
    role: Role,
    content: String,
    name: Option<String>,
    tokens: OnceLock<Vec<TokenId>>,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>, name: Option<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name,
            tokens: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, None)
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, None)
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, None)
    }

    #[must_use]
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::Function, content, Some(name.into()))
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Token sequence for `content`, encoded on first access and cached.
    pub fn tokens(&self, tokenizer: &dyn Tokenizer) -> Result<&[TokenId], TokenizationError> {
        if let Some(tokens) = self.tokens.get() {
            return Ok(tokens);
        }
        let encoded = tokenizer.encode(&self.content)?;
        Ok(self.tokens.get_or_init(|| encoded))
    }

    pub fn token_count(&self, tokenizer: &dyn Tokenizer) -> Result<u32, TokenizationError> {
        let len = self.tokens(tokenizer)?.len();
        Ok(u32::try_from(len).unwrap_or(u32::MAX))
    }

    /// Token count if it has already been computed.
    #[must_use]
    pub fn cached_token_count(&self) -> Option<u32> {
        self.tokens
            .get()
            .map(|tokens| u32::try_from(tokens.len()).unwrap_or(u32::MAX))
    }

    /// A new message with the same role and name but different content.
    ///
    /// The token cache is not carried over.
    #[must_use]
    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self::new(self.role, content, self.name.clone())
    }
}
