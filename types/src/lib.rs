//! Core domain types for gee.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod function;
mod message;
mod tokenizer;

// ============================================================================
// Messages
// ============================================================================

pub use message::{Message, Role};

// ============================================================================
// Tokenization
// ============================================================================

pub use tokenizer::{TokenId, TokenizationError, Tokenizer};

// ============================================================================
// Function Calling Types
// ============================================================================

pub use function::{Completion, FunctionCall, FunctionDefinition, FunctionParameter};
