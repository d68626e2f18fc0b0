//! Error types for event decoding.

use thiserror::Error;

/// Errors that can occur when decoding an event body.
///
/// None of these are retryable: a body that fails to decode once will fail
/// the same way on every redelivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The body is not valid YAML (or JSON).
    #[error("malformed event body: {0}")]
    Syntax(String),

    /// The body parsed, but the top level is not a mapping.
    #[error("event body is not a mapping")]
    NotAMapping,

    /// The mapping has no string `action` entry.
    #[error("event body has no action")]
    MissingAction,

    /// A known action is missing a field or has an ill-typed one.
    #[error("invalid {action} payload: {reason}")]
    InvalidPayload { action: String, reason: String },
}

impl EventError {
    /// Returns true if the body could not be parsed at all.
    pub fn is_syntax(&self) -> bool {
        matches!(self, EventError::Syntax(_))
    }
}
