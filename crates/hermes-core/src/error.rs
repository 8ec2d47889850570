//! Validation errors for inbound events.

use thiserror::Error;

/// Reasons an event is refused before it reaches any dispatcher.
///
/// Validation failures are reported synchronously to the producer and are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The payload has no bytes.
    #[error("payload is empty")]
    EmptyPayload,

    /// The source identifier is missing or blank.
    #[error("source identifier is missing")]
    MissingSource,

    /// The idempotency key breaks the key format rules.
    #[error("malformed idempotency key: {reason}")]
    MalformedIdempotencyKey {
        /// What is wrong with the key.
        reason: String,
    },

    /// The payload could not be interpreted by an ingress adapter.
    #[error("malformed payload: {reason}")]
    MalformedPayload {
        /// What is wrong with the payload.
        reason: String,
    },

    /// A required header or field is absent.
    #[error("missing required field: {field}")]
    MissingField {
        /// Name of the absent field.
        field: String,
    },
}

impl ValidationError {
    /// Creates a malformed key error.
    pub fn malformed_key(reason: impl Into<String>) -> Self {
        Self::MalformedIdempotencyKey { reason: reason.into() }
    }

    /// Creates a malformed payload error.
    pub fn malformed_payload(reason: impl Into<String>) -> Self {
        Self::MalformedPayload { reason: reason.into() }
    }

    /// Creates a missing field error.
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField { field: field.into() }
    }
}
