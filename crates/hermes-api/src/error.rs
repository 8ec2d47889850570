//! Error responses for the HTTP ingress.
//!
//! Every failure is rendered as `{"error": {"code": ..., "message": ...}}`
//! with a status code derived from the error. Capacity rejections carry a
//! `Retry-After` header so producers back off instead of hammering a busy
//! relay.

use axum::{
    http::{header::RETRY_AFTER, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use hermes_core::signature::SignatureError;
use hermes_delivery::Rejection;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Seconds producers are asked to wait after a capacity rejection.
pub const RETRY_AFTER_SECS: u64 = 1;

/// Seconds producers are asked to wait while the relay is shutting down.
pub const SHUTDOWN_RETRY_AFTER_SECS: u64 = 5;

/// Errors returned by ingress handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A required header is absent or not valid UTF-8.
    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    /// The body could not be interpreted.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The body exceeds the configured limit.
    #[error("payload exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// The inbound signature is missing or wrong.
    #[error("signature rejected: {0}")]
    Signature(#[from] SignatureError),

    /// The relay refused the event.
    #[error(transparent)]
    Rejected(#[from] Rejection),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingHeader(_) | Self::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Signature(_) => StatusCode::UNAUTHORIZED,
            Self::Rejected(rejection) => match rejection {
                Rejection::Validation(_) => StatusCode::BAD_REQUEST,
                Rejection::NoRoute(_) => StatusCode::UNPROCESSABLE_ENTITY,
                Rejection::ShuttingDown
                | Rejection::Backpressure { .. }
                | Rejection::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            },
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader(_) => "missing_header",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Signature(_) => "invalid_signature",
            Self::Rejected(rejection) => rejection.reason(),
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Rejected(Rejection::ShuttingDown) => Some(SHUTDOWN_RETRY_AFTER_SECS),
            Self::Rejected(rejection) if rejection.is_retryable() => Some(RETRY_AFTER_SECS),
            _ => None,
        }
    }
}

/// Error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Error code and message.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.code(), error = %self, "event refused");
        }

        let body = ErrorResponse {
            error: ErrorDetail { code: self.code().to_string(), message: self.to_string() },
        };
        let mut response = (status, Json(body)).into_response();

        if let Some(seconds) = self.retry_after() {
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use hermes_core::ValidationError;
    use hermes_delivery::NoRoute;

    use super::*;

    #[test]
    fn rejections_map_to_statuses() {
        let cases = [
            (Rejection::Validation(ValidationError::EmptyPayload), StatusCode::BAD_REQUEST),
            (
                Rejection::NoRoute(NoRoute { source_id: "s".to_string() }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (Rejection::Backpressure { limit: 1 }, StatusCode::SERVICE_UNAVAILABLE),
            (Rejection::QueueFull { destination: "d".into() }, StatusCode::SERVICE_UNAVAILABLE),
            (Rejection::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (rejection, status) in cases {
            assert_eq!(ApiError::from(rejection).status(), status);
        }
    }

    #[test]
    fn capacity_rejections_carry_retry_after() {
        let response = ApiError::from(Rejection::Backpressure { limit: 4 }).into_response();
        assert_eq!(response.headers()[RETRY_AFTER], "1");

        let response = ApiError::from(Rejection::ShuttingDown).into_response();
        assert_eq!(response.headers()[RETRY_AFTER], "5");

        let response = ApiError::MissingHeader("X-Hermes-Source").into_response();
        assert!(response.headers().get(RETRY_AFTER).is_none());
    }

    #[test]
    fn signature_errors_are_unauthorized() {
        let error = ApiError::from(SignatureError::VerificationFailed);
        assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error.code(), "invalid_signature");
    }
}
