//! Error types for delivery operations.
//!
//! Every transport failure is classified as transient (retried per policy)
//! or permanent (reported immediately). Capacity and lifecycle conditions
//! such as an open circuit or a shutdown have their own variants so callers
//! can tell them apart from remote failures.

use std::fmt;

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failure of a single delivery attempt or of the delivery machinery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection refused, DNS failure or other connectivity problem.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// The remote dropped an established connection.
    #[error("connection reset: {message}")]
    ConnectionReset {
        /// Error message describing the reset
        message: String,
    },

    /// The per-attempt timeout elapsed.
    #[error("attempt timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that was exceeded in milliseconds
        timeout_ms: u64,
    },

    /// HTTP 5xx or 408 response.
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code
        status_code: u16,
        /// Response body content, truncated
        body: String,
    },

    /// HTTP 429 response.
    #[error("rate limited: retry after {retry_after_seconds:?}s")]
    RateLimited {
        /// Seconds requested by a `Retry-After` header, if any
        retry_after_seconds: Option<u64>,
    },

    /// Unrecognised git transport failure.
    #[error("git transport failed: {message}")]
    GitTransport {
        /// Classified stderr output
        message: String,
    },

    /// HTTP 3xx or 4xx response other than 401, 403, 408 and 429.
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code
        status_code: u16,
        /// Response body content, truncated
        body: String,
    },

    /// The remote rejected our credentials.
    #[error("authentication rejected by destination: {message}")]
    AuthenticationFailed {
        /// What was rejected
        message: String,
    },

    /// The destination address is malformed or the target does not exist.
    #[error("invalid destination: {message}")]
    InvalidDestination {
        /// What is wrong with the destination
        message: String,
    },

    /// The transport itself is misconfigured.
    #[error("transport misconfigured: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Circuit breaker is open, delivery blocked without contacting the
    /// destination.
    #[error("circuit breaker open for destination {destination}")]
    CircuitOpen {
        /// Key of the destination whose circuit is open
        destination: String,
    },

    /// The dispatcher queue for a destination is at capacity.
    #[error("queue full for destination {destination}")]
    QueueFull {
        /// Key of the destination whose queue is full
        destination: String,
    },

    /// All retry attempts exhausted.
    #[error("delivery failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Last error observed
        last_error: String,
    },

    /// The event was cancelled before it could be delivered.
    #[error("event cancelled")]
    Cancelled,

    /// The relay is shutting down.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a connection reset error.
    pub fn connection_reset(message: impl Into<String>) -> Self {
        Self::ConnectionReset { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a server error from an HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Creates a rate limit error.
    pub fn rate_limited(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates an unclassified git transport error.
    pub fn git_transport(message: impl Into<String>) -> Self {
        Self::GitTransport { message: message.into() }
    }

    /// Creates a client error from an HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::AuthenticationFailed { message: message.into() }
    }

    /// Creates an invalid destination error.
    pub fn invalid_destination(message: impl Into<String>) -> Self {
        Self::InvalidDestination { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates a circuit open error.
    pub fn circuit_open(destination: impl Into<String>) -> Self {
        Self::CircuitOpen { destination: destination.into() }
    }

    /// Creates a queue full error.
    pub fn queue_full(destination: impl Into<String>) -> Self {
        Self::QueueFull { destination: destination.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32, last_error: &DeliveryError) -> Self {
        Self::RetriesExhausted { attempts, last_error: last_error.to_string() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Whether this is a transient remote failure that the retry policy may
    /// retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::ConnectionReset { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::GitTransport { .. } => true,

            Self::ClientError { .. }
            | Self::AuthenticationFailed { .. }
            | Self::InvalidDestination { .. }
            | Self::ConfigurationError { .. }
            | Self::CircuitOpen { .. }
            | Self::QueueFull { .. }
            | Self::RetriesExhausted { .. }
            | Self::Cancelled
            | Self::ShutdownRequested
            | Self::InternalError { .. } => false,
        }
    }

    /// Whether this is a permanent remote failure that must never be
    /// retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ClientError { .. }
                | Self::AuthenticationFailed { .. }
                | Self::InvalidDestination { .. }
                | Self::ConfigurationError { .. }
        )
    }

    /// Delay requested by the remote, if any.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Coarse category for logs and observability events.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

/// Category of delivery error for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connectivity issues and timeouts.
    Network,
    /// HTTP 3xx/4xx responses.
    Client,
    /// HTTP 5xx responses.
    Server,
    /// Rate limiting.
    RateLimit,
    /// Rejected credentials.
    Authentication,
    /// Bad address or missing target.
    Destination,
    /// Git transport failures.
    Git,
    /// Circuit breaker protection.
    Circuit,
    /// Queue or in-flight limits.
    Capacity,
    /// Cancellation and shutdown.
    Cancelled,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. }
            | DeliveryError::ConnectionReset { .. }
            | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } | DeliveryError::RetriesExhausted { .. } => {
                Self::Client
            },
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::RateLimited { .. } => Self::RateLimit,
            DeliveryError::AuthenticationFailed { .. } => Self::Authentication,
            DeliveryError::InvalidDestination { .. } => Self::Destination,
            DeliveryError::GitTransport { .. } => Self::Git,
            DeliveryError::CircuitOpen { .. } => Self::Circuit,
            DeliveryError::QueueFull { .. } => Self::Capacity,
            DeliveryError::Cancelled | DeliveryError::ShutdownRequested => Self::Cancelled,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Authentication => write!(f, "authentication"),
            Self::Destination => write!(f, "destination"),
            Self::Git => write!(f, "git"),
            Self::Circuit => write!(f, "circuit"),
            Self::Capacity => write!(f, "capacity"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
