//! Single-attempt delivery over a pluggable transport.
//!
//! [`DeliveryClient`] picks the transport for a destination's kind and wraps
//! every call in a hard per-attempt timeout. It is stateless per call and
//! never retries; retrying is the dispatcher's job.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hermes_core::{signature, Destination, Event, TransportKind};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER},
    Response, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::{
    error::{DeliveryError, Result},
    git::{GitConfig, GitSshTransport},
};

/// Longest response body excerpt kept in errors.
const MAX_BODY_EXCERPT: usize = 1024;

/// Delivery client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Default per-attempt timeout.
    pub timeout: Duration,
    /// User agent for HTTPS requests.
    pub user_agent: String,
    /// Accept plain `http://` destinations.
    pub allow_insecure_http: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("hermes/", env!("CARGO_PKG_VERSION")).to_string(),
            allow_insecure_http: false,
        }
    }
}

/// One delivery attempt of one event.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Unique identifier of this attempt.
    pub delivery_id: Uuid,
    /// Event being delivered, shared with the rest of its fan-out.
    pub event: Arc<Event>,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

impl DeliveryRequest {
    /// Creates a request for a fresh attempt.
    pub fn new(event: Arc<Event>, attempt_number: u32) -> Self {
        Self { delivery_id: Uuid::new_v4(), event, attempt_number }
    }
}

/// Proof of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// HTTP status code for HTTP-based transports.
    pub status_code: Option<u16>,
    /// Transport call duration.
    pub duration: Duration,
}

/// Wire transport for a single delivery attempt.
///
/// Implementations classify every failure as a transient or permanent
/// [`DeliveryError`] and must not retry internally.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Delivers the request's event to `destination` once.
    async fn send(
        &self,
        request: &DeliveryRequest,
        destination: &Destination,
    ) -> Result<DeliveryReceipt>;
}

/// Timeout-bounded dispatch to the transport matching a destination.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    config: ClientConfig,
    https: Arc<dyn Transport>,
    ssh_git: Arc<dyn Transport>,
}

impl DeliveryClient {
    /// Creates a client with the built-in HTTPS and SSH git transports.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig, git: GitConfig) -> Result<Self> {
        let https = Arc::new(HttpsTransport::new(&config)?);
        let ssh_git = Arc::new(GitSshTransport::new(git));
        Ok(Self::with_transports(config, https, ssh_git))
    }

    /// Creates a client with explicit transports.
    pub fn with_transports(
        config: ClientConfig,
        https: Arc<dyn Transport>,
        ssh_git: Arc<dyn Transport>,
    ) -> Self {
        Self { config, https, ssh_git }
    }

    /// Creates a client that uses one transport for every destination kind.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_transports(config, transport.clone(), transport)
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Performs one delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Timeout` if the transport exceeds the
    /// destination's timeout (or the client default), otherwise whatever the
    /// transport reports.
    pub async fn deliver(
        &self,
        request: &DeliveryRequest,
        destination: &Destination,
    ) -> Result<DeliveryReceipt> {
        let timeout = destination.timeout.unwrap_or(self.config.timeout);
        let transport = match destination.transport {
            TransportKind::Https => &self.https,
            TransportKind::SshGit => &self.ssh_git,
        };

        let span = info_span!(
            "delivery",
            event_id = %request.event.id(),
            delivery_id = %request.delivery_id,
            destination = %destination.key,
            transport = %destination.transport,
            attempt = request.attempt_number
        );

        async move {
            match tokio::time::timeout(timeout, transport.send(request, destination)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(timeout_ms = timeout.as_millis(), "attempt timed out");
                    Err(DeliveryError::timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)))
                },
            }
        }
        .instrument(span)
        .await
    }
}

/// HTTPS transport backed by `reqwest` with rustls.
#[derive(Debug, Clone)]
pub struct HttpsTransport {
    client: reqwest::Client,
    allow_insecure_http: bool,
}

impl HttpsTransport {
    /// Builds the transport.
    ///
    /// Redirects are not followed: a 3xx is a permanent client error.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, allow_insecure_http: config.allow_insecure_http })
    }

    fn target_url(&self, address: &str) -> Result<Url> {
        let url = Url::parse(address)
            .map_err(|e| DeliveryError::invalid_destination(format!("invalid URL {address}: {e}")))?;

        match url.scheme() {
            "https" => Ok(url),
            "http" if self.allow_insecure_http => Ok(url),
            scheme => Err(DeliveryError::invalid_destination(format!(
                "unsupported scheme '{scheme}', expected https"
            ))),
        }
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    async fn send(
        &self,
        request: &DeliveryRequest,
        destination: &Destination,
    ) -> Result<DeliveryReceipt> {
        let url = self.target_url(&destination.address)?;
        let headers = build_headers(request, destination)?;
        let started = std::time::Instant::now();

        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(request.event.payload().clone())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let duration = started.elapsed();
        let status = response.status();
        debug!(status = status.as_u16(), duration_ms = duration.as_millis(), "received response");

        if status.is_success() {
            return Ok(DeliveryReceipt { status_code: Some(status.as_u16()), duration });
        }

        Err(classify_response(response).await)
    }
}

fn build_headers(request: &DeliveryRequest, destination: &Destination) -> Result<HeaderMap> {
    let event = &request.event;
    let mut headers = HeaderMap::new();

    for (name, value) in &destination.headers {
        if is_managed_header(name) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DeliveryError::configuration(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DeliveryError::configuration(format!("invalid value for {name}: {e}")))?;
        headers.insert(name, value);
    }

    let managed = [
        (CONTENT_TYPE.as_str(), event.content_type().to_string()),
        ("x-hermes-event-id", event.id().to_string()),
        ("x-hermes-delivery-id", request.delivery_id.to_string()),
        ("x-hermes-delivery-attempt", request.attempt_number.to_string()),
        ("x-hermes-idempotency-key", event.idempotency_key().to_string()),
        ("x-hermes-source", event.source().to_string()),
    ];

    for (name, value) in managed {
        let value = HeaderValue::from_str(&value)
            .map_err(|e| DeliveryError::internal(format!("invalid value for {name}: {e}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }

    if let Some(secret) = destination.signing_secret.as_deref() {
        let signature = signature::sign(event.payload(), secret)
            .map_err(|e| DeliveryError::configuration(format!("cannot sign payload: {e}")))?;
        let value = HeaderValue::from_str(&signature)
            .map_err(|e| DeliveryError::internal(format!("invalid signature header: {e}")))?;
        headers.insert(HeaderName::from_static("x-hermes-signature-256"), value);
    }

    Ok(headers)
}

/// Headers hermes sets itself or that are hop-by-hop.
fn is_managed_header(name: &str) -> bool {
    let lowercase = name.to_ascii_lowercase();
    lowercase.starts_with("x-hermes-")
        || matches!(
            lowercase.as_str(),
            "content-type"
                | "content-length"
                | "host"
                | "user-agent"
                | "connection"
                | "keep-alive"
                | "te"
                | "trailer"
                | "transfer-encoding"
                | "upgrade"
        )
}

fn classify_reqwest_error(error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() {
        return DeliveryError::timeout(0);
    }

    if is_connection_reset(&error) {
        return DeliveryError::connection_reset(error.to_string());
    }

    if error.is_builder() {
        return DeliveryError::invalid_destination(error.to_string());
    }

    DeliveryError::network(error.to_string())
}

fn is_connection_reset(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

async fn classify_response(response: Response) -> DeliveryError {
    let status = response.status();
    let retry_after = parse_retry_after(response.headers());
    let body = match response.bytes().await {
        Ok(bytes) => excerpt(&bytes),
        Err(e) => format!("[failed to read response body: {e}]"),
    };

    classify_status(status, retry_after, body)
}

/// Maps a non-2xx HTTP status to the delivery error taxonomy.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<u64>,
    body: String,
) -> DeliveryError {
    let code = status.as_u16();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DeliveryError::authentication(format!("HTTP {code}"))
        },
        StatusCode::REQUEST_TIMEOUT => DeliveryError::server_error(code, body),
        StatusCode::TOO_MANY_REQUESTS => DeliveryError::rate_limited(retry_after),
        s if s.is_server_error() => DeliveryError::server_error(code, body),
        _ => DeliveryError::client_error(code, body),
    }
}

/// Reads `Retry-After` as delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let wait = date.with_timezone(&chrono::Utc).signed_duration_since(chrono::Utc::now());
    Some(wait.to_std().map(|d| d.as_secs()).unwrap_or(0))
}

fn excerpt(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_BODY_EXCERPT {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_BODY_EXCERPT]))
}
