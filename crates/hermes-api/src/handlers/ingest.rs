//! Event ingestion handlers.
//!
//! Both endpoints turn an HTTP request into an [`Event`] and hand it to the
//! relay. Nothing is persisted; the response reflects the relay's admission
//! decision only. Delivery outcomes are reported through the relay's
//! event sink.

use std::collections::BTreeMap;

use axum::{
    extract::{rejection::BytesRejection, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use hermes_core::{signature, Event};
use hermes_delivery::Submission;
use serde::Deserialize;
use tracing::{debug, info, instrument, Span};

use crate::{ApiError, AppState};

/// Source of the producer, required on `/events`.
pub const SOURCE_HEADER: &str = "x-hermes-source";
/// Idempotency key, required on `/events`.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
/// Inbound signature on `/events`.
pub const SIGNATURE_HEADER: &str = "x-hermes-signature-256";
/// Prefix of headers that become routing attributes.
pub const ATTRIBUTE_HEADER_PREFIX: &str = "x-hermes-attr-";

/// GitHub event name.
pub const GITHUB_EVENT_HEADER: &str = "x-github-event";
/// GitHub delivery GUID, used as the idempotency key.
pub const GITHUB_DELIVERY_HEADER: &str = "x-github-delivery";
/// GitHub payload signature.
pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
/// Source assigned to GitHub webhooks.
pub const GITHUB_SOURCE: &str = "github";

/// Generic event ingestion.
///
/// The body is the payload. `X-Hermes-Source` and `X-Idempotency-Key` are
/// required, `Content-Type` is carried through, and every
/// `X-Hermes-Attr-<name>` header becomes the routing attribute `<name>`.
///
/// # Errors
///
/// - 400: missing header or invalid event
/// - 401: signature missing or wrong while a secret is configured
/// - 413: body over the configured limit
/// - 422: no route matches
/// - 503: relay at capacity or shutting down
#[instrument(
    name = "ingest_event",
    skip_all,
    fields(source = tracing::field::Empty, idempotency_key = tracing::field::Empty)
)]
pub async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let body = read_body(body, state.max_payload_bytes)?;
    let source = required_header(&headers, SOURCE_HEADER, "X-Hermes-Source")?;
    let key = required_header(&headers, IDEMPOTENCY_KEY_HEADER, "X-Idempotency-Key")?;

    let span = Span::current();
    span.record("source", source);
    span.record("idempotency_key", key);

    verify_signature(&state, &headers, SIGNATURE_HEADER, &body)?;

    let mut builder = Event::builder(source, key, body).attributes(attribute_headers(&headers));
    if let Some(content_type) = optional_header(&headers, CONTENT_TYPE.as_str()) {
        builder = builder.content_type(content_type);
    }

    submit(&state, builder.build()).await
}

/// GitHub-compatible webhook ingestion.
///
/// Requires `X-GitHub-Event` and `X-GitHub-Delivery`. When a secret is
/// configured, `X-Hub-Signature-256` must verify. The JSON body must name
/// its repository; the event gets the attributes `event`, `repository`,
/// `ssh_url`, `clone_url` and `ref` where present.
///
/// # Errors
///
/// Same status codes as [`ingest_event`], plus 400 for a body that is not
/// a repository webhook.
#[instrument(
    name = "ingest_github",
    skip_all,
    fields(github_event = tracing::field::Empty, delivery = tracing::field::Empty)
)]
pub async fn ingest_github(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let body = read_body(body, state.max_payload_bytes)?;
    let github_event = required_header(&headers, GITHUB_EVENT_HEADER, "X-GitHub-Event")?;
    let delivery = required_header(&headers, GITHUB_DELIVERY_HEADER, "X-GitHub-Delivery")?;

    let span = Span::current();
    span.record("github_event", github_event);
    span.record("delivery", delivery);

    verify_signature(&state, &headers, GITHUB_SIGNATURE_HEADER, &body)?;

    let attributes = github_attributes(github_event, &body)?;
    debug!(repository = attributes.get("repository").map(String::as_str), "github webhook parsed");

    let content_type =
        optional_header(&headers, CONTENT_TYPE.as_str()).unwrap_or("application/json");
    let event = Event::builder(GITHUB_SOURCE, delivery, body)
        .content_type(content_type)
        .attributes(attributes)
        .build();

    submit(&state, event).await
}

async fn submit(state: &AppState, event: Event) -> Result<Response, ApiError> {
    let submission = state.relay.submit(event).await?;

    let status = match submission {
        Submission::Accepted { .. } => StatusCode::ACCEPTED,
        Submission::Duplicate { .. } => StatusCode::OK,
    };
    info!(event_id = %submission.event_id(), status = status.as_u16(), "event ingested");

    Ok((status, Json(submission)).into_response())
}

fn read_body(body: Result<Bytes, BytesRejection>, limit: usize) -> Result<Bytes, ApiError> {
    match body {
        Ok(body) if body.len() > limit => Err(ApiError::PayloadTooLarge { limit }),
        Ok(body) => Ok(body),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(ApiError::PayloadTooLarge { limit })
        },
        Err(rejection) => Err(ApiError::MalformedPayload(rejection.body_text())),
    }
}

fn optional_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).filter(|v| !v.is_empty())
}

fn required_header<'a>(
    headers: &'a HeaderMap,
    name: &str,
    display: &'static str,
) -> Result<&'a str, ApiError> {
    optional_header(headers, name).ok_or(ApiError::MissingHeader(display))
}

fn verify_signature(
    state: &AppState,
    headers: &HeaderMap,
    header: &str,
    body: &[u8],
) -> Result<(), ApiError> {
    let Some(secret) = state.inbound_secret.as_deref() else { return Ok(()) };

    let provided = headers.get(header).and_then(|v| v.to_str().ok()).unwrap_or_default();
    signature::verify(body, provided, secret)?;
    Ok(())
}

/// Collects `X-Hermes-Attr-<name>` headers. Header names arrive lowercased,
/// so attribute names are lowercase too.
fn attribute_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let attribute = name.as_str().strip_prefix(ATTRIBUTE_HEADER_PREFIX)?;
            let value = value.to_str().ok()?;
            (!attribute.is_empty()).then(|| (attribute.to_string(), value.to_string()))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct GitHubPayload {
    repository: Option<GitHubRepository>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubRepository {
    name: Option<String>,
    ssh_url: Option<String>,
    clone_url: Option<String>,
}

fn github_attributes(github_event: &str, body: &[u8]) -> Result<BTreeMap<String, String>, ApiError> {
    let payload: GitHubPayload = serde_json::from_slice(body)
        .map_err(|e| ApiError::MalformedPayload(format!("invalid JSON: {e}")))?;

    let repository = payload
        .repository
        .ok_or_else(|| ApiError::MalformedPayload("repository is missing".to_string()))?;
    let name = repository
        .name
        .ok_or_else(|| ApiError::MalformedPayload("repository.name is missing".to_string()))?;

    let mut attributes = BTreeMap::new();
    attributes.insert("event".to_string(), github_event.to_string());
    attributes.insert("repository".to_string(), name);
    if let Some(ssh_url) = repository.ssh_url {
        attributes.insert("ssh_url".to_string(), ssh_url);
    }
    if let Some(clone_url) = repository.clone_url {
        attributes.insert("clone_url".to_string(), clone_url);
    }
    if let Some(git_ref) = payload.git_ref {
        attributes.insert("ref".to_string(), git_ref);
    }

    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_headers_are_extracted_by_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("x-hermes-attr-branch", "main".parse().unwrap());
        headers.insert("x-hermes-attr-env", "prod".parse().unwrap());
        headers.insert("x-hermes-source", "ci".parse().unwrap());
        headers.insert("x-hermes-attr-", "ignored".parse().unwrap());

        let attributes = attribute_headers(&headers);

        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes["branch"], "main");
        assert_eq!(attributes["env"], "prod");
    }

    #[test]
    fn github_push_payload_yields_attributes() {
        let body = br#"{
            "ref": "refs/heads/main",
            "repository": {
                "name": "hermes",
                "ssh_url": "git@github.com:acme/hermes.git",
                "clone_url": "https://github.com/acme/hermes.git"
            }
        }"#;

        let attributes = github_attributes("push", body).unwrap();

        assert_eq!(attributes["event"], "push");
        assert_eq!(attributes["repository"], "hermes");
        assert_eq!(attributes["ssh_url"], "git@github.com:acme/hermes.git");
        assert_eq!(attributes["clone_url"], "https://github.com/acme/hermes.git");
        assert_eq!(attributes["ref"], "refs/heads/main");
    }

    #[test]
    fn github_payload_without_repository_name_is_malformed() {
        let missing_repo = github_attributes("push", br#"{"zen": "hi"}"#).unwrap_err();
        assert!(matches!(missing_repo, ApiError::MalformedPayload(_)));

        let missing_name = github_attributes("push", br#"{"repository": {}}"#).unwrap_err();
        assert_eq!(missing_name.to_string(), "malformed payload: repository.name is missing");

        let not_json = github_attributes("push", b"not json").unwrap_err();
        assert_eq!(not_json.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let error = read_body(Ok(Bytes::from_static(b"12345")), 4).unwrap_err();
        assert!(matches!(error, ApiError::PayloadTooLarge { limit: 4 }));
    }
}
