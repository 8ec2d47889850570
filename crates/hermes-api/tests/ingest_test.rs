//! Integration tests for the ingestion endpoints.
//!
//! Drives `/events` and `/github` through the full router against a relay
//! backed by a scripted transport, covering admission status codes,
//! signature checks and attribute extraction.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::RETRY_AFTER, HeaderMap, Request, StatusCode},
    Router,
};
use hermes_api::{create_router, AppState};
use hermes_core::{signature, CompletionStatus, EventId};
use hermes_delivery::Route;
use hermes_testing::{RelayHarness, Reply};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Value,
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    let response = app.clone().oneshot(request).await.expect("execute request");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes =
        axum::body::to_bytes(response.into_body(), usize::MAX).await.expect("read response body");
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    Response { status, headers, body }
}

fn event_request(source: &str, key: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("x-hermes-source", source)
        .header("x-idempotency-key", key)
        .header("content-type", "application/json")
}

fn post_event(source: &str, key: &str, body: &'static str) -> Request<Body> {
    event_request(source, key).body(Body::from(body)).unwrap()
}

fn event_id(body: &Value) -> EventId {
    let raw = body["event_id"].as_str().expect("event_id in response");
    EventId::from(Uuid::parse_str(raw).unwrap())
}

fn harness() -> RelayHarness {
    RelayHarness::builder().https("d").build().unwrap()
}

fn app(harness: &RelayHarness) -> Router {
    create_router(AppState::new(harness.relay.clone()))
}

#[tokio::test]
async fn accepted_event_is_relayed() {
    let harness = harness();
    let app = app(&harness);

    let response = send(&app, post_event("ci", "build-1", r#"{"ok":true}"#)).await;

    assert_eq!(response.status, StatusCode::ACCEPTED);
    assert_eq!(response.body["status"], "accepted");
    assert_eq!(response.body["destinations"], json!(["d"]));

    let record = harness.events.wait_for_completion(event_id(&response.body)).await;
    assert_eq!(record.status, CompletionStatus::Delivered);

    let attempts = harness.transport.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].payload.as_ref(), br#"{"ok":true}"#);
}

#[tokio::test]
async fn duplicate_key_returns_original_event() {
    let harness = harness();
    let app = app(&harness);

    let first = send(&app, post_event("ci", "build-2", "one")).await;
    let second = send(&app, post_event("ci", "build-2", "two")).await;

    assert_eq!(first.status, StatusCode::ACCEPTED);
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.body["status"], "duplicate");
    assert_eq!(second.body["event_id"], first.body["event_id"]);
}

#[tokio::test]
async fn missing_headers_and_invalid_events_are_bad_requests() {
    let harness = harness();
    let app = app(&harness);

    let no_source = Request::builder()
        .method("POST")
        .uri("/events")
        .header("x-idempotency-key", "k")
        .body(Body::from("p"))
        .unwrap();
    let response = send(&app, no_source).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"]["code"], "missing_header");

    let empty = send(&app, post_event("ci", "k", "")).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
    assert_eq!(empty.body["error"]["code"], "validation");

    assert_eq!(harness.transport.attempt_count(), 0);
}

#[tokio::test]
async fn attribute_headers_drive_routing() {
    let harness = RelayHarness::builder()
        .https("deploy")
        .route(Route::catch_all().when("branch", "main").to("deploy"))
        .build()
        .unwrap();
    let app = app(&harness);

    let on_main = event_request("ci", "k-main")
        .header("X-Hermes-Attr-Branch", "main")
        .body(Body::from("p"))
        .unwrap();
    assert_eq!(send(&app, on_main).await.status, StatusCode::ACCEPTED);

    let on_feature = event_request("ci", "k-feature")
        .header("X-Hermes-Attr-Branch", "feature")
        .body(Body::from("p"))
        .unwrap();
    let response = send(&app, on_feature).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.body["error"]["code"], "no_route");
}

#[tokio::test]
async fn capacity_rejections_ask_callers_to_retry() {
    let harness = RelayHarness::builder().https("d").max_in_flight(1).build().unwrap();
    let gate = Arc::new(Notify::new());
    harness.transport.script("d", [Reply::Hold(gate.clone())]);
    let app = app(&harness);

    let first = send(&app, post_event("ci", "k-1", "p")).await;
    assert_eq!(first.status, StatusCode::ACCEPTED);
    harness.transport.wait_for_attempts(1).await;

    let busy = send(&app, post_event("ci", "k-2", "p")).await;
    assert_eq!(busy.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(busy.body["error"]["code"], "backpressure");
    assert_eq!(busy.headers[RETRY_AFTER], "1");

    gate.notify_one();
    harness.events.wait_for_completion(event_id(&first.body)).await;
}

#[tokio::test]
async fn shutting_down_relay_refuses_events() {
    let harness = harness();
    let app = app(&harness);
    harness.relay.shutdown(std::time::Duration::from_secs(5)).await.unwrap();

    let response = send(&app, post_event("ci", "k", "p")).await;

    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body["error"]["code"], "shutting_down");
    assert_eq!(response.headers[RETRY_AFTER], "5");
}

#[tokio::test]
async fn oversized_payload_is_rejected() {
    let harness = harness();
    let app = create_router(AppState::new(harness.relay.clone()).with_max_payload_bytes(16));

    let body = "x".repeat(64);
    let request = event_request("ci", "k").body(Body::from(body)).unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(harness.transport.attempt_count(), 0);
}

#[tokio::test]
async fn signed_ingress_requires_valid_signature() {
    let harness = harness();
    let app = create_router(AppState::new(harness.relay.clone()).with_inbound_secret("s3cret"));

    let unsigned = send(&app, post_event("ci", "k-1", "payload")).await;
    assert_eq!(unsigned.status, StatusCode::UNAUTHORIZED);
    assert_eq!(unsigned.body["error"]["code"], "invalid_signature");

    let wrong = signature::sign(b"payload", "other").unwrap();
    let request = event_request("ci", "k-2")
        .header("x-hermes-signature-256", wrong)
        .body(Body::from("payload"))
        .unwrap();
    assert_eq!(send(&app, request).await.status, StatusCode::UNAUTHORIZED);

    let valid = signature::sign(b"payload", "s3cret").unwrap();
    let request = event_request("ci", "k-3")
        .header("x-hermes-signature-256", valid)
        .body(Body::from("payload"))
        .unwrap();
    assert_eq!(send(&app, request).await.status, StatusCode::ACCEPTED);

    harness.transport.wait_for_attempts(1).await;
    assert_eq!(harness.transport.attempt_count(), 1);
}

fn github_push(delivery: &str, body: &str, secret: Option<&str>) -> Request<Body> {
    let mut request = Request::builder()
        .method("POST")
        .uri("/github")
        .header("x-github-event", "push")
        .header("x-github-delivery", delivery)
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        request =
            request.header("x-hub-signature-256", signature::sign(body.as_bytes(), secret).unwrap());
    }
    request.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn github_webhook_routes_by_repository() {
    let harness = RelayHarness::builder()
        .https("mirror")
        .route(Route::for_source("github").when("repository", "hermes").to("mirror"))
        .build()
        .unwrap();
    let app = create_router(AppState::new(harness.relay.clone()).with_inbound_secret("gh"));

    let body = json!({
        "ref": "refs/heads/main",
        "repository": {
            "name": "hermes",
            "ssh_url": "git@github.com:acme/hermes.git",
            "clone_url": "https://github.com/acme/hermes.git"
        }
    })
    .to_string();

    let response = send(&app, github_push("72d3162e-cc78-11e3", &body, Some("gh"))).await;
    assert_eq!(response.status, StatusCode::ACCEPTED);
    assert_eq!(response.body["destinations"], json!(["mirror"]));

    let replay = send(&app, github_push("72d3162e-cc78-11e3", &body, Some("gh"))).await;
    assert_eq!(replay.status, StatusCode::OK);

    let other = json!({"repository": {"name": "other"}}).to_string();
    let unrouted = send(&app, github_push("guid-2", &other, Some("gh"))).await;
    assert_eq!(unrouted.status, StatusCode::UNPROCESSABLE_ENTITY);

    let unsigned = send(&app, github_push("guid-3", &body, None)).await;
    assert_eq!(unsigned.status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn github_webhook_requires_headers_and_repository() {
    let harness = harness();
    let app = app(&harness);

    let no_event = Request::builder()
        .method("POST")
        .uri("/github")
        .header("x-github-delivery", "guid")
        .body(Body::from(r#"{"repository":{"name":"r"}}"#))
        .unwrap();
    let response = send(&app, no_event).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"]["message"], "missing required header X-GitHub-Event");

    let not_json = send(&app, github_push("guid-1", "not json", None)).await;
    assert_eq!(not_json.status, StatusCode::BAD_REQUEST);
    assert_eq!(not_json.body["error"]["code"], "malformed_payload");

    let no_repository = send(&app, github_push("guid-2", r#"{"zen":"hi"}"#, None)).await;
    assert_eq!(no_repository.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn every_response_carries_a_request_id() {
    let harness = harness();
    let app = app(&harness);

    let generated = send(&app, post_event("ci", "k", "p")).await;
    let id = generated.headers["x-request-id"].to_str().unwrap();
    assert!(Uuid::parse_str(id).is_ok());

    let request = event_request("ci", "")
        .header("x-request-id", "req-42")
        .body(Body::from("p"))
        .unwrap();
    let failed = send(&app, request).await;
    assert_eq!(failed.status, StatusCode::BAD_REQUEST);
    assert_eq!(failed.headers["x-request-id"], "req-42");
}
