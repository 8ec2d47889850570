//! End-to-end tests for the relay daemon.
//!
//! Runs the real HTTP server on an ephemeral port with the real delivery
//! client, delivering to a wiremock destination. Covers the producer to
//! destination path, outbound signing, retries, GitHub ingestion and
//! graceful shutdown.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use hermes_api::{
    config::{ClientSettings, RetrySettings},
    serve, AppState, Config,
};
use hermes_core::{signature, CompletionStatus, Destination, EventId, TransportKind};
use hermes_delivery::{DeliveryClient, RelayCore, Route};
use hermes_testing::RecordingEventHandler;
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

const OUTBOUND_SECRET: &str = "outbound-secret";
const INBOUND_SECRET: &str = "inbound-secret";

struct Daemon {
    addr: SocketAddr,
    relay: Arc<RelayCore>,
    events: Arc<RecordingEventHandler>,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    http: reqwest::Client,
}

impl Daemon {
    async fn start(config: Config) -> Self {
        let routing = Arc::new(config.routing_table().expect("valid routing"));
        let client = DeliveryClient::new(config.client_config(), config.git_config())
            .expect("delivery client");
        let events = Arc::new(RecordingEventHandler::new());
        let relay = Arc::new(
            RelayCore::new(config.relay_config(), routing, Arc::new(client))
                .with_event_handler(events.clone()),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            AppState::from_config(relay.clone(), &config),
            shutdown.clone().cancelled_owned(),
        ));

        Self { addr, relay, events, shutdown, server, http: reqwest::Client::new() }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn post_event(&self, source: &str, key: &str, body: &'static str) -> reqwest::Response {
        self.http
            .post(self.url("/events"))
            .header("x-hermes-source", source)
            .header("x-idempotency-key", key)
            .header("x-hermes-signature-256", signature::sign(body.as_bytes(), INBOUND_SECRET).unwrap())
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .expect("send event")
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.server.await.unwrap().expect("server stops cleanly");
        self.relay.shutdown(Duration::from_secs(5)).await.expect("relay drains");
    }
}

fn config(destination_url: String, routes: Vec<Route>) -> Config {
    let destination = Destination::new("hooks", TransportKind::Https, destination_url)
        .with_signing_secret(OUTBOUND_SECRET);

    let mut config = Config {
        retry: RetrySettings {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 50,
            jitter_factor: 0.0,
            ..RetrySettings::default()
        },
        client: ClientSettings {
            timeout_ms: 2_000,
            allow_insecure_http: true,
            ..ClientSettings::default()
        },
        destinations: vec![destination],
        routes,
        ..Config::default()
    };
    config.server.inbound_secret = Some(INBOUND_SECRET.to_string());
    config.validate().expect("valid config");
    config
}

async fn event_id(response: reqwest::Response) -> EventId {
    let body: Value = response.json().await.unwrap();
    EventId::from(Uuid::parse_str(body["event_id"].as_str().unwrap()).unwrap())
}

#[tokio::test]
async fn event_is_relayed_signed_after_a_transient_failure() {
    let destination = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&destination)
        .await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("x-hermes-source", "ci"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&destination)
        .await;

    let daemon = Daemon::start(config(
        format!("{}/hooks", destination.uri()),
        vec![Route::for_source("ci").to("hooks")],
    ))
    .await;

    let response = daemon.post_event("ci", "build-7", r#"{"build":7}"#).await;
    assert_eq!(response.status(), 202);

    let record = daemon.events.wait_for_completion(event_id(response).await).await;
    assert_eq!(record.status, CompletionStatus::Delivered);
    assert_eq!(record.outcome("hooks").unwrap().attempts, 2);

    let received = destination.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    let last = &received[1];
    assert_eq!(last.body, br#"{"build":7}"#);
    assert_eq!(last.headers["x-hermes-delivery-attempt"], "2");
    assert_eq!(last.headers["x-hermes-idempotency-key"], "build-7");
    let provided = last.headers["x-hermes-signature-256"].to_str().unwrap();
    signature::verify(&last.body, provided, OUTBOUND_SECRET).expect("outbound signature verifies");

    let replay = daemon.post_event("ci", "build-7", r#"{"build":7}"#).await;
    assert_eq!(replay.status(), 200);

    daemon.stop().await;
    destination.verify().await;
}

#[tokio::test]
async fn github_push_reaches_the_routed_destination() {
    let destination = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&destination)
        .await;

    let daemon = Daemon::start(config(
        format!("{}/hooks", destination.uri()),
        vec![Route::for_source("github").when("repository", "hermes").to("hooks")],
    ))
    .await;

    let body = json!({
        "ref": "refs/heads/main",
        "repository": {"name": "hermes", "clone_url": "https://github.com/acme/hermes.git"}
    })
    .to_string();
    let response = daemon
        .http
        .post(daemon.url("/github"))
        .header("x-github-event", "push")
        .header("x-github-delivery", "f0e1d2c3-b4a5")
        .header("x-hub-signature-256", signature::sign(body.as_bytes(), INBOUND_SECRET).unwrap())
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    let record = daemon.events.wait_for_completion(event_id(response).await).await;
    assert_eq!(record.status, CompletionStatus::Delivered);

    let health: Value =
        daemon.http.get(daemon.url("/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["relay"]["accepted"], 1);

    daemon.stop().await;
    destination.verify().await;
}

#[tokio::test]
async fn shutdown_cancels_slow_deliveries_and_stops_listening() {
    let destination = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&destination)
        .await;

    let daemon = Daemon::start(config(format!("{}/hooks", destination.uri()), vec![])).await;

    // No routes configured: nothing is admitted.
    let unrouted = daemon.post_event("ci", "k-0", "p").await;
    assert_eq!(unrouted.status(), 422);
    daemon.stop().await;

    let daemon = Daemon::start(config(
        format!("{}/hooks", destination.uri()),
        vec![Route::catch_all().to("hooks")],
    ))
    .await;
    let response = daemon.post_event("ci", "k-1", "p").await;
    assert_eq!(response.status(), 202);
    let id = event_id(response).await;

    let addr = daemon.addr;
    let events = daemon.events.clone();
    let relay = daemon.relay.clone();
    daemon.stop().await;

    let record = events.completion(id).expect("completion emitted during shutdown");
    assert_eq!(record.status, CompletionStatus::Cancelled);
    assert!(relay.is_shutting_down());
    assert!(reqwest::get(format!("http://{addr}/live")).await.is_err());
}
