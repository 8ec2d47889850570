//! Integration tests for the relay core.
//!
//! Covers admission (validation, dedupe, backpressure, routing, queue
//! reservation), fan-out aggregation, cancellation and shutdown.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use std::{sync::Arc, time::Duration};

use hermes_core::{CompletionStatus, DestinationStatus, Event, IdempotencyKey, ValidationError};
use hermes_delivery::{NoRoute, Rejection, Route, Submission};
use hermes_testing::{test_event, RelayHarness, Reply};
use tokio::sync::Notify;

fn accepted_id(submission: Result<Submission, Rejection>) -> hermes_core::EventId {
    match submission {
        Ok(Submission::Accepted { event_id, .. }) => event_id,
        other => panic!("expected acceptance, got {other:?}"),
    }
}

#[tokio::test]
async fn delivers_after_two_transient_failures_with_backoff() {
    let harness = RelayHarness::builder().https("d").build().unwrap();
    harness.transport.script("d", [Reply::unavailable(), Reply::unavailable()]);

    let record = harness.deliver(test_event("s")).await;

    assert_eq!(record.status, CompletionStatus::Delivered);
    assert_eq!(record.outcome("d").unwrap().attempts, 3);
    assert_eq!(harness.transport.attempt_count(), 3);
    assert!(harness.clock.elapsed() >= Duration::from_millis(300));
    assert_eq!(
        harness.clock.sleeps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test]
async fn one_permanent_failure_yields_partial_delivery() {
    let harness = RelayHarness::builder().https("ok").https("broken").build().unwrap();
    harness.transport.script("broken", [Reply::bad_request()]);

    let record = harness.deliver(test_event("s")).await;

    assert_eq!(record.status, CompletionStatus::PartiallyDelivered);
    assert_eq!(record.outcomes.len(), 2);

    let ok = record.outcome("ok").unwrap();
    assert_eq!(ok.status, DestinationStatus::Delivered);
    assert_eq!(ok.attempts, 1);

    let broken = record.outcome("broken").unwrap();
    assert_eq!(broken.status, DestinationStatus::Failed);
    assert_eq!(broken.attempts, 1);
    assert_eq!(broken.last_error.as_deref(), Some("client error: HTTP 400"));
}

#[tokio::test]
async fn submission_returns_resolved_destinations_in_order() {
    let harness = RelayHarness::builder()
        .https("ci")
        .https("audit")
        .route(Route::for_source("github").to("ci"))
        .route(Route::catch_all().to("audit").to("ci"))
        .build()
        .unwrap();

    let submission = harness.relay.submit(test_event("github")).await.unwrap();

    match submission {
        Submission::Accepted { destinations, .. } => {
            let keys: Vec<_> = destinations.iter().map(|k| k.as_str()).collect();
            assert_eq!(keys, vec!["ci", "audit"]);
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn in_flight_cap_rejects_with_backpressure_and_no_queue_effect() {
    let harness = RelayHarness::builder().https("d").max_in_flight(1).build().unwrap();
    let gate = Arc::new(Notify::new());
    harness.transport.script("d", [Reply::Hold(gate.clone())]);

    let first = accepted_id(harness.relay.submit(test_event("s")).await);
    harness.transport.wait_for_attempts(1).await;

    let rejected = harness.relay.submit(test_event("s")).await;
    assert_eq!(rejected, Err(Rejection::Backpressure { limit: 1 }));

    let snapshots = harness.relay.dispatcher_snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].queue_depth, 0);

    gate.notify_one();
    harness.events.wait_for_completion(first).await;

    assert_eq!(harness.transport.attempt_count(), 1);
    accepted_id(harness.relay.submit(test_event("s")).await);

    let stats = harness.relay.stats().await;
    assert_eq!(stats.rejected.get("backpressure"), Some(&1));
}

#[tokio::test]
async fn duplicate_key_returns_original_event_id() {
    let harness = RelayHarness::builder().https("d").build().unwrap();

    let original = Event::builder("github", "delivery-42", "first").build();
    let replay = Event::builder("github", "delivery-42", "second").build();
    let other_source = Event::builder("gitlab", "delivery-42", "third").build();

    let original_id = accepted_id(harness.relay.submit(original).await);
    let duplicate = harness.relay.submit(replay).await.unwrap();
    assert_eq!(duplicate, Submission::Duplicate { event_id: original_id });

    accepted_id(harness.relay.submit(other_source).await);
    harness.events.wait_for_completions(2).await;

    assert_eq!(harness.transport.attempt_count(), 2);
    let stats = harness.relay.stats().await;
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.accepted, 2);
}

#[tokio::test]
async fn invalid_events_are_rejected() {
    let harness = RelayHarness::builder().https("d").build().unwrap();

    let empty = Event::builder("s", "k", "").build();
    assert_eq!(
        harness.relay.submit(empty).await,
        Err(Rejection::Validation(ValidationError::EmptyPayload))
    );

    let bad_key = Event::builder("s", "has space", "p").build();
    let rejection = harness.relay.submit(bad_key).await.unwrap_err();
    assert!(matches!(
        rejection,
        Rejection::Validation(ValidationError::MalformedIdempotencyKey { .. })
    ));
    assert!(!rejection.is_retryable());
    assert!(IdempotencyKey::parse("has space").is_err());
}

#[tokio::test]
async fn unroutable_event_is_rejected_and_releases_its_key() {
    let harness = RelayHarness::builder()
        .https("ci")
        .route(Route::for_source("github").to("ci"))
        .build()
        .unwrap();

    let rejection =
        harness.relay.submit(Event::builder("gitlab", "k-1", "p").build()).await.unwrap_err();
    assert_eq!(rejection, Rejection::NoRoute(NoRoute { source_id: "gitlab".to_string() }));
    assert!(!rejection.is_retryable());

    accepted_id(harness.relay.submit(Event::builder("github", "k-1", "p").build()).await);
    let snapshots = harness.relay.dispatcher_snapshots().await;
    assert!(snapshots.iter().all(|s| s.destination.as_str() == "ci"));
}

#[tokio::test]
async fn full_queue_rejects_without_partial_fan_out() {
    let harness =
        RelayHarness::builder().https("fast").https("slow").queue_depth(1).build().unwrap();
    let gate = Arc::new(Notify::new());
    harness.transport.script("slow", [Reply::Hold(gate.clone())]);

    let first = accepted_id(harness.relay.submit(test_event("s")).await);
    harness.transport.wait_for_attempts(2).await;
    let second = accepted_id(harness.relay.submit(test_event("s")).await);
    harness.transport.wait_for_attempts(3).await;

    let blocked = Event::builder("s", "blocked-key", "p").build();
    let rejection = harness.relay.submit(blocked).await.unwrap_err();
    assert_eq!(rejection, Rejection::QueueFull { destination: "slow".into() });
    assert!(rejection.is_retryable());

    gate.notify_one();
    harness.events.wait_for_completion(first).await;
    harness.events.wait_for_completion(second).await;

    assert_eq!(harness.transport.attempts_for("fast").len(), 2);
    assert_eq!(harness.transport.attempts_for("slow").len(), 2);

    let retried = Event::builder("s", "blocked-key", "p").build();
    let retried_id = accepted_id(harness.relay.submit(retried).await);
    let record = harness.events.wait_for_completion(retried_id).await;
    assert_eq!(record.status, CompletionStatus::Delivered);
}

#[tokio::test]
async fn cancelled_event_is_skipped_by_dispatcher() {
    let harness = RelayHarness::builder().https("d").build().unwrap();
    let gate = Arc::new(Notify::new());
    harness.transport.script("d", [Reply::Hold(gate.clone())]);

    let head = accepted_id(harness.relay.submit(test_event("s")).await);
    harness.transport.wait_for_attempts(1).await;
    let queued = accepted_id(harness.relay.submit(test_event("s")).await);

    assert!(harness.relay.cancel(queued));
    gate.notify_one();

    let record = harness.events.wait_for_completion(queued).await;
    assert_eq!(record.status, CompletionStatus::Cancelled);
    assert_eq!(record.outcome("d").unwrap().attempts, 0);

    let head_record = harness.events.wait_for_completion(head).await;
    assert_eq!(head_record.status, CompletionStatus::Delivered);
    assert!(harness.transport.attempts().iter().all(|a| a.event_id != queued));

    assert!(!harness.relay.cancel(queued));
}

#[tokio::test]
async fn completion_timeout_reports_pending_branches_as_timed_out() {
    let harness = RelayHarness::builder()
        .https("stuck")
        .https("ok")
        .completion_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let gate = Arc::new(Notify::new());
    harness.transport.script("stuck", [Reply::Hold(gate)]);

    let event = test_event("s");
    let id = event.id();
    accepted_id(harness.relay.submit(event).await);
    harness.transport.wait_for_attempts(2).await;
    while !harness.relay.dispatcher_snapshots().await.iter().any(|d| d.delivered == 1) {
        tokio::task::yield_now().await;
    }
    assert!(harness.events.completion(id).is_none());

    harness.clock.advance(Duration::from_millis(200));
    let record = harness.events.wait_for_completion(id).await;

    assert_eq!(record.status, CompletionStatus::PartiallyDelivered);
    assert_eq!(record.outcome("stuck").unwrap().status, DestinationStatus::TimedOut);
    assert_eq!(record.outcome("ok").unwrap().status, DestinationStatus::Delivered);
}

#[tokio::test]
async fn shutdown_cancels_in_flight_events_and_stops_intake() {
    let harness = RelayHarness::builder()
        .https("d")
        .attempt_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    harness.transport.script("d", [Reply::Stall(Duration::from_secs(10))]);

    let in_flight = accepted_id(harness.relay.submit(test_event("s")).await);
    harness.transport.wait_for_attempts(1).await;

    harness.relay.shutdown(Duration::from_secs(5)).await.unwrap();

    let record =
        harness.events.completion(in_flight).expect("completion emitted before shutdown returns");
    assert_eq!(record.status, CompletionStatus::Cancelled);
    assert_eq!(record.outcome("d").unwrap().attempts, 1);

    assert!(harness.relay.is_shutting_down());
    assert_eq!(harness.relay.submit(test_event("s")).await, Err(Rejection::ShuttingDown));
}

#[tokio::test]
async fn stats_track_submissions_and_completions() {
    let harness = RelayHarness::builder().https("d").build().unwrap();
    harness.transport.script("d", [Reply::bad_request()]);

    harness.deliver(test_event("s")).await;
    harness.deliver(test_event("s")).await;
    let _ = harness.relay.submit(Event::builder("s", "k", "").build()).await;

    let stats = harness.relay.stats().await;
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.rejected.get("validation"), Some(&1));
    assert_eq!(stats.completed.get("failed"), Some(&1));
    assert_eq!(stats.completed.get("delivered"), Some(&1));
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.dispatchers, 1);
    assert!(harness.relay.is_healthy().await);
}
