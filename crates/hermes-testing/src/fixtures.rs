//! Fixture builders.
//!
//! [`RelayHarness`] wires a complete relay to a [`ScriptedTransport`], a
//! [`RecordingEventHandler`] and a [`TestClock`]. Unless routes are given,
//! every destination receives every event.

use std::{sync::Arc, time::Duration};

use hermes_core::{CompletionRecord, Destination, Event, TestClock, TransportKind};
use hermes_delivery::{
    CircuitConfig, ClientConfig, DeliveryClient, IdempotencyConfig, RelayConfig, RelayCore,
    RetryPolicy, Route, RoutingConfig, RoutingError, RoutingTable, Submission,
};
use uuid::Uuid;

use crate::{events::RecordingEventHandler, transport::ScriptedTransport};

/// Source used by [`test_event`] when none is given.
pub const TEST_SOURCE: &str = "test";

/// Creates an event with a unique idempotency key and a small JSON payload.
pub fn test_event(source: &str) -> Event {
    Event::builder(source, format!("test-{}", Uuid::new_v4()), r#"{"message":"test"}"#)
        .content_type("application/json")
        .build()
}

/// Creates an HTTPS destination under the reserved `.test` TLD.
pub fn https_destination(key: &str) -> Destination {
    Destination::new(key, TransportKind::Https, format!("https://{key}.hermes.test/hooks"))
}

/// Relay config tuned for tests: no jitter, 100ms base backoff, three
/// attempts, a threshold-5 circuit and small queues.
pub fn test_relay_config() -> RelayConfig {
    RelayConfig {
        max_in_flight: 64,
        queue_depth: 16,
        completion_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(5),
        idempotency: IdempotencyConfig { capacity: 1024, ttl: Duration::from_secs(3600) },
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_elapsed: Duration::from_secs(5),
            ..RetryPolicy::default()
        }
        .without_jitter(),
        circuit: CircuitConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        },
    }
}

/// A relay wired to test doubles.
#[derive(Debug)]
pub struct RelayHarness {
    /// The relay under test.
    pub relay: Arc<RelayCore>,
    /// Transport every destination delivers through.
    pub transport: Arc<ScriptedTransport>,
    /// Recorder receiving every relay event.
    pub events: Arc<RecordingEventHandler>,
    /// Virtual clock shared by every dispatcher.
    pub clock: TestClock,
}

impl RelayHarness {
    /// Starts a builder.
    pub fn builder() -> RelayHarnessBuilder {
        RelayHarnessBuilder::default()
    }

    /// Submits an event and waits for its completion record.
    ///
    /// # Panics
    ///
    /// Panics if the event is not accepted or never completes.
    pub async fn deliver(&self, event: Event) -> CompletionRecord {
        match self.relay.submit(event).await {
            Ok(Submission::Accepted { event_id, .. }) => {
                self.events.wait_for_completion(event_id).await
            },
            other => panic!("expected the event to be accepted, got {other:?}"),
        }
    }
}

/// Builder for [`RelayHarness`].
#[derive(Debug)]
pub struct RelayHarnessBuilder {
    destinations: Vec<Destination>,
    routes: Vec<Route>,
    config: RelayConfig,
    client: ClientConfig,
    clock: TestClock,
}

impl Default for RelayHarnessBuilder {
    fn default() -> Self {
        Self {
            destinations: Vec::new(),
            routes: Vec::new(),
            config: test_relay_config(),
            client: ClientConfig { timeout: Duration::from_secs(5), ..ClientConfig::default() },
            clock: TestClock::new(),
        }
    }
}

impl RelayHarnessBuilder {
    /// Adds a destination.
    #[must_use]
    pub fn destination(mut self, destination: Destination) -> Self {
        self.destinations.push(destination);
        self
    }

    /// Adds an HTTPS destination built by [`https_destination`].
    #[must_use]
    pub fn https(self, key: &str) -> Self {
        self.destination(https_destination(key))
    }

    /// Adds a route. Without any, a catch-all route targets every
    /// destination in insertion order.
    #[must_use]
    pub fn route(mut self, route: Route) -> Self {
        self.routes.push(route);
        self
    }

    /// Replaces the relay config.
    #[must_use]
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Replaces the circuit thresholds.
    #[must_use]
    pub fn circuit(mut self, circuit: CircuitConfig) -> Self {
        self.config.circuit = circuit;
        self
    }

    /// Sets the global in-flight cap.
    #[must_use]
    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.config.max_in_flight = max_in_flight;
        self
    }

    /// Sets the per-destination queue bound.
    #[must_use]
    pub fn queue_depth(mut self, queue_depth: usize) -> Self {
        self.config.queue_depth = queue_depth;
        self
    }

    /// Sets the completion timeout.
    #[must_use]
    pub fn completion_timeout(mut self, timeout: Duration) -> Self {
        self.config.completion_timeout = timeout;
        self
    }

    /// Sets the default per-attempt timeout.
    #[must_use]
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.client.timeout = timeout;
        self
    }

    /// Builds the relay.
    ///
    /// # Errors
    ///
    /// Returns a [`RoutingError`] if the destinations and routes do not form
    /// a valid routing table.
    pub fn build(self) -> Result<RelayHarness, RoutingError> {
        let routes = if self.routes.is_empty() {
            let catch_all = self
                .destinations
                .iter()
                .fold(Route::catch_all(), |route, destination| route.to(destination.key.clone()));
            vec![catch_all]
        } else {
            self.routes
        };

        let routing =
            RoutingTable::build(RoutingConfig { destinations: self.destinations, routes })?;

        let transport = Arc::new(ScriptedTransport::new());
        let events = Arc::new(RecordingEventHandler::new());
        let client = DeliveryClient::with_transport(self.client, transport.clone());

        let relay = RelayCore::new(self.config, Arc::new(routing), Arc::new(client))
            .with_clock(Arc::new(self.clock.clone()))
            .with_event_handler(events.clone());

        Ok(RelayHarness { relay: Arc::new(relay), transport, events, clock: self.clock })
    }
}
