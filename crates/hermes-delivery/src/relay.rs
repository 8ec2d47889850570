//! Relay core: intake, fan-out and completion tracking.
//!
//! `submit` validates an event, deduplicates it, resolves its destinations
//! and reserves a slot on every destination's dispatcher before enqueuing
//! anything, so a rejected event never leaves a partial fan-out behind.
//! Each accepted event gets an aggregator task that waits for every branch
//! (or the completion timeout) and emits one [`CompletionRecord`].

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use hermes_core::{
    Clock, CompletionRecord, CompletionStatus, Destination, DestinationKey, DestinationOutcome,
    DestinationStatus, Event, EventHandler, EventId, RealClock, RelayEvent, TracingEventHandler,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    circuit::{CircuitConfig, CircuitStatus},
    client::DeliveryClient,
    dispatcher::{Dispatcher, DispatcherContext, DispatcherSnapshot, QueuedAttempt},
    error::{DeliveryError, Result},
    idempotency::{IdempotencyConfig, IdempotencyWindow},
    resolver::{NoRoute, RoutingTable},
    retry::RetryPolicy,
};

/// Relay limits and policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Events accepted but not yet completed, across all destinations.
    pub max_in_flight: usize,
    /// Bound of each destination queue.
    pub queue_depth: usize,
    /// Longest wait for every branch of one event to resolve.
    pub completion_timeout: Duration,
    /// Longest wait for workers to drain on shutdown.
    pub shutdown_timeout: Duration,
    /// Idempotency dedupe window.
    pub idempotency: IdempotencyConfig,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 1024,
            queue_depth: 256,
            completion_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
            idempotency: IdempotencyConfig::default(),
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
        }
    }
}

/// Successful outcome of `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    /// The event was queued for every listed destination.
    Accepted {
        /// ID assigned to the event.
        event_id: EventId,
        /// Destinations the event fans out to, in resolution order.
        destinations: Vec<DestinationKey>,
    },
    /// The idempotency key was already accepted; nothing was queued.
    Duplicate {
        /// ID of the event originally accepted with this key.
        event_id: EventId,
    },
}

impl Submission {
    /// ID of the accepted or original event.
    pub fn event_id(&self) -> EventId {
        match self {
            Self::Accepted { event_id, .. } | Self::Duplicate { event_id } => *event_id,
        }
    }
}

/// Reasons `submit` refuses an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The event is malformed.
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),

    /// Shutdown has begun.
    #[error("relay is shutting down")]
    ShuttingDown,

    /// The in-flight cap is reached.
    #[error("in-flight limit of {limit} events reached")]
    Backpressure {
        /// Configured cap.
        limit: usize,
    },

    /// No route matches the event.
    #[error(transparent)]
    NoRoute(#[from] NoRoute),

    /// A destination queue is full.
    #[error("queue full for destination {destination}")]
    QueueFull {
        /// First destination found full.
        destination: DestinationKey,
    },
}

impl Rejection {
    /// Whether resubmitting later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::QueueFull { .. } | Self::ShuttingDown)
    }

    /// Short label for logs and counters.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ShuttingDown => "shutting_down",
            Self::Backpressure { .. } => "backpressure",
            Self::NoRoute(_) => "no_route",
            Self::QueueFull { .. } => "queue_full",
        }
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Calls to `submit`.
    pub submitted: u64,
    /// Events accepted.
    pub accepted: u64,
    /// Submissions recognised as duplicates.
    pub duplicates: u64,
    /// Rejections by reason label.
    pub rejected: HashMap<String, u64>,
    /// Completion records by status.
    pub completed: HashMap<String, u64>,
    /// Events accepted but not yet completed.
    pub in_flight: usize,
    /// Dispatchers spawned so far.
    pub dispatchers: usize,
}

struct InFlight {
    cancel: CancellationToken,
}

/// The relay.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct RelayCore {
    config: RelayConfig,
    routing: Arc<RoutingTable>,
    context: DispatcherContext,
    dispatchers: RwLock<HashMap<DestinationKey, Dispatcher>>,
    in_flight_permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<EventId, InFlight>>>,
    dedupe: Arc<Mutex<IdempotencyWindow>>,
    stats: Arc<RwLock<RelayStats>>,
    root: CancellationToken,
    tracker: TaskTracker,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for RelayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCore")
            .field("config", &self.config)
            .field("shutting_down", &self.shutting_down.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl RelayCore {
    /// Creates a relay on the real clock that logs relay events via
    /// `tracing`.
    pub fn new(
        config: RelayConfig,
        routing: Arc<RoutingTable>,
        client: Arc<DeliveryClient>,
    ) -> Self {
        let context = DispatcherContext {
            client,
            retry: config.retry.clone(),
            circuit: config.circuit.clone(),
            clock: Arc::new(RealClock::new()),
            events: Arc::new(TracingEventHandler::new()),
            queue_capacity: config.queue_depth,
        };

        Self {
            in_flight_permits: Arc::new(Semaphore::new(config.max_in_flight)),
            dedupe: Arc::new(Mutex::new(IdempotencyWindow::new(config.idempotency.clone()))),
            config,
            routing,
            context,
            dispatchers: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Replaces the time source. Must be called before the first submit.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.context.clock = clock;
        self
    }

    /// Replaces the relay event sink. Must be called before the first
    /// submit.
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.context.events = events;
        self
    }

    /// Relay configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Submits an event for delivery.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] when the event is invalid, the relay is
    /// shutting down, the in-flight cap is reached, no route matches, or a
    /// destination queue is full. A rejection has no side effects on any
    /// queue.
    pub async fn submit(&self, event: Event) -> std::result::Result<Submission, Rejection> {
        self.stats.write().await.submitted += 1;

        let result = self.try_submit(event).await;

        let mut stats = self.stats.write().await;
        match &result {
            Ok(Submission::Accepted { .. }) => stats.accepted += 1,
            Ok(Submission::Duplicate { .. }) => stats.duplicates += 1,
            Err(rejection) => {
                *stats.rejected.entry(rejection.reason().to_string()).or_default() += 1;
            },
        }

        result
    }

    async fn try_submit(&self, event: Event) -> std::result::Result<Submission, Rejection> {
        let key = event.validate()?;

        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Rejection::ShuttingDown);
        }

        let event_id = event.id();
        let source = event.source().to_string();
        {
            let mut dedupe = self.dedupe.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(original) = dedupe.claim(&source, &key, event_id, self.context.clock.now()) {
                debug!(event_id = %original, source = %source, key = %key, "duplicate event");
                return Ok(Submission::Duplicate { event_id: original });
            }
        }

        let release_claim = || {
            let mut dedupe = self.dedupe.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            dedupe.release(&source, &key, event_id);
        };

        let Ok(permit) = self.in_flight_permits.clone().try_acquire_owned() else {
            release_claim();
            return Err(Rejection::Backpressure { limit: self.config.max_in_flight });
        };

        let destinations = match self.routing.resolve(&event) {
            Ok(destinations) => destinations,
            Err(no_route) => {
                release_claim();
                return Err(no_route.into());
            },
        };

        let mut reservations = Vec::with_capacity(destinations.len());
        for destination in &destinations {
            let reserved = match self.dispatcher(destination).await {
                Ok(dispatcher) => dispatcher.reserve(),
                Err(error) => Err(error),
            };

            match reserved {
                Ok(slot) => reservations.push((destination.key.clone(), slot)),
                Err(error) => {
                    drop(reservations);
                    release_claim();
                    return Err(match error {
                        DeliveryError::QueueFull { .. } => {
                            warn!(
                                event_id = %event_id,
                                destination = %destination.key,
                                "destination queue full"
                            );
                            Rejection::QueueFull { destination: destination.key.clone() }
                        },
                        _ => Rejection::ShuttingDown,
                    });
                },
            }
        }

        let event = Arc::new(event);
        let cancel = self.root.child_token();
        let accepted_at = self.context.clock.now_utc();
        let keys: Vec<DestinationKey> = reservations.iter().map(|(key, _)| key.clone()).collect();

        let mut pending = Vec::with_capacity(reservations.len());
        for (key, slot) in reservations {
            let (attempt, outcome) = QueuedAttempt::new(event.clone(), cancel.clone());
            slot.send(attempt);
            pending.push((key, outcome));
        }

        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(event_id, InFlight { cancel: cancel.clone() });

        info!(
            event_id = %event_id,
            source = %event.source(),
            destinations = keys.len(),
            "event accepted"
        );

        let aggregator = Aggregator {
            event,
            accepted_at,
            cancel,
            timeout: self.config.completion_timeout,
            deadline: self.context.clock.now() + self.config.completion_timeout,
            clock: self.context.clock.clone(),
            events: self.context.events.clone(),
            stats: self.stats.clone(),
            in_flight: self.in_flight.clone(),
        };
        self.tracker.spawn(aggregator.run(pending, permit));

        Ok(Submission::Accepted { event_id, destinations: keys })
    }

    /// Marks an in-flight event cancelled on every destination.
    ///
    /// Returns `false` when the event is unknown or already complete.
    pub fn cancel(&self, event_id: EventId) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match in_flight.get(&event_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(event_id = %event_id, "event cancelled");
                true
            },
            None => false,
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> RelayStats {
        let mut stats = self.stats.read().await.clone();
        stats.in_flight = self.config.max_in_flight - self.in_flight_permits.available_permits();
        stats.dispatchers = self.dispatchers.read().await.len();
        stats
    }

    /// Snapshot of every dispatcher, ordered by destination key.
    pub async fn dispatcher_snapshots(&self) -> Vec<DispatcherSnapshot> {
        let mut snapshots: Vec<_> =
            self.dispatchers.read().await.values().map(Dispatcher::snapshot).collect();
        snapshots.sort_by(|a, b| a.destination.cmp(&b.destination));
        snapshots
    }

    /// Whether every dispatcher's circuit is closed.
    pub async fn is_healthy(&self) -> bool {
        self.dispatchers
            .read()
            .await
            .values()
            .all(|d| d.snapshot().circuit.status == CircuitStatus::Closed)
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stops intake, cancels every in-flight event, closes the dispatcher
    /// queues and waits for workers and aggregators to finish.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InternalError` if tasks are still running when
    /// `timeout` elapses.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("shutdown already in progress");
        }

        let in_flight = self.config.max_in_flight - self.in_flight_permits.available_permits();
        info!(in_flight, timeout_ms = timeout.as_millis(), "relay shutting down");

        self.root.cancel();
        self.dispatchers.write().await.clear();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            warn!(remaining_tasks = self.tracker.len(), "relay shutdown timed out");
            return Err(DeliveryError::internal(format!(
                "{} tasks still running after {}ms",
                self.tracker.len(),
                timeout.as_millis()
            )));
        }

        info!("relay shutdown complete");
        Ok(())
    }

    async fn dispatcher(&self, destination: &Arc<Destination>) -> Result<Dispatcher> {
        if let Some(dispatcher) = self.dispatchers.read().await.get(&destination.key) {
            if !dispatcher.is_closed() {
                return Ok(dispatcher.clone());
            }
        }

        let mut dispatchers = self.dispatchers.write().await;
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(DeliveryError::ShutdownRequested);
        }

        if let Some(existing) = dispatchers.get(&destination.key) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
            warn!(destination = %destination.key, "dispatcher stopped unexpectedly, respawning");
        }

        let dispatcher =
            Dispatcher::spawn(destination.clone(), &self.context, self.root.clone(), &self.tracker);
        dispatchers.insert(destination.key.clone(), dispatcher.clone());
        Ok(dispatcher)
    }
}

struct Aggregator {
    event: Arc<Event>,
    accepted_at: chrono::DateTime<chrono::Utc>,
    cancel: CancellationToken,
    timeout: Duration,
    deadline: Instant,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventHandler>,
    stats: Arc<RwLock<RelayStats>>,
    in_flight: Arc<Mutex<HashMap<EventId, InFlight>>>,
}

impl Aggregator {
    async fn run(
        self,
        pending: Vec<(DestinationKey, oneshot::Receiver<DestinationOutcome>)>,
        permit: OwnedSemaphorePermit,
    ) {
        let keys: Vec<DestinationKey> = pending.iter().map(|(key, _)| key.clone()).collect();
        let mut outcomes: Vec<Option<DestinationOutcome>> = vec![None; keys.len()];

        let mut branches: FuturesUnordered<_> = pending
            .into_iter()
            .enumerate()
            .map(|(index, (_, outcome))| outcome.map(move |result| (index, result)))
            .collect();

        let collect = async {
            while let Some((index, result)) = branches.next().await {
                outcomes[index] = Some(match result {
                    Ok(outcome) => outcome,
                    Err(_) => DestinationOutcome::new(
                        keys[index].clone(),
                        DestinationStatus::Failed,
                        0,
                        self.clock.now_utc(),
                    )
                    .with_error("dispatcher stopped before reporting an outcome"),
                });
            }
        };

        let timed_out = tokio::select! {
            biased;
            () = collect => false,
            () = self.clock.sleep_until(self.deadline) => true,
        };

        if timed_out {
            warn!(
                event_id = %self.event.id(),
                timeout_ms = self.timeout.as_millis(),
                "completion timeout elapsed, cancelling pending branches"
            );
            self.cancel.cancel();
        }

        let completed_at = self.clock.now_utc();
        let outcomes: Vec<DestinationOutcome> = outcomes
            .into_iter()
            .zip(keys)
            .map(|(outcome, key)| {
                outcome.unwrap_or_else(|| {
                    DestinationOutcome::new(key, DestinationStatus::TimedOut, 0, completed_at)
                        .with_error("completion timeout elapsed")
                })
            })
            .collect();

        let record = CompletionRecord {
            event_id: self.event.id(),
            source: self.event.source().to_string(),
            idempotency_key: self.event.idempotency_key().to_string(),
            status: CompletionStatus::aggregate(&outcomes),
            outcomes,
            accepted_at: self.accepted_at,
            completed_at,
        };

        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&record.event_id);
        *self.stats.write().await.completed.entry(record.status.to_string()).or_default() += 1;
        drop(permit);

        self.events.handle_event(RelayEvent::Completed(record)).await;
    }
}
