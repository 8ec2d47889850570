//! Per-destination dispatcher.
//!
//! Each destination gets one worker task fed by a bounded `mpsc` queue.
//! The worker processes attempts strictly in order: a failing event stays
//! at the head of the line, and blocks only its own destination, until it is
//! delivered, abandoned by the retry policy, or cancelled.
//!
//! ```text
//!  RelayCore ──try_reserve──▶ [ bounded queue ] ──▶ worker ──▶ DeliveryClient
//!      ▲                                              │
//!      └──────────── oneshot DestinationOutcome ──────┘
//!                                                     │
//!                               watch DispatcherSnapshot ──▶ observers
//! ```
//!
//! The circuit breaker lives inside the worker; nothing else mutates it.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Instant};

use futures::FutureExt;
use hermes_core::{
    AttemptFailedEvent, AttemptStartedEvent, AttemptSucceededEvent, Clock, Destination,
    DestinationKey, DestinationOutcome, DestinationStatus, Event, EventHandler, RelayEvent,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{
    mpsc::{self, error::TrySendError, OwnedPermit},
    oneshot, watch,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot},
    client::{DeliveryClient, DeliveryReceipt, DeliveryRequest},
    error::DeliveryError,
    retry::{RetryDecision, RetryPolicy},
};

/// Shared collaborators for every dispatcher the relay spawns.
#[derive(Debug, Clone)]
pub struct DispatcherContext {
    /// Client used for every attempt.
    pub client: Arc<DeliveryClient>,
    /// Default retry policy; a destination may override `max_attempts`.
    pub retry: RetryPolicy,
    /// Circuit breaker thresholds.
    pub circuit: CircuitConfig,
    /// Time source for backoff and cooldowns.
    pub clock: Arc<dyn Clock>,
    /// Sink for attempt events.
    pub events: Arc<dyn EventHandler>,
    /// Bound of each dispatcher queue.
    pub queue_capacity: usize,
}

/// One event waiting in a dispatcher queue.
#[derive(Debug)]
pub struct QueuedAttempt {
    event: Arc<Event>,
    cancel: CancellationToken,
    reply: oneshot::Sender<DestinationOutcome>,
}

impl QueuedAttempt {
    /// Creates a queue entry and the receiver its outcome will arrive on.
    pub fn new(
        event: Arc<Event>,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<DestinationOutcome>) {
        let (reply, outcome) = oneshot::channel();
        (Self { event, cancel, reply }, outcome)
    }

    /// Event this entry delivers.
    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }
}

/// Observable state of one dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSnapshot {
    /// Destination served by the dispatcher.
    pub destination: DestinationKey,
    /// Circuit breaker state.
    pub circuit: CircuitSnapshot,
    /// Entries waiting or reserved in the queue.
    pub queue_depth: usize,
    /// Queue bound.
    pub queue_capacity: usize,
    /// Transport calls made.
    pub attempts: u64,
    /// Events delivered.
    pub delivered: u64,
    /// Events that failed permanently or exhausted retries.
    pub failed: u64,
    /// Events skipped because the circuit was open.
    pub circuit_rejections: u64,
    /// Events skipped because they were cancelled.
    pub cancelled: u64,
}

/// Handle to a running dispatcher.
///
/// Dropping every handle closes the queue; the worker finishes what is
/// queued and exits.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    destination: Arc<Destination>,
    sender: mpsc::Sender<QueuedAttempt>,
    snapshot: watch::Receiver<DispatcherSnapshot>,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Spawns the worker for `destination` on `tracker`.
    ///
    /// Cancelling `shutdown` closes the queue: entries already queued are
    /// drained (and, their events being cancelled, reported as such) before
    /// the worker exits.
    pub fn spawn(
        destination: Arc<Destination>,
        context: &DispatcherContext,
        shutdown: CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        let capacity = context.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        let circuit = CircuitBreaker::new(destination.key.to_string(), context.circuit.clone());
        let initial = DispatcherSnapshot {
            destination: destination.key.clone(),
            circuit: circuit.snapshot(context.clock.now()),
            queue_depth: 0,
            queue_capacity: capacity,
            attempts: 0,
            delivered: 0,
            failed: 0,
            circuit_rejections: 0,
            cancelled: 0,
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial.clone());

        let retry = match destination.max_attempts {
            Some(max_attempts) => context.retry.clone().with_max_attempts(max_attempts),
            None => context.retry.clone(),
        };

        let worker = DispatcherWorker {
            destination: destination.clone(),
            client: context.client.clone(),
            retry,
            circuit,
            clock: context.clock.clone(),
            events: context.events.clone(),
            receiver,
            queue: sender.downgrade(),
            snapshot: snapshot_tx,
            stats: initial,
            shutdown,
        };

        info!(
            destination = %destination.key,
            transport = %destination.transport,
            capacity,
            "dispatcher started"
        );
        tracker.spawn(worker.run());

        Self { destination, sender, snapshot: snapshot_rx, clock: context.clock.clone() }
    }

    /// Destination served by this dispatcher.
    pub fn destination(&self) -> &Arc<Destination> {
        &self.destination
    }

    /// Appends an attempt to the queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` when the queue is at capacity and
    /// `ShutdownRequested` when the worker has stopped.
    pub fn enqueue(&self, attempt: QueuedAttempt) -> Result<(), DeliveryError> {
        self.sender.try_send(attempt).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::queue_full(self.destination.key.as_str()),
            TrySendError::Closed(_) => DeliveryError::ShutdownRequested,
        })
    }

    /// Reserves one queue slot without enqueuing anything yet.
    ///
    /// Dropping the permit releases the slot.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::enqueue`].
    pub fn reserve(&self) -> Result<OwnedPermit<QueuedAttempt>, DeliveryError> {
        self.sender.clone().try_reserve_owned().map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::queue_full(self.destination.key.as_str()),
            TrySendError::Closed(_) => DeliveryError::ShutdownRequested,
        })
    }

    /// Entries waiting or reserved in the queue.
    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Whether the worker has stopped accepting entries.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Latest snapshot with a live queue depth.
    pub fn snapshot(&self) -> DispatcherSnapshot {
        let mut snapshot = self.snapshot.borrow().clone();
        snapshot.queue_depth = self.queue_depth();
        snapshot.circuit = snapshot.circuit.at(self.clock.now());
        snapshot
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<DispatcherSnapshot> {
        self.snapshot.clone()
    }
}

struct DispatcherWorker {
    destination: Arc<Destination>,
    client: Arc<DeliveryClient>,
    retry: RetryPolicy,
    circuit: CircuitBreaker,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventHandler>,
    receiver: mpsc::Receiver<QueuedAttempt>,
    queue: mpsc::WeakSender<QueuedAttempt>,
    snapshot: watch::Sender<DispatcherSnapshot>,
    stats: DispatcherSnapshot,
    shutdown: CancellationToken,
}

impl DispatcherWorker {
    async fn run(mut self) {
        let mut closing = false;

        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled(), if !closing => {
                    debug!(destination = %self.destination.key, "closing dispatcher queue");
                    self.receiver.close();
                    closing = true;
                    continue;
                },
                next = self.receiver.recv() => next,
            };

            let Some(QueuedAttempt { event, cancel, reply }) = next else {
                break;
            };

            let outcome = self.process(&event, &cancel).await;
            self.publish();

            if reply.send(outcome).is_err() {
                debug!(
                    event_id = %event.id(),
                    destination = %self.destination.key,
                    "outcome receiver dropped"
                );
            }
        }

        info!(destination = %self.destination.key, "dispatcher stopped");
    }

    /// Runs one event to a terminal outcome for this destination.
    async fn process(
        &mut self,
        event: &Arc<Event>,
        cancel: &CancellationToken,
    ) -> DestinationOutcome {
        let started = self.clock.now();
        let mut attempts = 0u32;
        let mut last_error: Option<DeliveryError> = None;

        loop {
            if cancel.is_cancelled() {
                return self.cancelled(event, attempts, last_error.as_ref());
            }

            if !self.circuit.try_acquire(self.clock.now()) {
                self.stats.circuit_rejections += 1;
                let error = DeliveryError::circuit_open(self.destination.key.as_str());
                debug!(
                    event_id = %event.id(),
                    destination = %self.destination.key,
                    "circuit open, skipping attempt"
                );
                return self
                    .outcome(DestinationStatus::CircuitOpen, attempts)
                    .with_error(error.to_string());
            }

            attempts += 1;
            let request = DeliveryRequest::new(event.clone(), attempts);
            self.emit_started(&request).await;
            self.stats.attempts += 1;

            let attempt_started = self.clock.now();
            let result = AssertUnwindSafe(self.client.deliver(&request, &self.destination))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(DeliveryError::internal("transport panicked")));

            let error = match result {
                Ok(receipt) => {
                    self.circuit.record_success();
                    self.stats.delivered += 1;
                    self.emit_succeeded(&request, &receipt, attempt_started).await;
                    return self.outcome(DestinationStatus::Delivered, attempts);
                },
                Err(error) => error,
            };

            self.circuit.record_failure(&error, self.clock.now());
            let elapsed = self.clock.now().saturating_duration_since(started);
            let decision = self.retry.next(attempts, &error, elapsed);
            let will_retry = matches!(decision, RetryDecision::Retry { .. });
            self.emit_failed(&request, &error, will_retry).await;

            match decision {
                RetryDecision::Retry { delay } => {
                    debug!(
                        event_id = %event.id(),
                        destination = %self.destination.key,
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying after backoff"
                    );
                    self.publish();

                    let interrupted = tokio::select! {
                        biased;
                        () = cancel.cancelled() => true,
                        () = self.clock.sleep(delay) => false,
                    };
                    last_error = Some(error);

                    if interrupted {
                        return self.cancelled(event, attempts, last_error.as_ref());
                    }
                },
                RetryDecision::GiveUp { reason } => {
                    let error = if error.is_retryable() {
                        DeliveryError::retries_exhausted(attempts, &error)
                    } else {
                        error
                    };
                    error!(
                        event_id = %event.id(),
                        destination = %self.destination.key,
                        attempts,
                        reason = %reason,
                        error = %error,
                        "delivery failed"
                    );
                    self.stats.failed += 1;
                    return self
                        .outcome(DestinationStatus::Failed, attempts)
                        .with_error(error.to_string());
                },
            }
        }
    }

    fn cancelled(
        &mut self,
        event: &Event,
        attempts: u32,
        last_error: Option<&DeliveryError>,
    ) -> DestinationOutcome {
        self.stats.cancelled += 1;
        debug!(
            event_id = %event.id(),
            destination = %self.destination.key,
            attempts,
            "event cancelled"
        );

        let outcome = self.outcome(DestinationStatus::Cancelled, attempts);
        match last_error {
            Some(error) => outcome.with_error(error.to_string()),
            None => outcome,
        }
    }

    fn outcome(&self, status: DestinationStatus, attempts: u32) -> DestinationOutcome {
        DestinationOutcome::new(self.destination.key.clone(), status, attempts, self.clock.now_utc())
    }

    fn publish(&mut self) {
        self.stats.circuit = self.circuit.snapshot(self.clock.now());
        self.stats.queue_depth =
            self.queue.upgrade().map_or(0, |sender| sender.max_capacity() - sender.capacity());
        self.snapshot.send_replace(self.stats.clone());
    }

    async fn emit_started(&self, request: &DeliveryRequest) {
        self.events
            .handle_event(RelayEvent::AttemptStarted(AttemptStartedEvent {
                delivery_id: request.delivery_id,
                event_id: request.event.id(),
                destination: self.destination.key.clone(),
                attempt_number: request.attempt_number,
                started_at: self.clock.now_utc(),
            }))
            .await;
    }

    async fn emit_succeeded(
        &self,
        request: &DeliveryRequest,
        receipt: &DeliveryReceipt,
        started: Instant,
    ) {
        let duration = self.clock.now().saturating_duration_since(started).max(receipt.duration);
        self.events
            .handle_event(RelayEvent::AttemptSucceeded(AttemptSucceededEvent {
                delivery_id: request.delivery_id,
                event_id: request.event.id(),
                destination: self.destination.key.clone(),
                attempt_number: request.attempt_number,
                response_status: receipt.status_code,
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                delivered_at: self.clock.now_utc(),
            }))
            .await;
    }

    async fn emit_failed(&self, request: &DeliveryRequest, error: &DeliveryError, will_retry: bool) {
        if !will_retry && error.is_retryable() {
            warn!(
                event_id = %request.event.id(),
                destination = %self.destination.key,
                attempt = request.attempt_number,
                error = %error,
                "giving up on transient failure"
            );
        }

        self.events
            .handle_event(RelayEvent::AttemptFailed(AttemptFailedEvent {
                delivery_id: request.delivery_id,
                event_id: request.event.id(),
                destination: self.destination.key.clone(),
                attempt_number: request.attempt_number,
                error_message: error.to_string(),
                error_category: error.category().to_string(),
                is_retryable: error.is_retryable(),
                will_retry,
                failed_at: self.clock.now_utc(),
            }))
            .await;
    }
}
