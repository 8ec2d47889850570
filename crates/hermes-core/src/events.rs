//! Relay observability events and the handler traits that consume them.
//!
//! Dispatchers emit an event for every delivery attempt, and the relay core
//! emits one [`CompletionRecord`] per accepted event once every fan-out
//! branch has resolved.
//!
//! ```text
//! ┌─────────────┐  AttemptStarted/Succeeded/Failed  ┌──────────────────┐
//! │ Dispatcher  │ ─────────────────────────────────▶│                  │
//! └─────────────┘                                   │ MulticastHandler │──▶ subscribers
//! ┌─────────────┐  Completed(CompletionRecord)      │                  │
//! │ RelayCore   │ ─────────────────────────────────▶│                  │
//! └─────────────┘                                   └──────────────────┘
//! ```
//!
//! Handlers must not block delivery. Failures inside a handler are the
//! handler's problem and are never propagated back to the relay.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::{DestinationKey, EventId};

/// Events emitted by the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// A transport call is about to be made.
    AttemptStarted(AttemptStartedEvent),

    /// A transport call succeeded.
    AttemptSucceeded(AttemptSucceededEvent),

    /// A transport call failed.
    AttemptFailed(AttemptFailedEvent),

    /// Every fan-out branch of an event resolved, or the completion timeout
    /// elapsed.
    Completed(CompletionRecord),
}

/// Emitted right before a transport call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStartedEvent {
    /// Unique ID of this attempt.
    pub delivery_id: Uuid,
    /// Event being delivered.
    pub event_id: EventId,
    /// Destination being contacted.
    pub destination: DestinationKey,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// When the attempt started.
    pub started_at: DateTime<Utc>,
}

/// Emitted after a successful transport call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSucceededEvent {
    /// Unique ID of this attempt.
    pub delivery_id: Uuid,
    /// Event that was delivered.
    pub event_id: EventId,
    /// Destination that accepted the event.
    pub destination: DestinationKey,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// HTTP status, when the transport is HTTP based.
    pub response_status: Option<u16>,
    /// Transport call duration in milliseconds.
    pub duration_ms: u64,
    /// When the delivery completed.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted after a failed transport call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptFailedEvent {
    /// Unique ID of this attempt.
    pub delivery_id: Uuid,
    /// Event that failed to deliver.
    pub event_id: EventId,
    /// Destination that was contacted.
    pub destination: DestinationKey,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Human readable failure.
    pub error_message: String,
    /// Coarse failure category, e.g. `network` or `client_error`.
    pub error_category: String,
    /// Whether the failure is transient.
    pub is_retryable: bool,
    /// Whether the dispatcher will try again.
    pub will_retry: bool,
    /// When the failure was observed.
    pub failed_at: DateTime<Utc>,
}

/// Final state of one fan-out branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    /// The destination accepted the event.
    Delivered,
    /// Permanent failure or retries exhausted.
    Failed,
    /// The destination's circuit was open when the attempt came up.
    CircuitOpen,
    /// The event was cancelled before delivery.
    Cancelled,
    /// The completion timeout elapsed first.
    TimedOut,
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Per-destination detail inside a completion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationOutcome {
    /// Destination this branch targeted.
    pub destination: DestinationKey,
    /// How the branch ended.
    pub status: DestinationStatus,
    /// Transport calls made for this branch.
    pub attempts: u32,
    /// Last error, if the branch did not deliver.
    pub last_error: Option<String>,
    /// When the branch resolved.
    pub finished_at: DateTime<Utc>,
}

impl DestinationOutcome {
    /// Creates an outcome with no error attached.
    pub fn new(
        destination: DestinationKey,
        status: DestinationStatus,
        attempts: u32,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self { destination, status, attempts, last_error: None, finished_at }
    }

    /// Attaches the last error seen on this branch.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }
}

/// Aggregate status of an event across all of its destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// Every destination accepted the event.
    Delivered,
    /// At least one destination accepted the event, at least one did not.
    PartiallyDelivered,
    /// No destination accepted the event.
    Failed,
    /// Every branch was cancelled.
    Cancelled,
}

impl CompletionStatus {
    /// Folds per-destination outcomes into an aggregate status.
    ///
    /// An empty outcome list counts as `Failed`.
    pub fn aggregate(outcomes: &[DestinationOutcome]) -> Self {
        if outcomes.is_empty() {
            return Self::Failed;
        }

        let delivered =
            outcomes.iter().filter(|o| o.status == DestinationStatus::Delivered).count();

        if delivered == outcomes.len() {
            Self::Delivered
        } else if delivered > 0 {
            Self::PartiallyDelivered
        } else if outcomes.iter().all(|o| o.status == DestinationStatus::Cancelled) {
            Self::Cancelled
        } else {
            Self::Failed
        }
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::PartiallyDelivered => write!(f, "partially_delivered"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured record emitted once per accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Event the record describes.
    pub event_id: EventId,
    /// Producer of the event.
    pub source: String,
    /// Producer-supplied idempotency key.
    pub idempotency_key: String,
    /// Aggregate status.
    pub status: CompletionStatus,
    /// One entry per resolved destination, in resolution order.
    pub outcomes: Vec<DestinationOutcome>,
    /// When the relay accepted the event.
    pub accepted_at: DateTime<Utc>,
    /// When the record was produced.
    pub completed_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Number of destinations that accepted the event.
    pub fn delivered_count(&self) -> usize {
        self.count(DestinationStatus::Delivered)
    }

    /// Number of branches that ended with the given status.
    pub fn count(&self, status: DestinationStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Looks up the outcome for one destination.
    pub fn outcome(&self, destination: &str) -> Option<&DestinationOutcome> {
        self.outcomes.iter().find(|o| o.destination.as_str() == destination)
    }
}

/// Consumer of relay events.
///
/// Implementations must return promptly. Slow work should be handed off to a
/// task of the handler's own.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles one relay event.
    async fn handle_event(&self, event: RelayEvent);
}

/// Handler that discards every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: RelayEvent) {}
}

/// Forwards every event to all registered subscribers concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a multicast handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Adds a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: RelayEvent) {
        let futures = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move {
                handler.handle_event(event).await;
            }
        });

        futures::future::join_all(futures).await;
    }
}

/// Writes every event to the `tracing` subscriber.
///
/// Completion records log at `info` when fully delivered, `warn` when
/// partially delivered or cancelled, and `error` when failed.
#[derive(Debug, Default)]
pub struct TracingEventHandler;

impl TracingEventHandler {
    /// Creates a tracing handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for TracingEventHandler {
    async fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::AttemptStarted(e) => {
                debug!(
                    event_id = %e.event_id,
                    destination = %e.destination,
                    attempt = e.attempt_number,
                    delivery_id = %e.delivery_id,
                    "delivery attempt started"
                );
            },
            RelayEvent::AttemptSucceeded(e) => {
                info!(
                    event_id = %e.event_id,
                    destination = %e.destination,
                    attempt = e.attempt_number,
                    status = ?e.response_status,
                    duration_ms = e.duration_ms,
                    "delivery attempt succeeded"
                );
            },
            RelayEvent::AttemptFailed(e) if e.is_retryable => {
                warn!(
                    event_id = %e.event_id,
                    destination = %e.destination,
                    attempt = e.attempt_number,
                    category = %e.error_category,
                    will_retry = e.will_retry,
                    error = %e.error_message,
                    "delivery attempt failed"
                );
            },
            RelayEvent::AttemptFailed(e) => {
                error!(
                    event_id = %e.event_id,
                    destination = %e.destination,
                    attempt = e.attempt_number,
                    category = %e.error_category,
                    error = %e.error_message,
                    "delivery attempt failed permanently"
                );
            },
            RelayEvent::Completed(record) => {
                let delivered = record.delivered_count();
                let total = record.outcomes.len();
                match record.status {
                    CompletionStatus::Delivered => info!(
                        event_id = %record.event_id,
                        source = %record.source,
                        delivered,
                        total,
                        "event completed"
                    ),
                    CompletionStatus::PartiallyDelivered | CompletionStatus::Cancelled => warn!(
                        event_id = %record.event_id,
                        source = %record.source,
                        status = %record.status,
                        delivered,
                        total,
                        "event completed"
                    ),
                    CompletionStatus::Failed => error!(
                        event_id = %record.event_id,
                        source = %record.source,
                        delivered,
                        total,
                        "event failed on every destination"
                    ),
                }
            },
        }
    }
}
