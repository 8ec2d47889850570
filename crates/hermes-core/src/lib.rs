//! Core domain types for the hermes relay.
//!
//! Provides the event and destination models, the injectable clock, the
//! observability event sink and payload signing shared by the delivery
//! engine and the HTTP ingress.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod signature;
pub mod time;

pub use error::ValidationError;
pub use events::{
    AttemptFailedEvent, AttemptStartedEvent, AttemptSucceededEvent, CompletionRecord,
    CompletionStatus, DestinationOutcome, DestinationStatus, EventHandler, MulticastEventHandler,
    NoOpEventHandler, RelayEvent, TracingEventHandler,
};
pub use models::{
    Destination, DestinationKey, Event, EventBuilder, EventId, IdempotencyKey, TransportKind,
};
pub use time::{Clock, RealClock, TestClock};
