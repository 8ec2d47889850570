//! Delivery engine for the hermes relay.
//!
//! Accepts events, resolves them to destinations and delivers each one with
//! per-destination ordering, bounded retries and circuit breaking.
//!
//! # Architecture
//!
//! Every destination owns a dispatcher: a single worker task fed by a bounded
//! queue. The relay fans an accepted event out to the dispatchers of all its
//! destinations and collects their outcomes into one completion record:
//!
//! 1. **Validate** - reject malformed events before touching any queue
//! 2. **Deduplicate** - idempotency keys inside the window return the
//!    original event ID
//! 3. **Resolve** - the routing table maps source and attributes to
//!    destinations
//! 4. **Reserve** - a slot is reserved on every queue, or none is
//! 5. **Dispatch** - each worker retries its head event until it is
//!    delivered, fails permanently or is cancelled
//! 6. **Complete** - outcomes are aggregated and reported
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hermes_core::{Destination, Event, TransportKind};
//! use hermes_delivery::{
//!     ClientConfig, DeliveryClient, GitConfig, RelayConfig, RelayCore, Route, RoutingConfig,
//!     RoutingTable,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let routing = RoutingTable::build(RoutingConfig {
//!     destinations: vec![Destination::new(
//!         "ci",
//!         TransportKind::Https,
//!         "https://ci.example.com/hooks",
//!     )],
//!     routes: vec![Route::for_source("github").to("ci")],
//! })?;
//! let client = DeliveryClient::new(ClientConfig::default(), GitConfig::default())?;
//! let relay = RelayCore::new(RelayConfig::default(), Arc::new(routing), Arc::new(client));
//!
//! relay.submit(Event::builder("github", "delivery-1", r#"{"ref":"main"}"#).build()).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod git;
pub mod idempotency;
pub mod relay;
pub mod resolver;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState, CircuitStatus};
pub use client::{
    ClientConfig, DeliveryClient, DeliveryReceipt, DeliveryRequest, HttpsTransport, Transport,
};
pub use dispatcher::{Dispatcher, DispatcherContext, DispatcherSnapshot, QueuedAttempt};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use git::{GitConfig, GitSshTransport};
pub use idempotency::{IdempotencyConfig, IdempotencyWindow};
pub use relay::{RelayConfig, RelayCore, RelayStats, Rejection, Submission};
pub use resolver::{NoRoute, Route, RoutingConfig, RoutingError, RoutingTable};
pub use retry::{BackoffStrategy, GiveUpReason, RetryDecision, RetryPolicy};
