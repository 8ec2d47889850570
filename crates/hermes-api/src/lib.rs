//! HTTP ingress for the hermes relay.
//!
//! Wraps a [`RelayCore`] in an axum router: producers `POST` events to
//! `/events` (or GitHub webhooks to `/github`), and orchestrators probe
//! `/health` and `/live`. Configuration loading for the daemon lives here
//! too, since the router is its only consumer.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{sync::Arc, time::Duration};

use hermes_core::{Clock, RealClock};
use hermes_delivery::RelayCore;

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use error::ApiError;
pub use server::{create_router, serve, shutdown_signal, start_server};

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The relay events are submitted to.
    pub relay: Arc<RelayCore>,
    /// Secret inbound signatures are checked against, if any.
    pub inbound_secret: Option<Arc<str>>,
    /// Largest accepted request body in bytes.
    pub max_payload_bytes: usize,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Clock for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates state with default limits and no inbound secret.
    pub fn new(relay: Arc<RelayCore>) -> Self {
        let defaults = config::ServerSettings::default();
        Self {
            relay,
            inbound_secret: None,
            max_payload_bytes: defaults.max_payload_bytes,
            request_timeout: Duration::from_secs(defaults.request_timeout_secs),
            clock: Arc::new(RealClock::new()),
        }
    }

    /// Creates state from loaded configuration.
    pub fn from_config(relay: Arc<RelayCore>, config: &Config) -> Self {
        Self {
            inbound_secret: config.server.inbound_secret.as_deref().map(Arc::from),
            max_payload_bytes: config.server.max_payload_bytes,
            request_timeout: config.request_timeout(),
            ..Self::new(relay)
        }
    }

    /// Requires inbound requests to be signed with `secret`.
    #[must_use]
    pub fn with_inbound_secret(mut self, secret: impl Into<Arc<str>>) -> Self {
        self.inbound_secret = Some(secret.into());
        self
    }

    /// Sets the request body limit.
    #[must_use]
    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    /// Replaces the clock used for timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
