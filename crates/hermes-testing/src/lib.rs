//! Test infrastructure for deterministic relay testing.
//!
//! Provides a scripted transport, a recording event handler and fixture
//! builders that assemble a complete relay on a [`TestClock`], so backoff and
//! circuit cooldowns never wait in real time.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod events;
pub mod fixtures;
pub mod transport;

pub use events::{RecordingEventHandler, DEFAULT_EVENT_TIMEOUT};
pub use fixtures::{
    https_destination, test_event, test_relay_config, RelayHarness, RelayHarnessBuilder, TEST_SOURCE,
};
pub use hermes_core::TestClock;
pub use transport::{RecordedAttempt, Reply, ScriptedTransport};
