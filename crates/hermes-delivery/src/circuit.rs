//! Per-destination circuit breaker.
//!
//! The breaker is an explicit tagged state with a pure transition function.
//! Each dispatcher owns exactly one [`CircuitBreaker`] and is the only code
//! that mutates it. Observers see a [`CircuitSnapshot`] copy.
//!
//! # State Machine
//!
//! ```text
//!                 success / permanent failure
//!         ┌──────────────────────────────────────────┐
//!         ▼                                          │
//! ┌───────────────┐  threshold transient   ┌─────────┴─────┐
//! │    CLOSED     │ ─────────────────────▶ │   HALF-OPEN   │
//! │ counts        │     failures           │ admits one    │
//! │ consecutive   │         │              │ probe         │
//! │ transients    │         ▼              └───────────────┘
//! └───────────────┘  ┌───────────────┐       ▲        │
//!                    │     OPEN      │ ──────┘        │ probe transient
//!                    │ fails fast    │ now >= retry_after    failure
//!                    │ until         │ ◀──────────────┘ (cooldown doubled,
//!                    │ retry_after   │                   capped)
//!                    └───────────────┘
//! ```

use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DeliveryError;

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open after first tripping.
    pub cooldown: Duration,
    /// Upper bound for the doubled cooldown after failed probes.
    pub max_cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(600),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed {
        /// Transient failures since the last success.
        consecutive_failures: u32,
    },
    /// Attempts fail fast until `retry_after`.
    Open {
        /// Earliest instant a probe may run.
        retry_after: Instant,
        /// Cooldown that produced `retry_after`.
        cooldown: Duration,
    },
    /// One probe attempt is allowed through.
    HalfOpen {
        /// Cooldown to double if the probe fails.
        cooldown: Duration,
        /// Whether the probe has been admitted.
        probe_in_flight: bool,
    },
}

/// Input to the circuit state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    /// A delivery attempt succeeded.
    Success,
    /// A delivery attempt failed transiently at the given instant.
    TransientFailure {
        /// When the failure was observed.
        at: Instant,
    },
    /// A delivery attempt failed permanently.
    PermanentFailure,
    /// Time passed; lets an open circuit move to half-open.
    Poll {
        /// Current instant.
        now: Instant,
    },
    /// The half-open probe was admitted.
    ProbeStarted,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::Closed { consecutive_failures: 0 }
    }
}

impl CircuitState {
    /// Applies one event and returns the next state.
    pub fn transition(self, event: CircuitEvent, config: &CircuitConfig) -> Self {
        match (self, event) {
            (Self::Closed { .. }, CircuitEvent::Success) => Self::default(),
            (Self::Closed { consecutive_failures }, CircuitEvent::TransientFailure { at }) => {
                let failures = consecutive_failures.saturating_add(1);
                if failures >= config.failure_threshold {
                    Self::Open { retry_after: at + config.cooldown, cooldown: config.cooldown }
                } else {
                    Self::Closed { consecutive_failures: failures }
                }
            },

            (Self::Open { retry_after, cooldown }, CircuitEvent::Poll { now })
                if now >= retry_after =>
            {
                Self::HalfOpen { cooldown, probe_in_flight: false }
            },

            (Self::HalfOpen { cooldown, .. }, CircuitEvent::ProbeStarted) => {
                Self::HalfOpen { cooldown, probe_in_flight: true }
            },
            (Self::HalfOpen { .. }, CircuitEvent::Success | CircuitEvent::PermanentFailure) => {
                Self::default()
            },
            (Self::HalfOpen { cooldown, .. }, CircuitEvent::TransientFailure { at }) => {
                let cooldown = std::cmp::min(cooldown.saturating_mul(2), config.max_cooldown);
                Self::Open { retry_after: at + cooldown, cooldown }
            },

            (state, _) => state,
        }
    }

    /// Whether an attempt may be made in this state.
    pub fn admits(&self) -> bool {
        match self {
            Self::Closed { .. } => true,
            Self::Open { .. } => false,
            Self::HalfOpen { probe_in_flight, .. } => !probe_in_flight,
        }
    }

    /// Coarse status without timing detail.
    pub fn status(&self) -> CircuitStatus {
        match self {
            Self::Closed { .. } => CircuitStatus::Closed,
            Self::Open { .. } => CircuitStatus::Open,
            Self::HalfOpen { .. } => CircuitStatus::HalfOpen,
        }
    }
}

/// Coarse circuit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open,
    /// Probing.
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time copy of a circuit for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Current status.
    pub status: CircuitStatus,
    /// Transient failures since the last success. Zero unless closed.
    pub consecutive_failures: u32,
    /// Milliseconds until an open circuit admits a probe.
    pub retry_in_ms: Option<u64>,
    /// Current cooldown in milliseconds.
    pub cooldown_ms: u64,
    /// Instant an open circuit turns half-open.
    #[serde(skip)]
    pub half_open_at: Option<Instant>,
}

impl CircuitSnapshot {
    /// Re-evaluates the timing fields of a published snapshot at `now`.
    pub fn at(mut self, now: Instant) -> Self {
        if let Some(half_open_at) = self.half_open_at {
            if now >= half_open_at {
                self.status = CircuitStatus::HalfOpen;
                self.retry_in_ms = None;
                self.half_open_at = None;
            } else {
                self.retry_in_ms = Some(millis(half_open_at - now));
            }
        }
        self
    }
}

/// Circuit breaker owned by a single dispatcher.
#[derive(Debug)]
pub struct CircuitBreaker {
    destination: String,
    config: CircuitConfig,
    state: CircuitState,
}

impl CircuitBreaker {
    /// Creates a closed breaker for a destination.
    pub fn new(destination: impl Into<String>, config: CircuitConfig) -> Self {
        Self { destination: destination.into(), config, state: CircuitState::default() }
    }

    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Decides whether an attempt may proceed at `now`.
    ///
    /// Moves an expired open circuit to half-open and claims the probe slot
    /// when half-open. Returns `false` when the attempt must fail with
    /// `CircuitOpen`.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.apply(CircuitEvent::Poll { now });

        if !self.state.admits() {
            return false;
        }

        if matches!(self.state, CircuitState::HalfOpen { .. }) {
            self.apply(CircuitEvent::ProbeStarted);
        }

        true
    }

    /// Records a successful attempt.
    pub fn record_success(&mut self) {
        self.apply(CircuitEvent::Success);
    }

    /// Records a failed attempt observed at `now`.
    pub fn record_failure(&mut self, error: &DeliveryError, now: Instant) {
        let event = if error.is_permanent() {
            CircuitEvent::PermanentFailure
        } else {
            CircuitEvent::TransientFailure { at: now }
        };
        self.apply(event);
    }

    /// Snapshot for observers.
    ///
    /// An open circuit whose cooldown has elapsed reads as half-open, even
    /// before the next attempt moves it there.
    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        let state = self.state.transition(CircuitEvent::Poll { now }, &self.config);
        let (consecutive_failures, half_open_at, cooldown) = match state {
            CircuitState::Closed { consecutive_failures } => {
                (consecutive_failures, None, self.config.cooldown)
            },
            CircuitState::Open { retry_after, cooldown } => (0, Some(retry_after), cooldown),
            CircuitState::HalfOpen { cooldown, .. } => (0, None, cooldown),
        };

        CircuitSnapshot {
            status: state.status(),
            consecutive_failures,
            retry_in_ms: half_open_at.map(|at| millis(at.saturating_duration_since(now))),
            cooldown_ms: millis(cooldown),
            half_open_at,
        }
    }

    fn apply(&mut self, event: CircuitEvent) {
        let previous = self.state;
        self.state = previous.transition(event, &self.config);

        if previous.status() == self.state.status() {
            return;
        }

        match self.state {
            CircuitState::Open { cooldown, .. } => warn!(
                destination = %self.destination,
                from = %previous.status(),
                cooldown_ms = millis(cooldown),
                "circuit opened"
            ),
            CircuitState::HalfOpen { .. } => {
                info!(destination = %self.destination, "circuit half-open, admitting probe");
            },
            CircuitState::Closed { .. } => {
                info!(destination = %self.destination, from = %previous.status(), "circuit closed");
            },
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
