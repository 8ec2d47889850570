//! Injectable time source.
//!
//! Backoff waits, circuit cooldowns, elapsed-time budgets and completion
//! deadlines all read time through [`Clock`], so tests can drive the relay
//! on virtual time instead of waiting for real timers.

use std::{
    future::Future,
    pin::{pin, Pin},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// Boxed future returned by [`Clock::sleep`].
pub type Sleep<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Source of monotonic time, wall-clock time and sleeping.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// Current wall-clock time, used for record timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Waits for `duration`.
    ///
    /// Production clocks suspend on a tokio timer. Test clocks advance
    /// virtual time and return after yielding once.
    fn sleep(&self, duration: Duration) -> Sleep<'_>;

    /// Waits until `deadline` without driving time forward.
    ///
    /// Unlike [`Clock::sleep`], a test clock only resolves this once
    /// something else has advanced virtual time past the deadline.
    fn sleep_until(&self, deadline: Instant) -> Sleep<'_>;
}

/// Clock backed by the operating system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn sleep_until(&self, deadline: Instant) -> Sleep<'_> {
        Box::pin(tokio::time::sleep_until(deadline.into()))
    }
}

/// Deterministic clock for tests.
///
/// Cloned handles share the same virtual time. Every call to
/// [`Clock::sleep`] advances time by the requested duration and is recorded,
/// so tests can assert on the exact backoff schedule a dispatcher used.
#[derive(Debug, Clone)]
pub struct TestClock {
    elapsed_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
    ticks: Arc<Notify>,
}

impl TestClock {
    /// Creates a test clock anchored at the current wall-clock time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock anchored at a specific wall-clock time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            elapsed_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_utc: start,
            sleeps: Arc::new(Mutex::new(Vec::new())),
            ticks: Arc::new(Notify::new()),
        }
    }

    /// Moves virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_ns.fetch_add(ns, Ordering::AcqRel);
        self.ticks.notify_waiters();
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns.load(Ordering::Acquire))
    }

    /// Every duration passed to [`Clock::sleep`], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        match self.sleeps.lock() {
            Ok(sleeps) => sleeps.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        let elapsed =
            chrono::Duration::from_std(self.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.base_utc + elapsed
    }

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        match self.sleeps.lock() {
            Ok(mut sleeps) => sleeps.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }

    fn sleep_until(&self, deadline: Instant) -> Sleep<'_> {
        Box::pin(async move {
            loop {
                let mut notified = pin!(self.ticks.notified());
                notified.as_mut().enable();
                if self.now() >= deadline {
                    return;
                }
                notified.await;
            }
        })
    }
}
