//! Scripted transport for driving dispatchers without a network.
//!
//! Each destination has a queue of [`Reply`] values consumed one per attempt,
//! plus an optional fallback used once the queue is empty. With neither, the
//! attempt succeeds. Every call is recorded before its reply runs.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use hermes_core::{Destination, DestinationKey, EventId};
use hermes_delivery::{DeliveryError, DeliveryReceipt, DeliveryRequest, Transport};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::events::DEFAULT_EVENT_TIMEOUT;

/// Scripted result of one attempt.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Succeed with HTTP 200.
    Succeed,
    /// Succeed with a specific status code.
    SucceedWith(u16),
    /// Fail with the given error.
    Fail(DeliveryError),
    /// Sleep in real time, then succeed. Useful for attempt timeouts.
    Stall(Duration),
    /// Wait until the notify is signalled, then succeed.
    Hold(Arc<Notify>),
    /// Panic inside the transport call.
    Panic,
}

impl Reply {
    /// Transient HTTP 503 failure.
    pub fn unavailable() -> Self {
        Self::Fail(DeliveryError::server_error(503, "service unavailable"))
    }

    /// Permanent HTTP 400 failure.
    pub fn bad_request() -> Self {
        Self::Fail(DeliveryError::client_error(400, "bad request"))
    }
}

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedAttempt {
    /// Destination the attempt targeted.
    pub destination: DestinationKey,
    /// Event being delivered.
    pub event_id: EventId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// ID of this attempt.
    pub delivery_id: Uuid,
    /// Payload sent.
    pub payload: Bytes,
}

/// [`Transport`] that replays scripted replies and records every call.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<DestinationKey, VecDeque<Reply>>>,
    fallbacks: Mutex<HashMap<DestinationKey, Reply>>,
    attempts: Mutex<Vec<RecordedAttempt>>,
    notify: Notify,
}

impl ScriptedTransport {
    /// Creates a transport that succeeds on every destination.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends replies for the next attempts against `destination`.
    pub fn script(
        &self,
        destination: impl Into<DestinationKey>,
        replies: impl IntoIterator<Item = Reply>,
    ) {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        scripts.entry(destination.into()).or_default().extend(replies);
    }

    /// Sets the reply used once `destination`'s script is exhausted.
    pub fn always(&self, destination: impl Into<DestinationKey>, reply: Reply) {
        let mut fallbacks = self.fallbacks.lock().unwrap_or_else(PoisonError::into_inner);
        fallbacks.insert(destination.into(), reply);
    }

    /// Every recorded call, in call order.
    pub fn attempts(&self) -> Vec<RecordedAttempt> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Recorded calls against one destination, in call order.
    pub fn attempts_for(&self, destination: &str) -> Vec<RecordedAttempt> {
        self.attempts().into_iter().filter(|a| a.destination.as_str() == destination).collect()
    }

    /// Number of recorded calls.
    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Waits until at least `count` calls were recorded.
    ///
    /// # Panics
    ///
    /// Panics after [`DEFAULT_EVENT_TIMEOUT`] to keep a stuck test from
    /// hanging the suite.
    pub async fn wait_for_attempts(&self, count: usize) {
        let result = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.attempt_count() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if result.is_err() {
            panic!(
                "transport attempts did not arrive in time. Expected: {count}, Actual: {}",
                self.attempt_count()
            );
        }
    }

    fn next_reply(&self, destination: &DestinationKey) -> Reply {
        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(destination)
            .and_then(VecDeque::pop_front);

        scripted.unwrap_or_else(|| {
            self.fallbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(destination)
                .cloned()
                .unwrap_or(Reply::Succeed)
        })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: &DeliveryRequest,
        destination: &Destination,
    ) -> hermes_delivery::Result<DeliveryReceipt> {
        let reply = self.next_reply(&destination.key);

        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).push(RecordedAttempt {
            destination: destination.key.clone(),
            event_id: request.event.id(),
            attempt_number: request.attempt_number,
            delivery_id: request.delivery_id,
            payload: request.event.payload().clone(),
        });
        self.notify.notify_waiters();

        let ok = |status: u16| -> hermes_delivery::Result<DeliveryReceipt> {
            Ok(DeliveryReceipt { status_code: Some(status), duration: Duration::ZERO })
        };

        match reply {
            Reply::Succeed => ok(200),
            Reply::SucceedWith(status) => ok(status),
            Reply::Fail(error) => Err(error),
            Reply::Stall(duration) => {
                tokio::time::sleep(duration).await;
                ok(200)
            },
            Reply::Hold(release) => {
                release.notified().await;
                ok(200)
            },
            Reply::Panic => panic!("scripted transport panic for {}", destination.key),
        }
    }
}
