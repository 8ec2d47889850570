//! Event capture for deterministic async assertions.
//!
//! [`RecordingEventHandler`] keeps every relay event it receives and lets a
//! test wait for completion records instead of sleeping. All waits use
//! [`DEFAULT_EVENT_TIMEOUT`] so a stuck relay fails the test instead of
//! hanging CI.

use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use hermes_core::{
    AttemptFailedEvent, AttemptStartedEvent, CompletionRecord, EventHandler, EventId, RelayEvent,
};
use tokio::sync::Notify;

/// Default timeout for waits in tests.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// [`EventHandler`] that records every event.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<RelayEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded event, in arrival order.
    pub fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Recorded completion records.
    pub fn completions(&self) -> Vec<CompletionRecord> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RelayEvent::Completed(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    /// Recorded attempt-started events.
    pub fn started(&self) -> Vec<AttemptStartedEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RelayEvent::AttemptStarted(started) => Some(started),
                _ => None,
            })
            .collect()
    }

    /// Recorded attempt-failed events.
    pub fn failures(&self) -> Vec<AttemptFailedEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RelayEvent::AttemptFailed(failed) => Some(failed),
                _ => None,
            })
            .collect()
    }

    /// Completion record for `event_id`, if one arrived.
    pub fn completion(&self, event_id: EventId) -> Option<CompletionRecord> {
        self.completions().into_iter().find(|record| record.event_id == event_id)
    }

    /// Waits for the completion record of `event_id`.
    ///
    /// # Panics
    ///
    /// Panics if no record arrives within [`DEFAULT_EVENT_TIMEOUT`].
    pub async fn wait_for_completion(&self, event_id: EventId) -> CompletionRecord {
        let found = self.wait_until(|recorder| recorder.completion(event_id)).await;
        match found {
            Some(record) => record,
            None => {
                panic!("no completion record for event {event_id} within {DEFAULT_EVENT_TIMEOUT:?}")
            },
        }
    }

    /// Waits until at least `count` completion records arrived.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within [`DEFAULT_EVENT_TIMEOUT`].
    pub async fn wait_for_completions(&self, count: usize) -> Vec<CompletionRecord> {
        let found = self
            .wait_until(|recorder| {
                let completions = recorder.completions();
                (completions.len() >= count).then_some(completions)
            })
            .await;

        match found {
            Some(records) => records,
            None => panic!(
                "completion records did not arrive in time. Expected: {count}, Actual: {}",
                self.completions().len()
            ),
        }
    }

    async fn wait_until<T>(&self, check: impl Fn(&Self) -> Option<T>) -> Option<T> {
        tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if let Some(found) = check(self) {
                    return found;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: RelayEvent) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
        self.notify.notify_waiters();
    }
}
