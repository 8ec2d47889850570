//! Bounded dedupe window for idempotency keys.
//!
//! Keys are scoped by source, so two producers may reuse the same key
//! without colliding. Entries expire after a TTL and the oldest entries are
//! evicted once the window is full.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use hermes_core::{EventId, IdempotencyKey};
use serde::{Deserialize, Serialize};

/// Dedupe window limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Maximum remembered keys. Zero disables deduplication.
    pub capacity: usize,
    /// How long a key is remembered.
    pub ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { capacity: 100_000, ttl: Duration::from_secs(24 * 60 * 60) }
    }
}

type ScopedKey = (String, IdempotencyKey);

/// Remembers recently accepted keys and the event each one produced.
#[derive(Debug)]
pub struct IdempotencyWindow {
    config: IdempotencyConfig,
    entries: HashMap<ScopedKey, (EventId, Instant)>,
    order: VecDeque<(ScopedKey, Instant)>,
}

impl IdempotencyWindow {
    /// Creates an empty window.
    pub fn new(config: IdempotencyConfig) -> Self {
        Self { config, entries: HashMap::new(), order: VecDeque::new() }
    }

    /// Claims `key` for `event_id`.
    ///
    /// # Errors
    ///
    /// Returns the original event ID if the key is still inside the window.
    pub fn claim(
        &mut self,
        source: &str,
        key: &IdempotencyKey,
        event_id: EventId,
        now: Instant,
    ) -> Result<(), EventId> {
        if self.config.capacity == 0 {
            return Ok(());
        }

        self.evict(now);

        let scoped = (source.to_string(), key.clone());
        if let Some((existing, _)) = self.entries.get(&scoped) {
            return Err(*existing);
        }

        self.entries.insert(scoped.clone(), (event_id, now));
        self.order.push_back((scoped, now));
        self.evict(now);
        Ok(())
    }

    /// Forgets a claim made by `event_id`, e.g. when its submission was
    /// rejected after the key was claimed.
    pub fn release(&mut self, source: &str, key: &IdempotencyKey, event_id: EventId) {
        let scoped = (source.to_string(), key.clone());
        let Some((owner, inserted)) = self.entries.get(&scoped).copied() else { return };
        if owner != event_id {
            return;
        }

        self.entries.remove(&scoped);
        // Released claims are almost always the newest, so search from the back.
        if let Some(index) =
            self.order.iter().rposition(|(k, at)| *at == inserted && *k == scoped)
        {
            self.order.remove(index);
        }
    }

    /// Number of remembered keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is remembered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((scoped, inserted)) = self.order.front() {
            let expired = now.saturating_duration_since(*inserted) >= self.config.ttl;
            let over_capacity = self.entries.len() > self.config.capacity;
            let stale = self.entries.get(scoped).map_or(true, |(_, at)| at != inserted);

            if !(expired || over_capacity || stale) {
                break;
            }

            if !stale {
                self.entries.remove(scoped);
            }
            self.order.pop_front();
        }
    }
}
