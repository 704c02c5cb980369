// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process publish/subscribe event bus.
//!
//! The bus is an explicitly constructed service instance, passed to the
//! scheduler and to publishers; there is no global singleton. Events are
//! ephemeral: a subscriber that is not listening at broadcast time misses
//! them, and a subscriber that falls behind the channel capacity loses the
//! oldest events rather than stalling publishers.

pub mod debounce;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

pub use debounce::{DebounceKey, DebouncedFire, Debouncer};

/// Default bounded buffer per subscriber.
const DEFAULT_CAPACITY: usize = 256;

/// A system-wide event broadcast on the bus. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    /// Dotted event type, e.g. `file.changed` or `pipeline.stage_done`.
    pub event_type: String,
    /// Arbitrary JSON payload; path-like payloads use a `path` field.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Component that emitted the event.
    pub source: String,
}

impl SystemEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
            source: source.into(),
        }
    }

    /// Textual form of the payload used for pattern matching.
    ///
    /// Prefers a `path` field, then a bare string payload, then the
    /// serialized JSON.
    pub fn payload_text(&self) -> String {
        if let Some(path) = self.payload.get("path").and_then(|v| v.as_str()) {
            return path.to_string();
        }
        if let Some(s) = self.payload.as_str() {
            return s.to_string();
        }
        self.payload.to_string()
    }
}

/// Broadcaster for [`SystemEvent`]s with per-subscriber bounded buffers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a specific per-subscriber buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget broadcast to all current subscribers.
    ///
    /// Never blocks on slow subscribers; with no subscribers the event is
    /// simply dropped.
    pub fn emit(&self, event: SystemEvent) {
        trace!(event_type = %event.event_type, source = %event.source, "emit");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazy sequence of events; dropping the stream stops delivery.
pub struct EventStream {
    rx: broadcast::Receiver<SystemEvent>,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone.
    ///
    /// A lagged subscriber skips the overwritten events and continues with
    /// the oldest one still buffered.
    pub async fn next(&mut self) -> Option<SystemEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged, dropping oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
