// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-subscriber event debouncing.
//!
//! Timers are keyed by `(agent, event_type)`. Each matching event resets
//! the key's timer and replaces the pending payload; only when a timer
//! expires with no further event does a single coalesced fire reach the
//! consumer, carrying the most recent payload seen within the window.
//!
//! Timer state is purely in-memory; a process restart loses in-flight
//! debounce windows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// Structured debounce key. Agent id and event type stay separate fields;
/// string concatenation invites collisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DebounceKey {
    pub agent: String,
    pub event_type: String,
}

impl DebounceKey {
    pub fn new(agent: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            event_type: event_type.into(),
        }
    }
}

/// A coalesced execute signal produced when a debounce window closes.
#[derive(Debug, Clone)]
pub struct DebouncedFire {
    pub key: DebounceKey,
    /// Payload of the most recent event inside the window.
    pub payload: serde_json::Value,
}

struct Pending {
    generation: u64,
    payload: serde_json::Value,
}

/// Debounce timer map. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Debouncer {
    pending: Arc<Mutex<HashMap<DebounceKey, Pending>>>,
    fire_tx: mpsc::Sender<DebouncedFire>,
}

impl Debouncer {
    /// Create a debouncer and the receiver its coalesced fires arrive on.
    pub fn new() -> (Self, mpsc::Receiver<DebouncedFire>) {
        let (fire_tx, fire_rx) = mpsc::channel(64);
        (
            Self {
                pending: Arc::new(Mutex::new(HashMap::new())),
                fire_tx,
            },
            fire_rx,
        )
    }

    /// Observe a matching event for `key`, (re)starting its window.
    pub async fn observe(&self, key: DebounceKey, payload: serde_json::Value, window: Duration) {
        let generation = {
            let mut pending = self.pending.lock().await;
            let entry = pending.entry(key.clone()).or_insert(Pending {
                generation: 0,
                payload: serde_json::Value::Null,
            });
            entry.generation += 1;
            entry.payload = payload;
            entry.generation
        };

        trace!(agent = %key.agent, event_type = %key.event_type, generation, "debounce window reset");

        let pending = Arc::clone(&self.pending);
        let fire_tx = self.fire_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;

            let fire = {
                let mut map = pending.lock().await;
                match map.get(&key) {
                    // A newer event restarted the window; this timer is stale.
                    Some(entry) if entry.generation != generation => None,
                    Some(_) => map.remove(&key).map(|entry| DebouncedFire {
                        key: key.clone(),
                        payload: entry.payload,
                    }),
                    None => None,
                }
            };

            if let Some(fire) = fire {
                debug!(agent = %fire.key.agent, event_type = %fire.key.event_type, "debounce fired");
                let _ = fire_tx.send(fire).await;
            }
        });
    }

    /// Number of keys with an open window.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
