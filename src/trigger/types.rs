// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trigger configuration types.
//!
//! All trigger kinds live in one tagged union, [`TriggerConfig`]. Agents
//! written against the deprecated single-field configuration (a bare cron
//! string, a bare command id) are normalized into this union once, at
//! resolution time; nothing downstream ever sees the legacy fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::SystemEvent;
use crate::types::{SignalOrigin, StageType};

/// An event subscription attached to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTrigger {
    /// Event type to match exactly.
    pub event_type: String,
    /// Optional glob matched against the event payload (e.g. a path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Minimum silence window before the agent fires. Zero fires
    /// immediately.
    #[serde(default)]
    pub debounce_ms: u64,
}

/// One way an agent can be triggered. An agent may hold any non-empty
/// combination of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Cron schedule, optionally pinned to a timezone.
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Explicit user command (a dashboard button, a CLI invocation).
    Command { command_id: String, label: String },
    /// System event subscription.
    Event(EventTrigger),
    /// Fires when a named pipeline reaches a stage at a given position.
    PipelineStage {
        pipeline_name: String,
        stage_type: StageType,
        order: u32,
    },
}

impl TriggerConfig {
    /// The origin tag recorded on runs this trigger causes.
    pub fn origin(&self) -> SignalOrigin {
        match self {
            Self::Schedule { .. } => SignalOrigin::Schedule,
            Self::Command { .. } => SignalOrigin::Command,
            Self::Event(_) => SignalOrigin::Event,
            Self::PipelineStage { .. } => SignalOrigin::PipelineStage,
        }
    }
}

/// Normalized, deduplicated trigger set for one agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerSet {
    entries: Vec<TriggerConfig>,
}

impl TriggerSet {
    pub fn new(entries: Vec<TriggerConfig>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TriggerConfig> {
        self.entries.iter()
    }

    /// All schedule triggers as `(cron, timezone)` pairs.
    pub fn schedules(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().filter_map(|t| match t {
            TriggerConfig::Schedule { cron, timezone } => {
                Some((cron.as_str(), timezone.as_deref()))
            }
            _ => None,
        })
    }

    pub fn events(&self) -> impl Iterator<Item = &EventTrigger> {
        self.entries.iter().filter_map(|t| match t {
            TriggerConfig::Event(trigger) => Some(trigger),
            _ => None,
        })
    }

    pub fn has_command(&self, id: &str) -> bool {
        self.entries.iter().any(
            |t| matches!(t, TriggerConfig::Command { command_id, .. } if command_id == id),
        )
    }
}

/// An input signal the resolver matches against agent triggers.
#[derive(Debug, Clone)]
pub enum Signal {
    /// A scheduler clock tick, truncated to the minute by the caller.
    Tick(DateTime<Utc>),
    /// A user command invocation.
    Command { command_id: String },
    /// A system event received from the bus.
    Event(SystemEvent),
    /// A pipeline stage became ready for dispatch.
    StageReady {
        pipeline_name: String,
        stage_type: StageType,
        order: u32,
    },
}

impl Signal {
    pub fn origin(&self) -> SignalOrigin {
        match self {
            Self::Tick(_) => SignalOrigin::Schedule,
            Self::Command { .. } => SignalOrigin::Command,
            Self::Event(_) => SignalOrigin::Event,
            Self::StageReady { .. } => SignalOrigin::PipelineStage,
        }
    }
}

/// What the gateway should do with a matched agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    /// Spawn a run now.
    Execute,
    /// Stash exactly one invocation until the active run finishes.
    Queue,
    /// Drop the signal.
    Skip,
}

/// Per-agent outcome of [`on_signal`](super::TriggerResolver::on_signal).
#[derive(Debug, Clone)]
pub struct DispatchDecision {
    pub agent: String,
    pub action: DispatchAction,
    pub origin: SignalOrigin,
}
