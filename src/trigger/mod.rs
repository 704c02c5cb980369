// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Trigger resolution.
//!
//! Every trigger source (clock ticks, user commands, system events,
//! pipeline stage readiness) is matched here against the agents'
//! normalized trigger sets, and each match is turned into a dispatch
//! decision using the agent's concurrency policy and the live run
//! registry. The executor remains the single gateway that acts on those
//! decisions.

pub mod cron;
pub mod types;

use tracing::warn;

use crate::bus::SystemEvent;
use crate::executor::RunRegistry;
use crate::types::{AgentDefinition, AgentMap};

pub use types::{
    DispatchAction, DispatchDecision, EventTrigger, Signal, TriggerConfig, TriggerSet,
};

/// Merge the deprecated single-trigger fields with the multi-trigger list.
///
/// New-style entries win: a legacy field is only honored when the list has
/// no entry of the same kind.
pub fn resolve_triggers(agent: &AgentDefinition) -> TriggerSet {
    let mut entries = agent.triggers.clone();

    if let Some(cron_expr) = &agent.schedule {
        let has_schedule = entries
            .iter()
            .any(|t| matches!(t, TriggerConfig::Schedule { .. }));
        if !has_schedule {
            entries.push(TriggerConfig::Schedule {
                cron: cron_expr.clone(),
                timezone: None,
            });
        }
    }

    if let Some(command_id) = &agent.on_command {
        let has_command = entries
            .iter()
            .any(|t| matches!(t, TriggerConfig::Command { .. }));
        if !has_command {
            entries.push(TriggerConfig::Command {
                command_id: command_id.clone(),
                label: command_id.clone(),
            });
        }
    }

    TriggerSet::new(entries)
}

/// Whether an event trigger matches a concrete event.
pub fn event_trigger_matches(trigger: &EventTrigger, event: &SystemEvent) -> bool {
    if trigger.event_type != event.event_type {
        return false;
    }
    match &trigger.pattern {
        None => true,
        Some(pattern) => match globset::Glob::new(pattern) {
            Ok(glob) => glob.compile_matcher().is_match(event.payload_text()),
            Err(err) => {
                warn!(pattern = %pattern, %err, "ignoring unparseable event pattern");
                false
            }
        },
    }
}

/// Answers "should this agent run now" for every incoming signal.
#[derive(Clone)]
pub struct TriggerResolver {
    agents: AgentMap,
    registry: std::sync::Arc<RunRegistry>,
}

impl TriggerResolver {
    pub fn new(agents: AgentMap, registry: std::sync::Arc<RunRegistry>) -> Self {
        Self { agents, registry }
    }

    /// One decision per agent whose resolved triggers match the signal.
    pub async fn on_signal(&self, signal: &Signal) -> Vec<DispatchDecision> {
        let agents = self.agents.read().await;
        let mut decisions = Vec::new();

        for agent in agents.values() {
            let set = resolve_triggers(agent);
            if !Self::signal_matches(&set, signal) {
                continue;
            }
            let action = self.registry.decide(&agent.name, &agent.concurrency).await;
            decisions.push(DispatchDecision {
                agent: agent.name.clone(),
                action,
                origin: signal.origin(),
            });
        }

        decisions
    }

    /// Agents subscribed to this event, with the matching trigger.
    ///
    /// The caller routes the result through the debouncer; triggers with a
    /// zero window dispatch immediately.
    pub async fn matching_event_triggers(
        &self,
        event: &SystemEvent,
    ) -> Vec<(String, EventTrigger)> {
        let agents = self.agents.read().await;
        let mut matches = Vec::new();
        for agent in agents.values() {
            for trigger in resolve_triggers(agent).events() {
                if event_trigger_matches(trigger, event) {
                    matches.push((agent.name.clone(), trigger.clone()));
                }
            }
        }
        matches
    }

    fn signal_matches(set: &TriggerSet, signal: &Signal) -> bool {
        match signal {
            Signal::Tick(at) => set.schedules().any(|(expr, tz)| {
                match cron::matches(expr, tz, *at) {
                    Ok(hit) => hit,
                    Err(err) => {
                        warn!(expr, %err, "skipping unparseable schedule trigger");
                        false
                    }
                }
            }),
            Signal::Command { command_id } => set.has_command(command_id),
            Signal::Event(event) => set
                .events()
                .any(|trigger| event_trigger_matches(trigger, event)),
            Signal::StageReady {
                pipeline_name,
                stage_type,
                order,
            } => set.iter().any(|t| {
                matches!(t, TriggerConfig::PipelineStage {
                    pipeline_name: p,
                    stage_type: s,
                    order: o,
                } if p == pipeline_name && s == stage_type && o == order)
            }),
        }
    }
}
