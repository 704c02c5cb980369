// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core shared types: agent definitions, execution policies, run records.
//!
//! Agent definitions are produced by configuration loading, which lives
//! outside this crate; the types here carry serde derives so collaborators
//! can deserialize them from their own files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::trigger::TriggerConfig;

// ============================================================================
// Stage Types
// ============================================================================

/// Role of a pipeline stage.
///
/// The order of stages in a pipeline is configuration, not code; a
/// three-stage and a four-stage (with `Qa`) sequence are both valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    /// Writes the change.
    Implementer,
    /// Reviews the change and produces a verdict.
    Analyzer,
    /// Optional extra review pass before merging.
    Qa,
    /// Lands the change on the base branch.
    Merger,
}

impl StageType {
    /// Stages whose agents must produce a structured verdict.
    pub fn requires_verdict(&self) -> bool {
        matches!(self, Self::Analyzer | Self::Qa)
    }

    /// Short lowercase label, used in session names and log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Implementer => "implementer",
            Self::Analyzer => "analyzer",
            Self::Qa => "qa",
            Self::Merger => "merger",
        }
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Execution Policies
// ============================================================================

/// Per-agent rule for overlapping executions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    /// Allow a second concurrent instance of the agent.
    #[serde(default)]
    pub allow_parallel: bool,
    /// Queue exactly one invocation while a run is active.
    #[serde(default)]
    pub queue_if_running: bool,
}

/// Per-stage (or per-agent) retry discipline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay before a re-dispatch, in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub exponential_backoff: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
            delay_ms: default_retry_delay_ms(),
            exponential_backoff: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            delay_ms: 0,
            exponential_backoff: false,
        }
    }

    /// Delay before dispatching the attempt that follows `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let base = self.delay_ms;
        let ms = if self.exponential_backoff {
            base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
        } else {
            base
        };
        std::time::Duration::from_millis(ms)
    }
}

/// What to do about schedule occurrences missed while the scheduler was
/// not running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchUpPolicy {
    /// Discard missed occurrences.
    #[default]
    Skip,
    /// Execute a single catch-up run.
    RunOnce,
    /// Execute one run per missed occurrence, in order.
    RunAll,
}

// ============================================================================
// Agent Definition
// ============================================================================

/// An agent as declared by configuration (loaded elsewhere).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique agent name.
    pub name: String,
    /// Model preference passed to the agent CLI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Tool guardrails passed to the agent CLI.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Base command for the agent process. Defaults to `claude`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Multi-trigger configuration.
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Deprecated single-field cron schedule, superseded by `triggers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    /// Deprecated single-field command id, superseded by `triggers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_command: Option<String>,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub catch_up: CatchUpPolicy,
}

impl AgentDefinition {
    /// Create a definition with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
            allowed_tools: Vec::new(),
            command: None,
            triggers: Vec::new(),
            schedule: None,
            on_command: None,
            concurrency: ConcurrencyPolicy::default(),
            retry: RetryPolicy::default(),
            catch_up: CatchUpPolicy::default(),
        }
    }

    /// Set the concurrency policy.
    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    /// Add a trigger.
    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Shell command line that launches this agent, optionally with a prompt.
    pub fn launch_command(&self, prompt: Option<&str>) -> String {
        let mut cmd = self
            .command
            .clone()
            .unwrap_or_else(|| "claude".to_string());
        if let Some(model) = &self.model {
            cmd.push_str(&format!(" --model {}", shell_quote(model)));
        }
        if !self.allowed_tools.is_empty() {
            cmd.push_str(&format!(
                " --allowedTools {}",
                shell_quote(&self.allowed_tools.join(","))
            ));
        }
        if let Some(prompt) = prompt {
            cmd.push_str(&format!(" -p {}", shell_quote(prompt)));
        }
        cmd
    }
}

/// Minimal single-quote shell escaping for command assembly.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Shared registry of agent definitions, updated by collaborators and read
/// by the resolver and the executor.
pub type AgentMap =
    std::sync::Arc<tokio::sync::RwLock<std::collections::HashMap<String, AgentDefinition>>>;

// ============================================================================
// Teams
// ============================================================================

/// A named roster of agents, used for team broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRoster {
    pub name: String,
    /// Agent names belonging to the team.
    pub members: Vec<String>,
}

// ============================================================================
// Run Records
// ============================================================================

/// Where an execution request originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOrigin {
    Schedule,
    Command,
    Event,
    PipelineStage,
    Manual,
    CatchUp,
    Relaunch,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Process exited on its own; see `exit_code`.
    Exited,
    /// Terminated by an explicit cancel or abort.
    Cancelled,
    /// Killed after exceeding the run timeout.
    TimedOut,
    /// The process never started or vanished without reporting.
    SpawnFailed,
}

/// Binding of a run to the pipeline stage that dispatched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineBinding {
    pub pipeline_id: Uuid,
    pub stage_type: StageType,
    pub stage_index: usize,
}

/// Outcome of one agent execution, appended to the agent's run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub agent: String,
    pub status: RunStatus,
    /// Present when `status` is `Exited`.
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Model cost reported by the agent process, 0.0 when unreported.
    #[serde(default)]
    pub cost: f64,
    pub origin: SignalOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineBinding>,
}

impl RunRecord {
    /// Whether the run finished with a zero exit code.
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Exited && self.exit_code == Some(0)
    }
}
