// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pipeline entities and the verdict type.
//!
//! A pipeline carries an ordered sequence of stages, an append-only event
//! log, and a lifecycle status. All mutation happens in the manager; these
//! types only hold state and answer questions about it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::types::{RetryPolicy, StageType};

// ============================================================================
// Verdicts
// ============================================================================

/// Structured outcome produced by a reviewing stage's agent.
///
/// This is the agent's sole structured output and drives the only three
/// transitions out of the stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AnalyzerVerdict {
    /// The work is acceptable; advance the pipeline.
    Complete,
    /// The implementation needs another pass.
    Revision { feedback: String },
    /// The work is unsalvageable; block the pipeline.
    Failed { reason: String },
}

impl AnalyzerVerdict {
    /// Parse a verdict document.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(raw).map_err(|e| PipelineError::VerdictParse(e.to_string()))
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Lifecycle of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Operator override; treated as success for advancement.
    Skipped,
    /// Out of retries or a terminal verdict; needs manual intervention.
    Blocked,
}

/// Configuration for one stage in a pipeline sequence.
///
/// Sequences are data: three stages, or four with a QA pass, are both
/// just different `Vec<StageSpec>` values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub stage_type: StageType,
    pub agent_name: String,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StageSpec {
    pub fn new(stage_type: StageType, agent_name: impl Into<String>) -> Self {
        Self {
            stage_type,
            agent_name: agent_name.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One stage of a pipeline. Mutated only by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub stage_type: StageType,
    pub status: StageStatus,
    pub agent_name: String,
    /// Run currently or last associated with this stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<AnalyzerVerdict>,
    /// Number of dispatches so far; never exceeds the retry budget.
    pub attempt: u32,
    pub retry: RetryPolicy,
}

impl PipelineStage {
    fn from_spec(spec: &StageSpec) -> Self {
        Self {
            stage_type: spec.stage_type,
            status: StageStatus::Pending,
            agent_name: spec.agent_name.clone(),
            run_id: None,
            verdict: None,
            attempt: 0,
            retry: spec.retry.clone(),
        }
    }

    /// Whether the retry budget allows another dispatch.
    pub fn can_retry(&self) -> bool {
        self.retry.enabled && self.attempt < self.retry.max_retries
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Pipeline lifecycle. `Blocked` is the only state that waits for a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    InProgress,
    Completed,
    Blocked,
    Aborted,
}

impl PipelineStatus {
    /// Terminal states never leave on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Immutable audit log entry attached to a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageType>,
}

/// One end-to-end unit of work progressing through ordered stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    /// The approved unit of work this pipeline realizes.
    pub idea_id: String,
    pub status: PipelineStatus,
    pub stages: Vec<PipelineStage>,
    pub events: Vec<PipelineEvent>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Pipeline {
    /// Build a pipeline with all stages pending.
    pub fn new(idea_id: impl Into<String>, specs: &[StageSpec]) -> Self {
        Self {
            id: Uuid::new_v4(),
            idea_id: idea_id.into(),
            status: PipelineStatus::Created,
            stages: specs.iter().map(PipelineStage::from_spec).collect(),
            events: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Append an audit event. Events are never mutated after creation.
    pub fn record_event(
        &mut self,
        event_type: impl Into<String>,
        description: impl Into<String>,
        stage: Option<StageType>,
    ) {
        self.events.push(PipelineEvent {
            timestamp: Utc::now(),
            event_type: event_type.into(),
            description: description.into(),
            stage,
        });
    }

    /// Index of the one running stage, if any.
    pub fn running_stage(&self) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.status == StageStatus::Running)
    }

    /// Number of stages currently marked running. The manager keeps this
    /// at one while in progress, zero otherwise.
    pub fn running_count(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Running)
            .count()
    }

    /// Index of the stage owning a run id.
    pub fn stage_by_run(&self, run_id: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.run_id.as_deref() == Some(run_id))
    }

    /// Index of the first implementer stage before `idx`, for revision
    /// loops.
    pub fn implementer_before(&self, idx: usize) -> Option<usize> {
        self.stages[..idx]
            .iter()
            .rposition(|s| s.stage_type == StageType::Implementer)
    }
}
