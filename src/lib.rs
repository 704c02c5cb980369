// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Stagehand - pipeline orchestrator for autonomous coding agents.
//!
//! Stagehand drives coding-agent processes hosted in terminal-multiplexer
//! sessions through a verdict-based multi-stage pipeline, triggering them
//! from schedules, user commands, system events, and pipeline
//! progression.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Shared definitions (agents, policies, run records)
//! - [`error`] - Error types and result aliases
//! - [`bus`] - In-process pub/sub event bus with per-trigger debouncing
//! - [`host`] - Session host abstraction (tmux-backed in production)
//! - [`trigger`] - Trigger configuration, resolution, and cron helpers
//! - [`executor`] - The single execution gateway with concurrency policy
//! - [`pipeline`] - Verdict-driven pipeline state machine and persistence
//! - [`messaging`] - Inter-session messaging with delivery confirmation
//! - [`service`] - The assembled orchestrator facade
//! - [`telemetry`] - Tracing initialization
//!
//! # Data flow
//!
//! ```text
//! clock tick ─┐
//! command ────┤                       ┌──> Session Host (tmux)
//! bus event ──┼─> Trigger Resolver ───> Executor ──> run records
//! stage ready ┘        │                  │
//!                  debounce          completions
//!                                         │
//!                                  Pipeline Manager ──> stage ready ──┐
//!                                         ^                          │
//!                                         └──────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stagehand::host::TmuxHost;
//! use stagehand::service::{Orchestrator, OrchestratorConfig};
//! use stagehand::types::AgentDefinition;
//!
//! let orchestrator = Orchestrator::new(
//!     Arc::new(TmuxHost::new()),
//!     OrchestratorConfig::default(),
//! );
//! orchestrator.register_agent(AgentDefinition::new("implementer")).await;
//! orchestrator.start().await?;
//! ```

pub mod bus;
pub mod error;
pub mod executor;
pub mod host;
pub mod messaging;
pub mod pipeline;
pub mod service;
pub mod telemetry;
pub mod trigger;
pub mod types;

// Re-export commonly used types at crate root
pub use bus::{EventBus, SystemEvent};
pub use error::{
    ExecutorError, HostError, MessagingError, PipelineError, Result, TriggerError,
};
pub use executor::{ExecutionRequest, Executor, RunHistory, RunRegistry};
pub use host::{SessionHost, TmuxHost};
pub use messaging::{BroadcastResult, Communicator, MessageDelivery};
pub use pipeline::{
    AnalyzerVerdict, Pipeline, PipelineManager, PipelineStatus, StageSpec, StageStatus,
};
pub use service::{Orchestrator, OrchestratorConfig};
pub use trigger::{DispatchAction, Signal, TriggerConfig, TriggerResolver};
pub use types::{
    AgentDefinition, CatchUpPolicy, ConcurrencyPolicy, RetryPolicy, RunRecord, StageType,
    TeamRoster,
};

/// Stagehand version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_public_exports() {
        // Verify key types are accessible
        let _agent = AgentDefinition::new("smoke");
        let _bus = EventBus::new();
    }
}
