// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the Stagehand orchestrator.
//!
//! This module provides strongly-typed errors for each part of the system,
//! using `thiserror` for ergonomic error definitions and `anyhow` for
//! application-level propagation.

use thiserror::Error;

/// Errors from the session host boundary (tmux or a fake).
#[derive(Error, Debug)]
pub enum HostError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("host command failed: {0}")]
    CommandFailed(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionExists(String),
}

/// Errors from trigger resolution and cron handling.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },

    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("invalid event pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

/// Errors from the execution gateway.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("spawn failed for agent {agent}: {message}")]
    SpawnFailed { agent: String, message: String },

    #[error("no running instance of agent: {0}")]
    NotRunning(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("failed to record run history: {0}")]
    History(String),

    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),
}

/// Errors from pipeline management.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("stage sequence must not be empty")]
    InvalidSequence,

    #[error("pipeline not found: {0}")]
    NotFound(String),

    #[error("no stage owns run: {0}")]
    UnknownRun(String),

    #[error("verdict could not be parsed: {0}")]
    VerdictParse(String),

    #[error("merge conflict in pipeline {0}")]
    MergeConflict(String),

    #[error("stage {stage} exceeded {max_retries} retries")]
    MaxRetriesExceeded { stage: String, max_retries: u32 },

    #[error("pipeline {id} is {status}, operation requires {required}")]
    WrongState {
        id: String,
        status: String,
        required: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}

/// Errors from point-to-point and broadcast messaging.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("invalid target name: {0}")]
    InvalidTarget(String),

    #[error("no active session for target: {0}")]
    SessionNotFound(String),

    #[error("session {session} not ready after {waited_ms}ms")]
    ReadyTimeout { session: String, waited_ms: u64 },

    #[error("delivery to {session} unconfirmed after {attempts} attempts")]
    DeliveryTimeout { session: String, attempts: u32 },

    #[error("host error: {0}")]
    Host(#[from] HostError),
}

impl MessagingError {
    /// Whether this error was rejected synchronously, before any injection.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidTarget(_))
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
