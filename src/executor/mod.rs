// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution gateway.
//!
//! Every trigger source funnels agent execution through [`Executor`], so
//! one concurrency and retry discipline applies regardless of where a
//! request came from. The executor spawns agent processes through the
//! session host, streams their visible output to observers, records run
//! outcomes in the append-only history, and drains the per-agent queued
//! slot when a run finishes.
//!
//! tmux reports no exit status for the command inside a session, so the
//! launched command is wrapped to print an exit marker that the output
//! poller watches for. A session that disappears without a marker is a
//! spawn failure (or a cancellation, when the cancel flag is set).

pub mod history;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::host::SessionHost;
use crate::trigger::{cron, resolve_triggers, DispatchAction};
use crate::types::{
    AgentDefinition, AgentMap, CatchUpPolicy, ConcurrencyPolicy, PipelineBinding, RunRecord,
    RunStatus, SignalOrigin,
};

pub use history::{AgentStats, RunHistory};

/// Prefix for sessions the executor creates.
pub const SESSION_PREFIX: &str = "stagehand-";

/// Marker the command wrapper prints when the agent process exits.
const EXIT_MARKER: &str = "__STAGEHAND_EXIT__:";

/// Optional marker an agent prints to report its model cost.
const COST_MARKER: &str = "__STAGEHAND_COST__:";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Tunable executor timings; tests shrink these.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub poll_interval: Duration,
    pub run_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

// ============================================================================
// Requests and Observations
// ============================================================================

/// A request to run an agent, from any trigger source.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub agent: String,
    /// Prompt handed to the agent process, e.g. revision feedback.
    pub prompt: Option<String>,
    pub origin: SignalOrigin,
    /// Set when this run belongs to a pipeline stage.
    pub pipeline: Option<PipelineBinding>,
    /// Working directory for the agent process.
    pub workdir: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(agent: impl Into<String>, origin: SignalOrigin) -> Self {
        Self {
            agent: agent.into(),
            prompt: None,
            origin,
            pipeline: None,
            workdir: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_pipeline(mut self, binding: PipelineBinding) -> Self {
        self.pipeline = Some(binding);
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

/// Result of submitting an execution request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub action: DispatchAction,
    /// Present when the action is `Execute`.
    pub run_id: Option<String>,
}

/// Broadcast to observers when a run reaches a terminal state.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub record: RunRecord,
    pub workdir: Option<PathBuf>,
}

/// A slice of new session output, streamed to observers.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub run_id: String,
    pub agent: String,
    pub text: String,
}

/// Snapshot of one active run.
#[derive(Debug, Clone)]
pub struct RunningInfo {
    pub agent: String,
    pub run_id: String,
    pub session: String,
    pub started_at: DateTime<Utc>,
}

// ============================================================================
// Run Registry
// ============================================================================

struct RunningRun {
    run_id: String,
    session: String,
    started_at: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct AgentSlot {
    running: Vec<RunningRun>,
    queued: Option<ExecutionRequest>,
}

/// The "currently running agents" registry plus the one-deep queue slot.
///
/// This is shared mutable state touched from every trigger source, so all
/// access goes through the mutex; admission (decide + register) is a
/// single critical section.
pub struct RunRegistry {
    slots: Mutex<HashMap<String, AgentSlot>>,
}

enum Admission {
    Launch {
        request: ExecutionRequest,
        run_id: String,
        session: String,
        cancelled: Arc<AtomicBool>,
    },
    Queued,
    Skipped,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Advisory decision for a signal, per the agent's concurrency policy.
    pub async fn decide(&self, agent: &str, policy: &ConcurrencyPolicy) -> DispatchAction {
        let slots = self.slots.lock().await;
        Self::decide_slot(slots.get(agent), policy)
    }

    fn decide_slot(slot: Option<&AgentSlot>, policy: &ConcurrencyPolicy) -> DispatchAction {
        match slot {
            None => DispatchAction::Execute,
            Some(slot) if slot.running.is_empty() => DispatchAction::Execute,
            Some(_) if policy.allow_parallel => DispatchAction::Execute,
            Some(slot) if policy.queue_if_running && slot.queued.is_none() => {
                DispatchAction::Queue
            }
            Some(_) => DispatchAction::Skip,
        }
    }

    /// Atomically decide and register a request.
    async fn admit(&self, request: ExecutionRequest, policy: &ConcurrencyPolicy) -> Admission {
        let mut slots = self.slots.lock().await;
        let action = Self::decide_slot(slots.get(&request.agent), policy);
        let slot = slots.entry(request.agent.clone()).or_default();
        match action {
            DispatchAction::Execute => {
                let short = short_id();
                let run_id = format!("run-{}", short);
                let session = format!("{}{}-{}", SESSION_PREFIX, request.agent, short);
                let cancelled = Arc::new(AtomicBool::new(false));
                slot.running.push(RunningRun {
                    run_id: run_id.clone(),
                    session: session.clone(),
                    started_at: Utc::now(),
                    cancelled: Arc::clone(&cancelled),
                });
                Admission::Launch {
                    request,
                    run_id,
                    session,
                    cancelled,
                }
            }
            DispatchAction::Queue => {
                slot.queued = Some(request);
                Admission::Queued
            }
            DispatchAction::Skip => Admission::Skipped,
        }
    }

    /// Register a run directly, bypassing the concurrency decision.
    /// Used for ordered catch-up runs and by tests.
    pub(crate) async fn begin(&self, agent: &str, run_id: &str, session: &str) -> Arc<AtomicBool> {
        let mut slots = self.slots.lock().await;
        let cancelled = Arc::new(AtomicBool::new(false));
        slots.entry(agent.to_string()).or_default().running.push(RunningRun {
            run_id: run_id.to_string(),
            session: session.to_string(),
            started_at: Utc::now(),
            cancelled: Arc::clone(&cancelled),
        });
        cancelled
    }

    /// Stash one invocation; `false` when the slot is already occupied
    /// (the signal is dropped).
    pub async fn try_queue(&self, request: ExecutionRequest) -> bool {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(request.agent.clone()).or_default();
        if slot.queued.is_some() {
            return false;
        }
        slot.queued = Some(request);
        true
    }

    /// Remove a finished run and release its slot; returns the queued
    /// invocation to drain, if any.
    async fn finish(&self, agent: &str, run_id: &str) -> Option<ExecutionRequest> {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(agent)?;
        slot.running.retain(|run| run.run_id != run_id);
        if slot.running.is_empty() {
            slot.queued.take()
        } else {
            None
        }
    }

    pub async fn is_running(&self, agent: &str) -> bool {
        let slots = self.slots.lock().await;
        slots
            .get(agent)
            .map(|slot| !slot.running.is_empty())
            .unwrap_or(false)
    }

    /// Snapshot of all active runs.
    pub async fn running(&self) -> Vec<RunningInfo> {
        let slots = self.slots.lock().await;
        let mut runs: Vec<RunningInfo> = slots
            .iter()
            .flat_map(|(agent, slot)| {
                slot.running.iter().map(|run| RunningInfo {
                    agent: agent.clone(),
                    run_id: run.run_id.clone(),
                    session: run.session.clone(),
                    started_at: run.started_at,
                })
            })
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    /// Flag a run for cancellation; returns its session name.
    async fn request_cancel(&self, run_id: &str) -> Option<String> {
        let slots = self.slots.lock().await;
        for slot in slots.values() {
            if let Some(run) = slot.running.iter().find(|run| run.run_id == run_id) {
                run.cancelled.store(true, Ordering::SeqCst);
                return Some(run.session.clone());
            }
        }
        None
    }

    /// Flag every run of an agent for cancellation; returns session names.
    async fn request_cancel_agent(&self, agent: &str) -> Vec<String> {
        let slots = self.slots.lock().await;
        slots
            .get(agent)
            .map(|slot| {
                slot.running
                    .iter()
                    .map(|run| {
                        run.cancelled.store(true, Ordering::SeqCst);
                        run.session.clone()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ============================================================================
// Executor
// ============================================================================

struct Inner {
    host: Arc<dyn SessionHost>,
    agents: AgentMap,
    registry: Arc<RunRegistry>,
    history: RunHistory,
    completion_tx: broadcast::Sender<RunCompletion>,
    output_tx: broadcast::Sender<OutputChunk>,
    poll_interval: Duration,
    run_timeout: Duration,
}

/// The single execution gateway. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub fn new(
        host: Arc<dyn SessionHost>,
        agents: AgentMap,
        registry: Arc<RunRegistry>,
        history: RunHistory,
        config: ExecutorConfig,
    ) -> Self {
        let (completion_tx, _) = broadcast::channel(64);
        let (output_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                host,
                agents,
                registry,
                history,
                completion_tx,
                output_tx,
                poll_interval: config.poll_interval,
                run_timeout: config.run_timeout,
            }),
        }
    }

    /// Terminal run notifications.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<RunCompletion> {
        self.inner.completion_tx.subscribe()
    }

    /// Live output stream across all runs.
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputChunk> {
        self.inner.output_tx.subscribe()
    }

    pub fn registry(&self) -> Arc<RunRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub fn history(&self) -> &RunHistory {
        &self.inner.history
    }

    /// Apply the agent's concurrency policy and execute, queue, or drop
    /// the request.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<Submission, ExecutorError> {
        submit_inner(Arc::clone(&self.inner), request).await
    }

    /// Cancel one run by id. The underlying process is killed and the
    /// concurrency slot released; the run records as `Cancelled`.
    pub async fn cancel_run(&self, run_id: &str) -> Result<(), ExecutorError> {
        let session = self
            .inner
            .registry
            .request_cancel(run_id)
            .await
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        if let Err(err) = self.inner.host.kill(&session).await {
            debug!(%session, %err, "session already gone during cancel");
        }
        Ok(())
    }

    /// Cancel every active run of an agent; returns how many were flagged.
    pub async fn cancel_agent(&self, agent: &str) -> Result<usize, ExecutorError> {
        let sessions = self.inner.registry.request_cancel_agent(agent).await;
        if sessions.is_empty() {
            return Err(ExecutorError::NotRunning(agent.to_string()));
        }
        for session in &sessions {
            if let Err(err) = self.inner.host.kill(session).await {
                debug!(%session, %err, "session already gone during cancel");
            }
        }
        Ok(sessions.len())
    }

    /// Relaunch a completed agent with a follow-up prompt.
    pub async fn relaunch(
        &self,
        agent: &str,
        follow_up: impl Into<String>,
    ) -> Result<Submission, ExecutorError> {
        self.submit(
            ExecutionRequest::new(agent, SignalOrigin::Relaunch).with_prompt(follow_up),
        )
        .await
    }

    /// Apply the agent's catch-up policy for schedule occurrences missed
    /// since its last recorded run. Returns the number of catch-up runs
    /// started.
    pub async fn catch_up_agent(&self, agent: &str) -> Result<usize, ExecutorError> {
        let agent_def = self
            .lookup(agent)
            .await
            .ok_or_else(|| ExecutorError::UnknownAgent(agent.to_string()))?;
        let Some(last) = self.inner.history.last(agent)? else {
            // No history means no baseline to be behind.
            return Ok(0);
        };

        let now = Utc::now();
        let mut missed: Vec<DateTime<Utc>> = Vec::new();
        for (expr, tz) in resolve_triggers(&agent_def).schedules() {
            missed.extend(cron::missed_occurrences(expr, tz, last.started_at, now)?);
        }
        missed.sort();
        if missed.is_empty() {
            return Ok(0);
        }

        match agent_def.catch_up {
            CatchUpPolicy::Skip => {
                debug!(agent, missed = missed.len(), "skipping missed occurrences");
                Ok(0)
            }
            CatchUpPolicy::RunOnce => {
                info!(agent, missed = missed.len(), "running single catch-up");
                self.submit(ExecutionRequest::new(agent, SignalOrigin::CatchUp))
                    .await?;
                Ok(1)
            }
            CatchUpPolicy::RunAll => {
                info!(agent, missed = missed.len(), "running one catch-up per occurrence");
                let inner = Arc::clone(&self.inner);
                let agent_name = agent.to_string();
                let count = missed.len();
                tokio::spawn(async move {
                    for _ in 0..count {
                        let request =
                            ExecutionRequest::new(&agent_name, SignalOrigin::CatchUp);
                        let short = short_id();
                        let run_id = format!("run-{}", short);
                        let session =
                            format!("{}{}-{}", SESSION_PREFIX, agent_name, short);
                        let cancelled =
                            inner.registry.begin(&agent_name, &run_id, &session).await;
                        run_agent(
                            Arc::clone(&inner),
                            agent_def.clone(),
                            request,
                            run_id,
                            session,
                            cancelled,
                        )
                        .await;
                    }
                });
                Ok(count)
            }
        }
    }

    /// Run catch-up for every registered agent; errors are logged, not
    /// propagated, so one bad schedule cannot stall startup.
    pub async fn catch_up_all(&self) -> usize {
        let names: Vec<String> = {
            let agents = self.inner.agents.read().await;
            agents.keys().cloned().collect()
        };
        let mut total = 0;
        for name in names {
            match self.catch_up_agent(&name).await {
                Ok(count) => total += count,
                Err(err) => warn!(agent = %name, %err, "catch-up failed"),
            }
        }
        total
    }

    async fn lookup(&self, agent: &str) -> Option<AgentDefinition> {
        self.inner.agents.read().await.get(agent).cloned()
    }
}

async fn submit_inner(
    inner: Arc<Inner>,
    request: ExecutionRequest,
) -> Result<Submission, ExecutorError> {
    let agent_def = {
        let agents = inner.agents.read().await;
        agents
            .get(&request.agent)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownAgent(request.agent.clone()))?
    };

    match inner
        .registry
        .admit(request, &agent_def.concurrency)
        .await
    {
        Admission::Launch {
            request,
            run_id,
            session,
            cancelled,
        } => {
            info!(agent = %agent_def.name, %run_id, %session, origin = ?request.origin, "executing agent");
            let id = run_id.clone();
            launch(&inner, agent_def, request, run_id, session, cancelled);
            Ok(Submission {
                action: DispatchAction::Execute,
                run_id: Some(id),
            })
        }
        Admission::Queued => {
            info!(agent = %agent_def.name, "run queued behind active instance");
            Ok(Submission {
                action: DispatchAction::Queue,
                run_id: None,
            })
        }
        Admission::Skipped => {
            debug!(agent = %agent_def.name, "signal skipped, agent busy");
            Ok(Submission {
                action: DispatchAction::Skip,
                run_id: None,
            })
        }
    }
}

fn launch(
    inner: &Arc<Inner>,
    agent_def: AgentDefinition,
    request: ExecutionRequest,
    run_id: String,
    session: String,
    cancelled: Arc<AtomicBool>,
) {
    let inner = Arc::clone(inner);
    // Boxed so the run future can re-enter submit when draining the queue.
    let fut: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
        run_agent(inner, agent_def, request, run_id, session, cancelled).await;
    });
    tokio::spawn(fut);
}

/// Full lifecycle of one run: spawn, poll output, record, drain queue.
async fn run_agent(
    inner: Arc<Inner>,
    agent_def: AgentDefinition,
    request: ExecutionRequest,
    run_id: String,
    session: String,
    cancelled: Arc<AtomicBool>,
) -> RunRecord {
    let started_at = Utc::now();
    let start = Instant::now();

    let mut command = agent_def.launch_command(request.prompt.as_deref());
    if let Some(dir) = &request.workdir {
        command = format!("cd '{}' && {}", dir.display(), command);
    }
    // The wrapper prints the exit marker even when the agent fails.
    let command = format!(r"{}; printf '\n{}%d\n' $?", command, EXIT_MARKER);

    let mut status = RunStatus::Exited;
    let mut exit_code: Option<i32> = None;
    let mut cost = 0.0;

    match inner.host.create(&session, Some(&command)).await {
        Err(err) => {
            warn!(agent = %agent_def.name, %run_id, %err, "spawn failed");
            status = RunStatus::SpawnFailed;
        }
        Ok(()) => {
            let mut seen_len = 0usize;
            loop {
                tokio::time::sleep(inner.poll_interval).await;

                if cancelled.load(Ordering::SeqCst) {
                    status = RunStatus::Cancelled;
                    break;
                }
                if start.elapsed() >= inner.run_timeout {
                    warn!(agent = %agent_def.name, %run_id, "run timed out");
                    status = RunStatus::TimedOut;
                    break;
                }

                match inner.host.read_output(&session).await {
                    Ok(output) => {
                        // Captured panes can redraw; only stream clean
                        // suffix growth.
                        if let Some(text) = output.get(seen_len..).filter(|t| !t.is_empty()) {
                            let text = text.to_string();
                            seen_len = output.len();
                            let _ = inner.output_tx.send(OutputChunk {
                                run_id: run_id.clone(),
                                agent: agent_def.name.clone(),
                                text,
                            });
                        }
                        if let Some(code) = parse_exit_marker(&output) {
                            status = RunStatus::Exited;
                            exit_code = Some(code);
                            cost = parse_cost_marker(&output).unwrap_or(0.0);
                            break;
                        }
                    }
                    Err(_) => {
                        status = if cancelled.load(Ordering::SeqCst) {
                            RunStatus::Cancelled
                        } else {
                            RunStatus::SpawnFailed
                        };
                        break;
                    }
                }
            }
        }
    }

    if let Err(err) = inner.host.kill(&session).await {
        debug!(%session, %err, "session already gone at cleanup");
    }

    let record = RunRecord {
        run_id: run_id.clone(),
        agent: agent_def.name.clone(),
        status,
        exit_code,
        started_at,
        duration_ms: start.elapsed().as_millis() as u64,
        cost,
        origin: request.origin,
        pipeline: request.pipeline.clone(),
    };

    info!(
        agent = %record.agent,
        %run_id,
        status = ?record.status,
        exit_code = ?record.exit_code,
        duration_ms = record.duration_ms,
        "run finished"
    );

    if let Err(err) = inner.history.append(&record) {
        warn!(agent = %record.agent, %err, "failed to append run history");
    }

    let queued = inner.registry.finish(&agent_def.name, &run_id).await;

    let _ = inner.completion_tx.send(RunCompletion {
        record: record.clone(),
        workdir: request.workdir.clone(),
    });

    if let Some(next) = queued {
        debug!(agent = %agent_def.name, "draining queued invocation");
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            if let Err(err) = submit_inner(inner, next).await {
                warn!(%err, "failed to drain queued invocation");
            }
        });
    }

    record
}

fn parse_exit_marker(output: &str) -> Option<i32> {
    let idx = output.rfind(EXIT_MARKER)?;
    let rest = &output[idx + EXIT_MARKER.len()..];
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}

fn parse_cost_marker(output: &str) -> Option<f64> {
    let idx = output.rfind(COST_MARKER)?;
    let rest = &output[idx + COST_MARKER.len()..];
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    token.parse().ok()
}
