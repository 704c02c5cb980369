// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator service facade.
//!
//! Wires the bus, resolver, executor, pipeline manager and communicator
//! together and exposes the narrow query/command interface the dashboard
//! and CLI consume. The event bus is constructed here and injected into
//! everything that publishes or subscribes; nothing reaches for a global.
//!
//! `start` spawns the background loops: the minute clock for schedule
//! triggers, the bus listener (with per-trigger debouncing), the debounce
//! drain, and run-completion routing into the pipeline manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{DebounceKey, DebouncedFire, Debouncer, EventBus};
use crate::error::{ExecutorError, PipelineError, Result, TriggerError};
use crate::executor::{
    AgentStats, ExecutionRequest, Executor, ExecutorConfig, RunHistory, RunRegistry, RunningInfo,
    Submission,
};
use crate::host::SessionHost;
use crate::messaging::{BroadcastResult, Communicator, MessageDelivery, MessagingConfig};
use crate::pipeline::{
    GitWorktrees, Pipeline, PipelineManager, PipelineStore, StageSpec,
};
use crate::trigger::{cron, DispatchAction, Signal, TriggerResolver};
use crate::types::{AgentDefinition, AgentMap, SignalOrigin, TeamRoster};

/// Service construction options.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root for persisted state (`pipelines/`, `runs/`).
    pub data_dir: PathBuf,
    /// Identity embedded in outgoing message ids.
    pub sender: String,
    pub bus_capacity: usize,
    pub executor: ExecutorConfig,
    pub messaging: MessagingConfig,
    /// When set, pipelines get isolated git worktrees of this repository.
    pub repo_root: Option<PathBuf>,
    pub base_branch: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|home| home.join(".stagehand"))
            .unwrap_or_else(|| PathBuf::from(".stagehand"));
        Self {
            data_dir,
            sender: "orchestrator".to_string(),
            bus_capacity: 256,
            executor: ExecutorConfig::default(),
            messaging: MessagingConfig::default(),
            repo_root: None,
            base_branch: "main".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Keep all state under a specific directory.
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

/// The assembled orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    bus: EventBus,
    agents: AgentMap,
    resolver: TriggerResolver,
    executor: Executor,
    pipelines: PipelineManager,
    communicator: Communicator,
    debouncer: Debouncer,
    debounce_rx: Arc<Mutex<Option<mpsc::Receiver<DebouncedFire>>>>,
}

impl Orchestrator {
    pub fn new(host: Arc<dyn SessionHost>, config: OrchestratorConfig) -> Self {
        let bus = EventBus::with_capacity(config.bus_capacity);
        let agents: AgentMap = Arc::new(RwLock::new(HashMap::new()));
        let registry = Arc::new(RunRegistry::new());

        let executor = Executor::new(
            Arc::clone(&host),
            Arc::clone(&agents),
            Arc::clone(&registry),
            RunHistory::new(config.data_dir.join("runs")),
            config.executor.clone(),
        );

        let resolver = TriggerResolver::new(Arc::clone(&agents), registry);

        let mut pipelines = PipelineManager::new(
            PipelineStore::new(config.data_dir.join("pipelines")),
            executor.clone(),
        )
        .with_bus(bus.clone());
        if let Some(repo_root) = &config.repo_root {
            pipelines = pipelines.with_workspaces(Arc::new(GitWorktrees::new(
                repo_root,
                config.base_branch.clone(),
            )));
        }

        let communicator =
            Communicator::new(host, config.sender.clone()).with_config(config.messaging.clone());

        let (debouncer, debounce_rx) = Debouncer::new();

        Self {
            bus,
            agents,
            resolver,
            executor,
            pipelines,
            communicator,
            debouncer,
            debounce_rx: Arc::new(Mutex::new(Some(debounce_rx))),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn pipelines(&self) -> &PipelineManager {
        &self.pipelines
    }

    pub fn communicator(&self) -> &Communicator {
        &self.communicator
    }

    // ========================================================================
    // Agent registry (definitions come from collaborators)
    // ========================================================================

    pub async fn register_agent(&self, definition: AgentDefinition) {
        let mut agents = self.agents.write().await;
        info!(agent = %definition.name, "registered agent");
        agents.insert(definition.name.clone(), definition);
    }

    pub async fn remove_agent(&self, name: &str) -> bool {
        let mut agents = self.agents.write().await;
        agents.remove(name).is_some()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Load persisted state, run schedule catch-up, and spawn the
    /// background loops.
    pub async fn start(&self) -> Result<()> {
        let restored = self.pipelines.load_existing().await?;
        if restored > 0 {
            info!(restored, "restored persisted pipelines");
        }

        let caught_up = self.executor.catch_up_all().await;
        if caught_up > 0 {
            info!(caught_up, "catch-up runs started");
        }

        self.spawn_completion_router();
        self.spawn_event_loop();
        self.spawn_debounce_drain().await;
        self.spawn_clock();

        Ok(())
    }

    fn spawn_completion_router(&self) {
        let mut completions = self.executor.subscribe_completions();
        let pipelines = self.pipelines.clone();
        tokio::spawn(async move {
            while let Ok(completion) = completions.recv().await {
                if let Err(err) = pipelines.handle_completion(&completion).await {
                    warn!(%err, run_id = %completion.record.run_id, "completion routing failed");
                }
            }
        });
    }

    fn spawn_event_loop(&self) {
        let mut stream = self.bus.subscribe();
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                orchestrator.handle_event(event).await;
            }
        });
    }

    async fn spawn_debounce_drain(&self) {
        let Some(mut rx) = self.debounce_rx.lock().await.take() else {
            return;
        };
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(fire) = rx.recv().await {
                debug!(agent = %fire.key.agent, event_type = %fire.key.event_type, "debounced execute");
                let request = ExecutionRequest::new(&fire.key.agent, SignalOrigin::Event);
                if let Err(err) = orchestrator.executor.submit(request).await {
                    warn!(%err, agent = %fire.key.agent, "debounced dispatch failed");
                }
            }
        });
    }

    fn spawn_clock(&self) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            loop {
                // Wake just after each minute boundary; cron matching is
                // minute-granular.
                let now = Utc::now();
                let millis_into_minute = (now.timestamp_millis().rem_euclid(60_000)) as u64;
                tokio::time::sleep(Duration::from_millis(60_050 - millis_into_minute)).await;
                orchestrator.handle_signal(&Signal::Tick(Utc::now())).await;
            }
        });
    }

    // ========================================================================
    // Signal handling
    // ========================================================================

    /// Match a signal against all agents and act on the decisions.
    /// Returns how many runs were started.
    pub async fn handle_signal(&self, signal: &Signal) -> usize {
        let decisions = self.resolver.on_signal(signal).await;
        let mut started = 0;
        for decision in decisions {
            if decision.action == DispatchAction::Skip {
                debug!(agent = %decision.agent, "signal skipped");
                continue;
            }
            let request = ExecutionRequest::new(&decision.agent, decision.origin);
            match self.executor.submit(request).await {
                Ok(submission) if submission.action == DispatchAction::Execute => started += 1,
                Ok(_) => {}
                Err(err) => warn!(agent = %decision.agent, %err, "dispatch failed"),
            }
        }
        started
    }

    /// Route one bus event: immediate dispatch for undebounced triggers,
    /// a timer reset for debounced ones.
    async fn handle_event(&self, event: crate::bus::SystemEvent) {
        for (agent, trigger) in self.resolver.matching_event_triggers(&event).await {
            if trigger.debounce_ms == 0 {
                let request = ExecutionRequest::new(&agent, SignalOrigin::Event);
                if let Err(err) = self.executor.submit(request).await {
                    warn!(%err, %agent, "event dispatch failed");
                }
            } else {
                self.debouncer
                    .observe(
                        DebounceKey::new(agent, &trigger.event_type),
                        event.payload.clone(),
                        Duration::from_millis(trigger.debounce_ms),
                    )
                    .await;
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn list_pipelines(&self) -> Vec<Pipeline> {
        self.pipelines.list_pipelines().await
    }

    pub async fn get_pipeline(&self, id: Uuid) -> Option<Pipeline> {
        self.pipelines.get_pipeline(id).await
    }

    pub async fn list_running(&self) -> Vec<RunningInfo> {
        self.executor.registry().running().await
    }

    pub fn agent_stats(&self, agent: &str) -> std::result::Result<AgentStats, ExecutorError> {
        self.executor.history().stats(agent)
    }

    /// Next `n` occurrence times for a cron expression.
    pub fn cron_next(
        &self,
        expr: &str,
        timezone: Option<&str>,
        n: usize,
    ) -> std::result::Result<Vec<DateTime<Utc>>, TriggerError> {
        cron::upcoming(expr, timezone, n)
    }

    /// Plain-words description of a cron expression.
    pub fn cron_describe(&self, expr: &str) -> std::result::Result<String, TriggerError> {
        cron::describe(expr)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    pub async fn create_pipeline(
        &self,
        idea_id: impl Into<String>,
        specs: Vec<StageSpec>,
    ) -> std::result::Result<Pipeline, PipelineError> {
        self.pipelines.create_pipeline(idea_id, specs).await
    }

    pub async fn abort_pipeline(
        &self,
        id: Uuid,
        reason: &str,
    ) -> std::result::Result<(), PipelineError> {
        self.pipelines.abort_pipeline(id, reason).await
    }

    pub async fn skip_stage(
        &self,
        run_id: &str,
        reason: &str,
    ) -> std::result::Result<(), PipelineError> {
        self.pipelines.skip_stage(run_id, reason).await
    }

    pub async fn retry_stage(
        &self,
        id: Uuid,
        reason: &str,
    ) -> std::result::Result<(), PipelineError> {
        self.pipelines.retry_stage(id, reason).await
    }

    pub async fn archive_pipeline(&self, id: Uuid) -> std::result::Result<(), PipelineError> {
        self.pipelines.archive_pipeline(id).await
    }

    /// Run an agent now, outside any trigger.
    pub async fn trigger_agent(
        &self,
        agent: &str,
    ) -> std::result::Result<Submission, ExecutorError> {
        self.executor
            .submit(ExecutionRequest::new(agent, SignalOrigin::Manual))
            .await
    }

    pub async fn cancel_agent(&self, agent: &str) -> std::result::Result<usize, ExecutorError> {
        self.executor.cancel_agent(agent).await
    }

    /// Relaunch a completed agent with a follow-up prompt.
    pub async fn relaunch_agent(
        &self,
        agent: &str,
        follow_up: &str,
    ) -> std::result::Result<Submission, ExecutorError> {
        self.executor.relaunch(agent, follow_up).await
    }

    pub async fn send_message(
        &self,
        target: &str,
        content: &str,
    ) -> std::result::Result<MessageDelivery, crate::error::MessagingError> {
        self.communicator.send_message(target, content).await
    }

    pub async fn broadcast_team(&self, team: &TeamRoster, content: &str) -> BroadcastResult {
        self.communicator.broadcast_team(team, content).await
    }

    pub async fn broadcast_all(
        &self,
        content: &str,
    ) -> std::result::Result<BroadcastResult, crate::error::MessagingError> {
        self.communicator.broadcast_all(content).await
    }
}
