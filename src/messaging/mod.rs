// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Point-to-point and broadcast messaging between agent sessions.
//!
//! Delivery works over the same text channel the agents live in: the
//! message is injected as input prefixed with a unique id, and the
//! sender polls the target's visible output until the id shows up. The
//! id confirms nothing about comprehension, only that the text actually
//! reached the target's visible output.
//!
//! The confirmation loop is an explicit bounded retry (2 attempts total);
//! nothing here runs on background threads, so the whole exchange is
//! deterministic under test.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::MessagingError;
use crate::executor::SESSION_PREFIX;
use crate::host::SessionHost;
use crate::types::TeamRoster;

/// Markers that indicate an agent session is sitting at a prompt.
const READY_MARKERS: &[&str] = &["❯", "✻", "$ ", "> "];

/// Total injection attempts before giving up on a delivery.
const MAX_DELIVERY_ATTEMPTS: u32 = 2;

static BARE_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("valid target regex"));
static INSTANCE_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9_-]*):([0-9a-z]+)$").expect("valid target regex")
});

/// A confirmed delivery.
#[derive(Debug, Clone)]
pub struct MessageDelivery {
    pub session: String,
    pub message_id: String,
    pub content: String,
}

/// Per-target outcome of a broadcast. Failures never abort the batch.
#[derive(Debug, Clone, Default)]
pub struct BroadcastResult {
    pub successful: Vec<String>,
    pub failed: Vec<String>,
}

/// Messaging timeouts; tests shrink these.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Bound on waiting for the target to reach a ready prompt.
    pub ready_timeout: Duration,
    /// Bound on one delivery-confirmation poll cycle.
    pub confirm_timeout: Duration,
    /// Output polling interval.
    pub poll_interval: Duration,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(30),
            confirm_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Text delivery between running agent sessions.
#[derive(Clone)]
pub struct Communicator {
    host: Arc<dyn SessionHost>,
    /// Sender identity embedded in message ids.
    sender: String,
    config: MessagingConfig,
}

impl Communicator {
    pub fn new(host: Arc<dyn SessionHost>, sender: impl Into<String>) -> Self {
        Self {
            host,
            sender: sender.into(),
            config: MessagingConfig::default(),
        }
    }

    pub fn with_config(mut self, config: MessagingConfig) -> Self {
        self.config = config;
        self
    }

    fn new_message_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string()[..8].to_string();
        format!("MSG_{}_{}", self.sender.to_uppercase(), suffix)
    }

    /// Send to one target, waiting for readiness and confirming delivery.
    ///
    /// Accepted target formats: a bare agent identifier, or an identifier
    /// plus instance suffix (`builder:1a2b3c4d`). Anything else is
    /// rejected synchronously.
    pub async fn send_message(
        &self,
        target: &str,
        content: &str,
    ) -> Result<MessageDelivery, MessagingError> {
        let session = self.resolve_target(target).await?;
        self.deliver(&session, content).await
    }

    /// Deliver to every team member with an active session, concurrently.
    pub async fn broadcast_team(&self, team: &TeamRoster, content: &str) -> BroadcastResult {
        let mut set = JoinSet::new();
        for member in &team.members {
            let communicator = self.clone();
            let member = member.clone();
            let content = content.to_string();
            set.spawn(async move {
                let outcome = communicator.send_message(&member, &content).await;
                (member, outcome)
            });
        }
        self.collect_broadcast(set).await
    }

    /// Deliver to every active agent session system-wide, discovered via
    /// session listing.
    pub async fn broadcast_all(&self, content: &str) -> Result<BroadcastResult, MessagingError> {
        let sessions = self.host.list_sessions().await?;
        let mut set = JoinSet::new();
        for session in sessions
            .into_iter()
            .filter(|name| name.starts_with(SESSION_PREFIX))
        {
            let communicator = self.clone();
            let content = content.to_string();
            set.spawn(async move {
                let outcome = communicator.deliver(&session, &content).await;
                (session, outcome)
            });
        }
        Ok(self.collect_broadcast(set).await)
    }

    async fn collect_broadcast(
        &self,
        mut set: JoinSet<(String, Result<MessageDelivery, MessagingError>)>,
    ) -> BroadcastResult {
        let mut result = BroadcastResult::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((target, Ok(delivery))) => {
                    debug!(%target, message_id = %delivery.message_id, "broadcast delivery confirmed");
                    result.successful.push(delivery.session);
                }
                Ok((target, Err(err))) => {
                    debug!(%target, %err, "broadcast delivery failed");
                    result.failed.push(target);
                }
                Err(err) => debug!(%err, "broadcast task panicked"),
            }
        }
        result.successful.sort();
        result.failed.sort();
        result
    }

    /// Resolve a target name to a live session name.
    async fn resolve_target(&self, target: &str) -> Result<String, MessagingError> {
        if let Some(caps) = INSTANCE_TARGET.captures(target) {
            let session = format!("{}{}-{}", SESSION_PREFIX, &caps[1], &caps[2]);
            if self.host.is_alive(&session).await? {
                return Ok(session);
            }
            return Err(MessagingError::SessionNotFound(target.to_string()));
        }

        if !BARE_TARGET.is_match(target) {
            return Err(MessagingError::InvalidTarget(target.to_string()));
        }

        let sessions = self.host.list_sessions().await?;
        let exact = format!("{}{}", SESSION_PREFIX, target);
        if sessions.iter().any(|name| *name == exact) {
            return Ok(exact);
        }
        let prefix = format!("{}{}-", SESSION_PREFIX, target);
        sessions
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .min()
            .ok_or_else(|| MessagingError::SessionNotFound(target.to_string()))
    }

    /// Inject into a concrete session and confirm the text reached its
    /// visible output.
    async fn deliver(
        &self,
        session: &str,
        content: &str,
    ) -> Result<MessageDelivery, MessagingError> {
        let message_id = self.new_message_id();
        self.wait_ready(session).await?;

        let line = format!("{}: {}", message_id, content);
        for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
            let accepted = self.host.send_input(session, &line).await?;
            if accepted && self.confirm(session, &message_id).await? {
                info!(session, %message_id, attempt, "message delivered");
                return Ok(MessageDelivery {
                    session: session.to_string(),
                    message_id,
                    content: content.to_string(),
                });
            }
            debug!(session, %message_id, attempt, "delivery unconfirmed, retrying");
        }

        Err(MessagingError::DeliveryTimeout {
            session: session.to_string(),
            attempts: MAX_DELIVERY_ATTEMPTS,
        })
    }

    /// Poll until the session shows a ready prompt.
    async fn wait_ready(&self, session: &str) -> Result<(), MessagingError> {
        let started = Instant::now();
        loop {
            let output = self.host.read_output(session).await?;
            if READY_MARKERS.iter().any(|marker| output.contains(marker)) {
                return Ok(());
            }
            if started.elapsed() >= self.config.ready_timeout {
                return Err(MessagingError::ReadyTimeout {
                    session: session.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Poll the session's visible output for the message id.
    async fn confirm(&self, session: &str, message_id: &str) -> Result<bool, MessagingError> {
        let started = Instant::now();
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            let output = self.host.read_output(session).await?;
            if output.contains(message_id) {
                return Ok(true);
            }
            if started.elapsed() >= self.config.confirm_timeout {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    fn test_config() -> MessagingConfig {
        MessagingConfig {
            ready_timeout: Duration::from_millis(60),
            confirm_timeout: Duration::from_millis(40),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn communicator(host: Arc<FakeHost>) -> Communicator {
        Communicator::new(host, "orchestrator").with_config(test_config())
    }

    #[tokio::test]
    async fn test_send_message_confirmed() {
        let host = Arc::new(FakeHost::new());
        host.add_session("stagehand-worker", "❯ ");
        let comm = communicator(Arc::clone(&host));

        let delivery = comm.send_message("worker", "status?").await.unwrap();
        assert_eq!(delivery.session, "stagehand-worker");
        assert!(delivery.message_id.starts_with("MSG_ORCHESTRATOR_"));
        assert_eq!(delivery.message_id.len(), "MSG_ORCHESTRATOR_".len() + 8);

        let injected = host.injected("stagehand-worker");
        assert_eq!(injected.len(), 1);
        assert!(injected[0].ends_with(": status?"));
        assert!(injected[0].starts_with(&delivery.message_id));
    }

    #[tokio::test]
    async fn test_invalid_target_rejected_synchronously() {
        let host = Arc::new(FakeHost::new());
        let comm = communicator(host);

        for target in ["bad name", "sh!ell", "", "1leading-digit", "a:b:c"] {
            let err = comm.send_message(target, "x").await.unwrap_err();
            assert!(
                matches!(err, MessagingError::InvalidTarget(_)),
                "{} should be invalid",
                target
            );
        }
    }

    #[tokio::test]
    async fn test_instance_suffix_resolution() {
        let host = Arc::new(FakeHost::new());
        host.add_session("stagehand-worker-1a2b3c4d", "❯ ");
        host.add_session("stagehand-worker-9f8e7d6c", "❯ ");
        let comm = communicator(Arc::clone(&host));

        let delivery = comm
            .send_message("worker:9f8e7d6c", "direct")
            .await
            .unwrap();
        assert_eq!(delivery.session, "stagehand-worker-9f8e7d6c");

        let err = comm.send_message("worker:00000000", "x").await.unwrap_err();
        assert!(matches!(err, MessagingError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_bare_target_prefers_exact_session() {
        let host = Arc::new(FakeHost::new());
        host.add_session("stagehand-worker", "❯ ");
        host.add_session("stagehand-worker-1a2b3c4d", "❯ ");
        let comm = communicator(Arc::clone(&host));

        let delivery = comm.send_message("worker", "hello").await.unwrap();
        assert_eq!(delivery.session, "stagehand-worker");
    }

    #[tokio::test]
    async fn test_missing_target_session() {
        let host = Arc::new(FakeHost::new());
        let comm = communicator(host);
        let err = comm.send_message("ghost", "x").await.unwrap_err();
        assert!(matches!(err, MessagingError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let host = Arc::new(FakeHost::new());
        // Output never shows a prompt marker.
        host.add_session("stagehand-busy", "compiling...");
        let comm = communicator(host);

        let err = comm.send_message("busy", "x").await.unwrap_err();
        assert!(matches!(err, MessagingError::ReadyTimeout { .. }));
    }

    #[tokio::test]
    async fn test_failed_delivery_caps_at_two_attempts() {
        let host = Arc::new(FakeHost::new());
        host.add_session("stagehand-worker", "❯ ");
        // Input is accepted but never reaches the visible output.
        host.set_silent("stagehand-worker");
        let comm = communicator(Arc::clone(&host));

        let err = comm.send_message("worker", "anyone there?").await.unwrap_err();
        assert!(matches!(
            err,
            MessagingError::DeliveryTimeout { attempts: 2, .. }
        ));

        // Exactly two injections, and no message id ever confirmed: the
        // target's observable state is as if nothing was confirmed.
        let injected = host.injected("stagehand-worker");
        assert_eq!(injected.len(), 2);
        let output = host.read_output("stagehand-worker").await.unwrap();
        assert!(!output.contains("MSG_ORCHESTRATOR_"));
    }

    #[tokio::test]
    async fn test_broadcast_team_isolates_failures() {
        let host = Arc::new(FakeHost::new());
        host.add_session("stagehand-alpha-1", "❯ ");
        host.add_session("stagehand-beta-1", "❯ ");
        host.add_session("stagehand-gamma-1", "❯ ");
        // gamma swallows input: unreachable for confirmation.
        host.set_silent("stagehand-gamma-1");
        let comm = communicator(Arc::clone(&host));

        let team = TeamRoster {
            name: "alpha-team".to_string(),
            members: vec![
                "alpha".to_string(),
                "beta".to_string(),
                "gamma".to_string(),
            ],
        };
        let result = comm.broadcast_team(&team, "status?").await;

        assert_eq!(
            result.successful,
            vec!["stagehand-alpha-1", "stagehand-beta-1"]
        );
        assert_eq!(result.failed, vec!["gamma"]);
    }

    #[tokio::test]
    async fn test_broadcast_all_targets_only_agent_sessions() {
        let host = Arc::new(FakeHost::new());
        host.add_session("stagehand-alpha-1", "❯ ");
        host.add_session("stagehand-beta-1", "❯ ");
        host.add_session("unrelated-session", "❯ ");
        let comm = communicator(Arc::clone(&host));

        let result = comm.broadcast_all("ship it").await.unwrap();
        assert_eq!(
            result.successful,
            vec!["stagehand-alpha-1", "stagehand-beta-1"]
        );
        assert!(result.failed.is_empty());
        assert!(host.injected("unrelated-session").is_empty());
    }
}
