// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tmux-backed session host.
//!
//! Shells out to the `tmux` binary. Sessions are created detached; input
//! is injected with `send-keys` in literal mode, and visible output is
//! captured with `capture-pane` including a slice of scrollback so exit
//! and delivery markers survive screen redraws.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use super::SessionHost;
use crate::error::HostError;

/// Scrollback lines included when capturing a pane.
const CAPTURE_SCROLLBACK_LINES: u32 = 200;

/// Session host backed by a tmux server.
#[derive(Debug, Clone)]
pub struct TmuxHost {
    /// tmux binary to invoke, normally just `tmux`.
    binary: String,
}

impl TmuxHost {
    pub fn new() -> Self {
        Self {
            binary: "tmux".to_string(),
        }
    }

    /// Use a specific tmux binary path.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Run a tmux command and return stdout.
    async fn tmux(&self, args: &[&str]) -> Result<String, HostError> {
        trace!(?args, "tmux");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(HostError::CommandFailed(stderr))
        }
    }

    fn not_found(session: &str, err: &HostError) -> bool {
        matches!(err, HostError::CommandFailed(msg)
            if msg.contains("can't find session") || msg.contains(session))
    }
}

impl Default for TmuxHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionHost for TmuxHost {
    async fn create(&self, session: &str, command: Option<&str>) -> Result<(), HostError> {
        if self.is_alive(session).await? {
            return Err(HostError::SessionExists(session.to_string()));
        }

        let mut args = vec!["new-session", "-d", "-s", session];
        if let Some(command) = command {
            args.push(command);
        }
        self.tmux(&args).await?;
        debug!(session, "created session");
        Ok(())
    }

    async fn send_input(&self, session: &str, text: &str) -> Result<bool, HostError> {
        // Literal mode first so the text is never interpreted as key names,
        // then a separate Enter keypress to submit.
        match self.tmux(&["send-keys", "-t", session, "-l", text]).await {
            Ok(_) => {}
            Err(err) if Self::not_found(session, &err) => {
                return Err(HostError::SessionNotFound(session.to_string()))
            }
            Err(_) => return Ok(false),
        }
        match self.tmux(&["send-keys", "-t", session, "Enter"]).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    async fn read_output(&self, session: &str) -> Result<String, HostError> {
        let start = format!("-{}", CAPTURE_SCROLLBACK_LINES);
        match self
            .tmux(&["capture-pane", "-p", "-t", session, "-S", &start])
            .await
        {
            Ok(output) => Ok(output),
            Err(err) if Self::not_found(session, &err) => {
                Err(HostError::SessionNotFound(session.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<String>, HostError> {
        match self
            .tmux(&["list-sessions", "-F", "#{session_name}"])
            .await
        {
            Ok(output) => Ok(output
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect()),
            // A missing server just means zero sessions.
            Err(HostError::CommandFailed(msg))
                if msg.contains("no server running") || msg.contains("No such file") =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    async fn kill(&self, session: &str) -> Result<(), HostError> {
        match self.tmux(&["kill-session", "-t", session]).await {
            Ok(_) => {
                debug!(session, "killed session");
                Ok(())
            }
            Err(err) if Self::not_found(session, &err) => {
                Err(HostError::SessionNotFound(session.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    async fn is_alive(&self, session: &str) -> Result<bool, HostError> {
        // `has-session -t name` matches by prefix; the exact-name form
        // uses the `=` qualifier.
        let target = format!("={}", session);
        match self.tmux(&["has-session", "-t", &target]).await {
            Ok(_) => Ok(true),
            Err(HostError::CommandFailed(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_binary() {
        let host = TmuxHost::new().with_binary("/opt/tmux/bin/tmux");
        assert_eq!(host.binary, "/opt/tmux/bin/tmux");
    }

    #[test]
    fn test_not_found_detection() {
        let err = HostError::CommandFailed("can't find session: worker-1".to_string());
        assert!(TmuxHost::not_found("worker-1", &err));

        let other = HostError::CommandFailed("server exited unexpectedly".to_string());
        assert!(!TmuxHost::not_found("worker-1", &other));
    }
}
