// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory session host for tests.
//!
//! Sessions are plain records; tests script their visible output and
//! inspect what was injected. Input echo is on by default (injected text
//! shows up in the output, like a terminal), and can be disabled per
//! session to simulate a pane that swallows input.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::SessionHost;
use crate::error::HostError;

#[derive(Debug, Default, Clone)]
struct FakeSession {
    output: String,
    command: Option<String>,
    echo_input: bool,
    refuse_input: bool,
    injected: Vec<String>,
}

/// Scripted in-memory [`SessionHost`].
#[derive(Default)]
pub struct FakeHost {
    sessions: Mutex<HashMap<String, FakeSession>>,
    /// Output preset for sessions created through the trait.
    default_script: Mutex<Option<String>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session created from now on starts with this visible output.
    pub fn set_default_script(&self, lines: &[&str]) {
        let mut script = self.default_script.lock().unwrap();
        *script = Some(format!("{}\n", lines.join("\n")));
    }

    /// Register a live session with the given visible output.
    pub fn add_session(&self, name: &str, output: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.insert(
            name.to_string(),
            FakeSession {
                output: output.to_string(),
                echo_input: true,
                ..Default::default()
            },
        );
    }

    /// Append a line to a session's visible output.
    pub fn script_output(&self, name: &str, line: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(name) {
            session.output.push_str(line);
            session.output.push('\n');
        }
    }

    /// Make the session accept input without it ever reaching the output.
    pub fn set_silent(&self, name: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(name) {
            session.echo_input = false;
        }
    }

    /// Make `send_input` report failure for this session.
    pub fn set_refuse_input(&self, name: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(name) {
            session.refuse_input = true;
        }
    }

    /// Everything injected into a session, in order.
    pub fn injected(&self, name: &str) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(name)
            .map(|s| s.injected.clone())
            .unwrap_or_default()
    }

    /// The command a session was created with.
    pub fn command_of(&self, name: &str) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(name).and_then(|s| s.command.clone())
    }

    /// First live session whose name starts with `prefix`.
    pub fn find_session(&self, prefix: &str) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        let mut names: Vec<_> = sessions
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        names.sort();
        names.into_iter().next()
    }
}

#[async_trait]
impl SessionHost for FakeHost {
    async fn create(&self, session: &str, command: Option<&str>) -> Result<(), HostError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(session) {
            return Err(HostError::SessionExists(session.to_string()));
        }
        let output = self
            .default_script
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();
        sessions.insert(
            session.to_string(),
            FakeSession {
                output,
                command: command.map(str::to_string),
                echo_input: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn send_input(&self, session: &str, text: &str) -> Result<bool, HostError> {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| HostError::SessionNotFound(session.to_string()))?;
        if entry.refuse_input {
            return Ok(false);
        }
        entry.injected.push(text.to_string());
        if entry.echo_input {
            entry.output.push_str(text);
            entry.output.push('\n');
        }
        Ok(true)
    }

    async fn read_output(&self, session: &str) -> Result<String, HostError> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(session)
            .map(|s| s.output.clone())
            .ok_or_else(|| HostError::SessionNotFound(session.to_string()))
    }

    async fn list_sessions(&self) -> Result<Vec<String>, HostError> {
        let sessions = self.sessions.lock().unwrap();
        let mut names: Vec<_> = sessions.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn kill(&self, session: &str) -> Result<(), HostError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .remove(session)
            .map(|_| ())
            .ok_or_else(|| HostError::SessionNotFound(session.to_string()))
    }

    async fn is_alive(&self, session: &str) -> Result<bool, HostError> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.contains_key(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_and_silent_sessions() {
        let host = FakeHost::new();
        host.add_session("loud", "");
        host.add_session("quiet", "");
        host.set_silent("quiet");

        assert!(host.send_input("loud", "hello").await.unwrap());
        assert!(host.send_input("quiet", "hello").await.unwrap());

        assert!(host.read_output("loud").await.unwrap().contains("hello"));
        assert!(!host.read_output("quiet").await.unwrap().contains("hello"));
        assert_eq!(host.injected("quiet"), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_kill_removes_session() {
        let host = FakeHost::new();
        host.add_session("w", "");
        host.kill("w").await.unwrap();
        assert!(!host.is_alive("w").await.unwrap());
        assert!(matches!(
            host.read_output("w").await,
            Err(HostError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_default_script_applies_to_created_sessions() {
        let host = FakeHost::new();
        host.set_default_script(&["ready", "__DONE__"]);
        host.create("fresh", Some("run-agent")).await.unwrap();
        let output = host.read_output("fresh").await.unwrap();
        assert!(output.contains("__DONE__"));
        assert_eq!(host.command_of("fresh").as_deref(), Some("run-agent"));
    }
}
