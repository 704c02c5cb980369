// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Session host abstraction.
//!
//! A session host is a persistent interactive process environment that
//! agents run inside, addressable by session name. The production
//! implementation is [`TmuxHost`], backed by the `tmux` binary; tests use
//! the in-memory [`fake::FakeHost`].
//!
//! Both the executor (spawning agent processes) and the messaging layer
//! (injecting text into running sessions) sit on top of this trait and
//! nothing else.

pub mod tmux;

#[cfg(test)]
pub mod fake;

use async_trait::async_trait;

use crate::error::HostError;

pub use tmux::TmuxHost;

/// Boundary to the operating environment hosting agent sessions.
#[async_trait]
pub trait SessionHost: Send + Sync {
    /// Create a detached session, optionally running `command` in it.
    async fn create(&self, session: &str, command: Option<&str>) -> Result<(), HostError>;

    /// Type `text` into the session followed by a newline.
    ///
    /// Returns `false` when the host accepted the call but the session
    /// refused the input.
    async fn send_input(&self, session: &str, text: &str) -> Result<bool, HostError>;

    /// Capture the session's currently visible output.
    async fn read_output(&self, session: &str) -> Result<String, HostError>;

    /// Names of all live sessions.
    async fn list_sessions(&self) -> Result<Vec<String>, HostError>;

    /// Terminate a session and the process inside it.
    async fn kill(&self, session: &str) -> Result<(), HostError>;

    /// Whether the session still exists.
    async fn is_alive(&self, session: &str) -> Result<bool, HostError>;
}
