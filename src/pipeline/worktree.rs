// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-pipeline workspace isolation.
//!
//! Each pipeline owns a git worktree for its whole lifetime; worktrees are
//! never shared across pipelines. Worktrees live in sibling directories of
//! the main repository:
//!
//! ```text
//! /project/                     # Main repo
//! /stagehand-1f2e3d4c/          # Pipeline worktree (sibling directory)
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PipelineError;

/// Prefix for worktree directories and branches.
const WORKTREE_PREFIX: &str = "stagehand-";

/// Isolated workspace provider for pipelines.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Create the pipeline's workspace and return its path.
    async fn create(&self, pipeline_id: Uuid) -> Result<PathBuf, PipelineError>;

    /// Remove the pipeline's workspace and its branch.
    async fn remove(&self, pipeline_id: Uuid) -> Result<(), PipelineError>;

    /// Whether the workspace has unmerged paths (a merge in conflict).
    async fn has_conflicts(&self, pipeline_id: Uuid) -> Result<bool, PipelineError>;

    /// Path the workspace lives (or would live) at.
    fn path_of(&self, pipeline_id: Uuid) -> PathBuf;
}

/// Git-worktree-backed workspace provider.
pub struct GitWorktrees {
    repo_root: PathBuf,
    base_branch: String,
}

impl GitWorktrees {
    pub fn new(repo_root: impl AsRef<Path>, base_branch: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.as_ref().to_path_buf(),
            base_branch: base_branch.into(),
        }
    }

    fn short(pipeline_id: Uuid) -> String {
        pipeline_id.simple().to_string()[..8].to_string()
    }

    fn branch_of(pipeline_id: Uuid) -> String {
        format!("pipeline/{}", Self::short(pipeline_id))
    }

    /// Run a git command in `dir` and return stdout.
    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, PipelineError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PipelineError::Workspace(e.to_string()))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(PipelineError::Workspace(stderr))
        }
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorktrees {
    async fn create(&self, pipeline_id: Uuid) -> Result<PathBuf, PipelineError> {
        let path = self.path_of(pipeline_id);
        let branch = Self::branch_of(pipeline_id);

        if path.exists() {
            return Err(PipelineError::Workspace(format!(
                "worktree path already exists: {}",
                path.display()
            )));
        }

        let path_str = path.to_string_lossy().to_string();
        self.git(
            &self.repo_root,
            &[
                "worktree",
                "add",
                "-b",
                &branch,
                &path_str,
                &self.base_branch,
            ],
        )
        .await?;

        info!(pipeline = %pipeline_id, path = %path.display(), %branch, "created pipeline worktree");
        Ok(path)
    }

    async fn remove(&self, pipeline_id: Uuid) -> Result<(), PipelineError> {
        let path = self.path_of(pipeline_id);
        let branch = Self::branch_of(pipeline_id);

        let path_str = path.to_string_lossy().to_string();
        self.git(&self.repo_root, &["worktree", "remove", "--force", &path_str])
            .await?;

        // The branch may already be merged or deleted; that is fine.
        if let Err(err) = self.git(&self.repo_root, &["branch", "-D", &branch]).await {
            debug!(%branch, %err, "branch cleanup skipped");
        }

        info!(pipeline = %pipeline_id, "removed pipeline worktree");
        Ok(())
    }

    async fn has_conflicts(&self, pipeline_id: Uuid) -> Result<bool, PipelineError> {
        let path = self.path_of(pipeline_id);
        if !path.exists() {
            warn!(pipeline = %pipeline_id, "conflict check on missing worktree");
            return Ok(false);
        }
        let unmerged = self.git(&path, &["ls-files", "-u"]).await?;
        Ok(!unmerged.is_empty())
    }

    fn path_of(&self, pipeline_id: Uuid) -> PathBuf {
        let parent = self
            .repo_root
            .parent()
            .unwrap_or(&self.repo_root)
            .to_path_buf();
        parent.join(format!("{}{}", WORKTREE_PREFIX, Self::short(pipeline_id)))
    }
}
