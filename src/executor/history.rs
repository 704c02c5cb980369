// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only run history.
//!
//! One JSON-lines file per agent under the runs directory. Records are
//! only ever appended; corrupt lines are skipped on read so one bad write
//! cannot poison an agent's whole history.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ExecutorError;
use crate::types::{RunRecord, RunStatus};

/// Aggregated health view of one agent's run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent: String,
    pub total_runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_duration_ms: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Append-only per-agent run log.
#[derive(Debug, Clone)]
pub struct RunHistory {
    dir: PathBuf,
}

impl RunHistory {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, agent: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", agent))
    }

    /// Append a record to the agent's log.
    pub fn append(&self, record: &RunRecord) -> Result<(), ExecutorError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| ExecutorError::History(e.to_string()))?;
        let line =
            serde_json::to_string(record).map_err(|e| ExecutorError::History(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&record.agent))
            .map_err(|e| ExecutorError::History(e.to_string()))?;
        writeln!(file, "{}", line).map_err(|e| ExecutorError::History(e.to_string()))?;
        Ok(())
    }

    /// All records for an agent, oldest first.
    pub fn load(&self, agent: &str) -> Result<Vec<RunRecord>, ExecutorError> {
        let path = self.path_for(agent);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content =
            std::fs::read_to_string(&path).map_err(|e| ExecutorError::History(e.to_string()))?;
        let mut records = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(agent, %err, "skipping corrupt run history line"),
            }
        }
        Ok(records)
    }

    /// The most recent record for an agent, if any.
    pub fn last(&self, agent: &str) -> Result<Option<RunRecord>, ExecutorError> {
        Ok(self.load(agent)?.into_iter().last())
    }

    /// Aggregate stats for an agent.
    pub fn stats(&self, agent: &str) -> Result<AgentStats, ExecutorError> {
        let records = self.load(agent)?;
        let total_runs = records.len() as u64;
        let succeeded = records.iter().filter(|r| r.succeeded()).count() as u64;
        let cancelled = records
            .iter()
            .filter(|r| r.status == RunStatus::Cancelled)
            .count() as u64;
        let failed = total_runs - succeeded - cancelled;
        let avg_duration_ms = if records.is_empty() {
            0
        } else {
            records.iter().map(|r| r.duration_ms).sum::<u64>() / total_runs
        };
        Ok(AgentStats {
            agent: agent.to_string(),
            total_runs,
            succeeded,
            failed,
            cancelled,
            avg_duration_ms,
            last_run_at: records.last().map(|r| r.started_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalOrigin;
    use tempfile::TempDir;

    fn record(agent: &str, status: RunStatus, exit_code: Option<i32>, ms: u64) -> RunRecord {
        RunRecord {
            run_id: uuid::Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            status,
            exit_code,
            started_at: Utc::now(),
            duration_ms: ms,
            cost: 0.0,
            origin: SignalOrigin::Manual,
            pipeline: None,
        }
    }

    #[test]
    fn test_append_and_load() {
        let temp = TempDir::new().unwrap();
        let history = RunHistory::new(temp.path());

        history
            .append(&record("impl", RunStatus::Exited, Some(0), 100))
            .unwrap();
        history
            .append(&record("impl", RunStatus::Exited, Some(1), 300))
            .unwrap();

        let records = history.load("impl").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].exit_code, Some(1));
        assert!(history.load("other").unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let temp = TempDir::new().unwrap();
        let history = RunHistory::new(temp.path());

        history
            .append(&record("impl", RunStatus::Exited, Some(0), 100))
            .unwrap();
        history
            .append(&record("impl", RunStatus::Exited, Some(2), 200))
            .unwrap();
        history
            .append(&record("impl", RunStatus::Cancelled, None, 300))
            .unwrap();

        let stats = history.stats("impl").unwrap();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.avg_duration_ms, 200);
        assert!(stats.last_run_at.is_some());
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let temp = TempDir::new().unwrap();
        let history = RunHistory::new(temp.path());
        history
            .append(&record("impl", RunStatus::Exited, Some(0), 10))
            .unwrap();

        let path = temp.path().join("impl.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        history
            .append(&record("impl", RunStatus::Exited, Some(0), 20))
            .unwrap();
        assert_eq!(history.load("impl").unwrap().len(), 2);
    }
}
