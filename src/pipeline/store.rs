// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pipeline document store.
//!
//! One pretty-printed JSON document per pipeline, keyed by pipeline id,
//! in a single directory. Documents are removed only by explicit
//! archival.

use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use super::types::Pipeline;
use crate::error::PipelineError;

/// Directory-backed store of pipeline documents.
#[derive(Debug, Clone)]
pub struct PipelineStore {
    dir: PathBuf,
}

impl PipelineStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Persist a pipeline document, creating the directory on first use.
    pub fn save(&self, pipeline: &Pipeline) -> Result<(), PipelineError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(pipeline)?;
        std::fs::write(self.path_for(pipeline.id), json)?;
        Ok(())
    }

    /// Load one pipeline by id.
    pub fn load(&self, id: Uuid) -> Result<Pipeline, PipelineError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(PipelineError::NotFound(id.to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Load every pipeline document, oldest first. Corrupt documents are
    /// skipped with a warning rather than failing the whole listing.
    pub fn load_all(&self) -> Result<Vec<Pipeline>, PipelineError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut pipelines = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Pipeline>(&content) {
                Ok(pipeline) => pipelines.push(pipeline),
                Err(err) => warn!(path = %path.display(), %err, "skipping corrupt pipeline document"),
            }
        }
        pipelines.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pipelines)
    }

    /// Remove a pipeline document.
    pub fn remove(&self, id: Uuid) -> Result<(), PipelineError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(PipelineError::NotFound(id.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::StageSpec;
    use crate::types::StageType;
    use tempfile::TempDir;

    fn sample_pipeline() -> Pipeline {
        Pipeline::new(
            "idea-1",
            &[
                StageSpec::new(StageType::Implementer, "impl"),
                StageSpec::new(StageType::Analyzer, "review"),
            ],
        )
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let store = PipelineStore::new(temp.path());

        let pipeline = sample_pipeline();
        store.save(&pipeline).unwrap();

        let loaded = store.load(pipeline.id).unwrap();
        assert_eq!(loaded.id, pipeline.id);
        assert_eq!(loaded.idea_id, "idea-1");
        assert_eq!(loaded.stages.len(), 2);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = PipelineStore::new(temp.path());
        let err = store.load(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn test_load_all_skips_corrupt_documents() {
        let temp = TempDir::new().unwrap();
        let store = PipelineStore::new(temp.path());

        store.save(&sample_pipeline()).unwrap();
        store.save(&sample_pipeline()).unwrap();
        std::fs::write(temp.path().join("broken.json"), "{nope").unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_remove() {
        let temp = TempDir::new().unwrap();
        let store = PipelineStore::new(temp.path());

        let pipeline = sample_pipeline();
        store.save(&pipeline).unwrap();
        store.remove(pipeline.id).unwrap();

        assert!(matches!(
            store.load(pipeline.id),
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            store.remove(pipeline.id),
            Err(PipelineError::NotFound(_))
        ));
    }
}
