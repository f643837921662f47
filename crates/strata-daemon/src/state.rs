//! Daemon State - warm project graph and outputs-hash bookkeeping
//!
//! The graph is rebuilt lazily when the watcher has flagged changes.
//! Outputs-hash records persist to sled so a daemon restart keeps the
//! bookkeeping that lets repeated invocations skip disk re-hashing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use strata_core::cache::outputs_key;
use strata_core::config::WorkspaceConfig;
use strata_core::project_graph::{ProjectGraph, ProjectGraphBuilder};
use strata_core::workspace_files::WorkspaceFiles;

use crate::error::{DaemonError, Result};

pub struct DaemonState {
    workspace_root: PathBuf,
    graph: Option<ProjectGraph>,
    dirty: bool,
    outputs_hashes: HashMap<String, String>,
    db: sled::Db,
}

impl DaemonState {
    pub fn new(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        let db_path = workspace_root.join(".strata").join("daemon.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(&db_path)?;

        let mut outputs_hashes = HashMap::new();
        for item in db.iter() {
            let (key, value) = item?;
            outputs_hashes.insert(
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        tracing::info!(records = outputs_hashes.len(), "loaded outputs-hash records");

        Ok(Self {
            workspace_root,
            graph: None,
            dirty: true,
            outputs_hashes,
            db,
        })
    }

    /// The warm graph, rebuilding first when watched files changed
    pub fn project_graph(&mut self) -> Result<&ProjectGraph> {
        if self.dirty || self.graph.is_none() {
            self.rebuild()?;
        }
        self.graph
            .as_ref()
            .ok_or_else(|| DaemonError::State("project graph unavailable".into()))
    }

    pub fn rebuild(&mut self) -> Result<()> {
        let start = Instant::now();
        let config = WorkspaceConfig::load(&self.workspace_root)?;
        let files = WorkspaceFiles::discover(&self.workspace_root)?;
        let graph = ProjectGraphBuilder::new(&self.workspace_root, &config).build(&files)?;
        tracing::info!(
            projects = graph.nodes.len(),
            elapsed = ?start.elapsed(),
            "project graph rebuilt"
        );
        self.graph = Some(graph);
        self.dirty = false;
        Ok(())
    }

    /// Called by the watcher; the next graph request rebuilds
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn record_outputs_hash(&mut self, outputs: &[String], hash: &str) -> Result<()> {
        let key = outputs_key(outputs);
        self.db.insert(key.as_bytes(), hash.as_bytes())?;
        self.db.flush()?;
        self.outputs_hashes.insert(key, hash.to_string());
        Ok(())
    }

    pub fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> bool {
        self.outputs_hashes
            .get(&outputs_key(outputs))
            .is_some_and(|recorded| recorded == hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn records_survive_a_state_reload() {
        let dir = tempfile::tempdir().unwrap();
        let outputs = vec!["dist/lib".to_string()];
        {
            let mut state = DaemonState::new(dir.path()).unwrap();
            state.record_outputs_hash(&outputs, "abc").unwrap();
            assert!(state.outputs_hashes_match(&outputs, "abc"));
        }
        let state = DaemonState::new(dir.path()).unwrap();
        assert!(state.outputs_hashes_match(&outputs, "abc"));
        assert!(!state.outputs_hashes_match(&outputs, "other"));
    }

    #[test]
    fn graph_rebuilds_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("libs/a")).unwrap();
        fs::write(dir.path().join("libs/a/project.json"), r#"{"name": "a"}"#).unwrap();

        let mut state = DaemonState::new(dir.path()).unwrap();
        assert!(state.project_graph().unwrap().nodes.contains_key("a"));
        assert!(!state.is_dirty());

        // a new project appears, but the state was not invalidated
        fs::create_dir_all(dir.path().join("libs/b")).unwrap();
        fs::write(dir.path().join("libs/b/project.json"), r#"{"name": "b"}"#).unwrap();
        assert!(!state.project_graph().unwrap().nodes.contains_key("b"));

        state.mark_dirty();
        assert!(state.project_graph().unwrap().nodes.contains_key("b"));
    }
}
