//! Task Hasher - deterministic BLAKE3 cache keys
//!
//! A task hash is a pure function of: the project's resolved input
//! filesets, each dependency's production fileset, declared env vars,
//! global configuration files, the merged option blob, and reachable
//! external package versions. File hashing is batched and parallelized
//! with Rayon; batch size never influences the result.

use blake3::Hasher as Blake3Hasher;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use crate::config::{InputSpec, WorkspaceConfig, PACKAGE_MANIFEST_FILE, WORKSPACE_CONFIG_FILE};
use crate::error::Result;
use crate::project_graph::ProjectGraph;
use crate::task_graph::Task;
use crate::workspace_files::{interpolate_tokens, WorkspaceFiles};

/// Files per hashing batch; short command-line platforms get a smaller one
const HASH_BATCH_SIZE: usize = if cfg!(windows) { 500 } else { 4000 };

/// Sentinel contributed by a listed-but-deleted file; its removal is
/// itself a change and must not throw.
const DELETED_FILE_HASH: &str = "deleted";

const DEFAULT_FILESET: &str = "default";
const PRODUCTION_FILESET: &str = "production";

pub struct TaskHasher<'a> {
    workspace_root: &'a Path,
    graph: &'a ProjectGraph,
    config: &'a WorkspaceConfig,
    files: &'a WorkspaceFiles,
    file_hashes: Mutex<HashMap<String, String>>,
    fileset_hashes: Mutex<HashMap<(String, String), String>>,
}

impl<'a> TaskHasher<'a> {
    pub fn new(
        workspace_root: &'a Path,
        graph: &'a ProjectGraph,
        config: &'a WorkspaceConfig,
        files: &'a WorkspaceFiles,
    ) -> Self {
        Self {
            workspace_root,
            graph,
            config,
            files,
            file_hashes: Mutex::new(HashMap::new()),
            fileset_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Identical filesystem state and options produce an identical hash,
    /// independent of path separator style or batch size.
    pub fn hash_task(&self, task: &Task) -> Result<String> {
        let mut lines: Vec<String> = Vec::new();
        lines.push(format!("task:{}", task.id));
        lines.push(format!("executor:{}", task.executor));
        lines.push(format!(
            "options:{}",
            hash_text(&serde_json::to_string(&task.options)?)
        ));

        let inputs = self.inputs_for(task);
        let mut self_globs: Vec<String> = Vec::new();
        let mut dep_filesets: Vec<String> = Vec::new();
        let mut env_lines: Vec<String> = Vec::new();

        for input in &inputs {
            match input {
                InputSpec::Env { env } => {
                    let value = std::env::var(env).unwrap_or_default();
                    env_lines.push(format!("env:{env}={}", hash_text(&value)));
                }
                InputSpec::Source(source) => {
                    if let Some(fileset) = source.strip_prefix('^') {
                        dep_filesets.push(fileset.to_string());
                    } else {
                        self.expand_source(&task.project, source, &mut self_globs);
                    }
                }
            }
        }

        let matched = self.files.matching(&self_globs)?;
        lines.push(format!(
            "inputs:{}={}",
            task.project_root,
            self.hash_file_list(&matched)
        ));

        dep_filesets.sort();
        dep_filesets.dedup();
        for fileset in &dep_filesets {
            for dep in self.graph.transitive_internal_dependencies(&task.project) {
                lines.push(format!(
                    "dep:{dep}:{fileset}={}",
                    self.project_fileset_hash(&dep, fileset)?
                ));
            }
        }

        env_lines.sort();
        lines.extend(env_lines);

        for global in [WORKSPACE_CONFIG_FILE, PACKAGE_MANIFEST_FILE] {
            lines.push(format!("global:{global}={}", self.hash_one(global)));
        }

        for external in self.graph.transitive_external_dependencies(&task.project) {
            let version = &self.graph.external_nodes[&external].version;
            lines.push(format!("external:{external}@{version}"));
        }

        let mut hasher = Blake3Hasher::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// The target's declared inputs, or the conventional
    /// `["default", "^production"]` when it declares none.
    fn inputs_for(&self, task: &Task) -> Vec<InputSpec> {
        let declared = &self.graph.nodes[&task.project].targets[&task.target].inputs;
        if declared.is_empty() {
            vec![
                InputSpec::Source(DEFAULT_FILESET.into()),
                InputSpec::Source(format!("^{PRODUCTION_FILESET}")),
            ]
        } else {
            declared.clone()
        }
    }

    /// A named-input reference expands recursively; anything else is a glob
    fn expand_source(&self, project: &str, source: &str, globs: &mut Vec<String>) {
        self.expand_source_guarded(project, source, globs, &mut Vec::new());
    }

    fn expand_source_guarded(
        &self,
        project: &str,
        source: &str,
        globs: &mut Vec<String>,
        seen: &mut Vec<String>,
    ) {
        if seen.iter().any(|s| s == source) {
            return;
        }
        let node = &self.graph.nodes[project];
        let named = node
            .named_inputs
            .get(source)
            .or_else(|| self.config.named_inputs.get(source));

        match named {
            Some(specs) => {
                seen.push(source.to_string());
                for spec in specs {
                    if let InputSpec::Source(inner) = spec {
                        // dependency-prefixed refs are meaningless inside a
                        // self expansion
                        if !inner.starts_with('^') {
                            self.expand_source_guarded(project, inner, globs, seen);
                        }
                    }
                }
            }
            None if source == DEFAULT_FILESET => {
                globs.push(format!("{}/**/*", node.root));
            }
            None if source == PRODUCTION_FILESET => {
                self.expand_source_guarded(project, DEFAULT_FILESET, globs, seen);
            }
            None => {
                globs.push(interpolate_tokens(source, &node.root));
            }
        }
    }

    /// Hash of one project's named fileset, memoized per graph lifetime
    fn project_fileset_hash(&self, project: &str, fileset: &str) -> Result<String> {
        let key = (project.to_string(), fileset.to_string());
        if let Some(hash) = self.fileset_hashes.lock().unwrap().get(&key) {
            return Ok(hash.clone());
        }

        let mut globs = Vec::new();
        self.expand_source(project, fileset, &mut globs);
        let matched = self.files.matching(&globs)?;
        let hash = self.hash_file_list(&matched);

        self.fileset_hashes
            .lock()
            .unwrap()
            .insert(key, hash.clone());
        Ok(hash)
    }

    /// Combine (path, content-hash) pairs in path order
    fn hash_file_list(&self, files: &[String]) -> String {
        let pairs = self.hash_files(files);
        let mut hasher = Blake3Hasher::new();
        for (path, hash) in pairs {
            hasher.update(path.as_bytes());
            hasher.update(b"=");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Content hashes for workspace-relative paths, batched and memoized.
    /// Results come from a sorted merge, so batch boundaries never leak
    /// into downstream hashes.
    fn hash_files(&self, files: &[String]) -> Vec<(String, String)> {
        let missing: Vec<String> = {
            let cache = self.file_hashes.lock().unwrap();
            files
                .iter()
                .filter(|f| !cache.contains_key(*f))
                .cloned()
                .collect()
        };

        if !missing.is_empty() {
            let hashed: Vec<(String, String)> = missing
                .par_chunks(HASH_BATCH_SIZE)
                .flat_map(|batch| {
                    batch
                        .iter()
                        .map(|path| (path.clone(), self.hash_one(path)))
                        .collect::<Vec<_>>()
                })
                .collect();
            let mut cache = self.file_hashes.lock().unwrap();
            for (path, hash) in hashed {
                cache.insert(path, hash);
            }
        }

        let cache = self.file_hashes.lock().unwrap();
        let merged: BTreeMap<String, String> = files
            .iter()
            .filter_map(|f| cache.get(f).map(|h| (f.clone(), h.clone())))
            .collect();
        merged.into_iter().collect()
    }

    fn hash_one(&self, relative: &str) -> String {
        match std::fs::read(self.workspace_root.join(relative)) {
            Ok(content) => blake3::hash(&content).to_hex().to_string(),
            Err(_) => DELETED_FILE_HASH.to_string(),
        }
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}
