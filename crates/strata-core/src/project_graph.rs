//! Project Graph - workspace projects, external packages, typed edges
//!
//! Discovery merges three strategies (explicit config wins):
//! - project.json anywhere
//! - package.json without a project.json (fields inferred)
//! - plugin-registered path patterns supplying inferred targets
//!
//! Edges are static (manifest/import), dynamic (lazy import), or implicit
//! (declared). The graph may contain cycles; only the task graph is
//! required to be acyclic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use crate::config::{
    PackageManifest, ProjectConfig, ProjectType, TargetConfig, WorkspaceConfig,
    PACKAGE_MANIFEST_FILE, PROJECT_CONFIG_FILE, RUN_COMMANDS_EXECUTOR,
};
use crate::error::{Result, StrataError};
use crate::workspace_files::{compile_globs, matches_any, WorkspaceFiles};

/// Prefix for external (published package) node keys
pub const NPM_PREFIX: &str = "npm:";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    Static,
    Dynamic,
    Implicit,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Edge {
    #[serde(rename = "type")]
    pub edge_type: EdgeType,
    pub source: String,
    pub target: String,
}

/// A workspace project: immutable snapshot for one graph computation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectNode {
    pub name: String,
    /// Workspace-relative root directory, `/`-separated
    pub root: String,
    pub project_type: ProjectType,
    pub tags: Vec<String>,
    pub targets: HashMap<String, TargetConfig>,
    #[serde(default)]
    pub named_inputs: HashMap<String, Vec<crate::config::InputSpec>>,
    #[serde(default)]
    pub implicit_dependencies: Vec<String>,
}

/// A published package outside the workspace; participates only as a
/// hash and dependency input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalNode {
    pub package_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGraph {
    pub nodes: HashMap<String, ProjectNode>,
    pub external_nodes: HashMap<String, ExternalNode>,
    pub dependencies: HashMap<String, Vec<Edge>>,
}

impl ProjectGraph {
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name) || self.external_nodes.contains_key(name)
    }

    pub fn dependencies_of(&self, name: &str) -> &[Edge] {
        self.dependencies.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add an edge, silently dropping duplicates and dangling endpoints
    pub fn add_edge(&mut self, edge_type: EdgeType, source: &str, target: &str) {
        if source == target {
            return;
        }
        if !self.nodes.contains_key(source) || !self.contains(target) {
            tracing::debug!(source, target, "dropping edge with unknown endpoint");
            return;
        }
        let edges = self.dependencies.entry(source.to_string()).or_default();
        let edge = Edge {
            edge_type,
            source: source.to_string(),
            target: target.to_string(),
        };
        if !edges.contains(&edge) {
            edges.push(edge);
        }
    }

    /// Graph with every edge direction flipped; used by the affected
    /// resolver to walk dependents.
    pub fn reverse(&self) -> ProjectGraph {
        let mut reversed = ProjectGraph {
            nodes: self.nodes.clone(),
            external_nodes: self.external_nodes.clone(),
            dependencies: HashMap::new(),
        };
        for edges in self.dependencies.values() {
            for edge in edges {
                reversed
                    .dependencies
                    .entry(edge.target.clone())
                    .or_default()
                    .push(Edge {
                        edge_type: edge.edge_type,
                        source: edge.target.clone(),
                        target: edge.source.clone(),
                    });
            }
        }
        reversed
    }

    /// Direct internal dependencies; dynamic edges are excluded unless
    /// requested since lazy imports never force build ordering.
    pub fn internal_dependencies(&self, project: &str, include_dynamic: bool) -> Vec<&str> {
        self.dependencies_of(project)
            .iter()
            .filter(|e| include_dynamic || e.edge_type != EdgeType::Dynamic)
            .filter(|e| self.nodes.contains_key(&e.target))
            .map(|e| e.target.as_str())
            .collect()
    }

    /// Every internal project reachable from `project`, excluding itself
    pub fn transitive_internal_dependencies(&self, project: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([project]);
        while let Some(current) = queue.pop_front() {
            for edge in self.dependencies_of(current) {
                if self.nodes.contains_key(&edge.target) && seen.insert(edge.target.clone()) {
                    queue.push_back(&edge.target);
                }
            }
        }
        seen.remove(project);
        seen
    }

    /// Every external package node reachable from `project`
    pub fn transitive_external_dependencies(&self, project: &str) -> BTreeSet<String> {
        let mut external = BTreeSet::new();
        let mut internal = self.transitive_internal_dependencies(project);
        internal.insert(project.to_string());
        for name in &internal {
            for edge in self.dependencies_of(name) {
                if self.external_nodes.contains_key(&edge.target) {
                    external.insert(edge.target.clone());
                }
            }
        }
        external
    }

    pub fn project_names(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportKind {
    Static,
    Dynamic,
}

/// An import resolved to a graph node key (project name or `npm:<pkg>`)
#[derive(Debug, Clone)]
pub struct ResolvedImport {
    pub target: String,
    pub kind: ImportKind,
}

/// External collaborator resolving a file's import statements against
/// path aliases. The core only records the resulting edge type.
pub trait ModuleResolver: Send + Sync {
    fn resolve_imports(&self, project: &str, file: &str) -> Vec<ResolvedImport>;
}

/// A registered capability: claim files by pattern, infer targets as a
/// pure function of the matched file's location.
pub trait InferencePlugin: Send + Sync {
    fn pattern(&self) -> &str;
    fn infer_targets(&self, file: &str) -> Option<HashMap<String, TargetConfig>>;
}

pub struct ProjectGraphBuilder<'a> {
    workspace_root: &'a Path,
    config: &'a WorkspaceConfig,
    plugins: Vec<Box<dyn InferencePlugin>>,
    resolver: Option<Box<dyn ModuleResolver>>,
}

impl<'a> ProjectGraphBuilder<'a> {
    pub fn new(workspace_root: &'a Path, config: &'a WorkspaceConfig) -> Self {
        Self {
            workspace_root,
            config,
            plugins: Vec::new(),
            resolver: None,
        }
    }

    pub fn with_plugin(mut self, plugin: Box<dyn InferencePlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn with_resolver(mut self, resolver: Box<dyn ModuleResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn build(&self, files: &WorkspaceFiles) -> Result<ProjectGraph> {
        let mut graph = ProjectGraph::default();
        // package-manifest name -> project name, for edge resolution
        let mut package_names: HashMap<String, String> = HashMap::new();
        // project name -> manifest, kept for the edge pass
        let mut manifests: HashMap<String, PackageManifest> = HashMap::new();

        self.discover_explicit(files, &mut graph, &mut package_names, &mut manifests)?;
        self.discover_package_manifests(files, &mut graph, &mut package_names, &mut manifests)?;
        self.discover_plugin_projects(files, &mut graph)?;
        self.collect_external_nodes(&mut graph)?;
        self.connect(files, &mut graph, &package_names, &manifests);

        Ok(graph)
    }

    /// Strategy 1: explicit project.json files
    fn discover_explicit(
        &self,
        files: &WorkspaceFiles,
        graph: &mut ProjectGraph,
        package_names: &mut HashMap<String, String>,
        manifests: &mut HashMap<String, PackageManifest>,
    ) -> Result<()> {
        for file in files.files() {
            let Some(root) = project_root_of(file, PROJECT_CONFIG_FILE) else {
                continue;
            };
            let path = self.workspace_root.join(file);
            let content = std::fs::read_to_string(&path)?;
            let config: ProjectConfig = serde_json::from_str(&content)
                .map_err(|e| StrataError::Config(format!("malformed {file}: {e}")))?;

            let name = config
                .name
                .clone()
                .or_else(|| dir_name(&root))
                .ok_or_else(|| {
                    StrataError::Config(format!("project at {root} has no resolvable name"))
                })?;
            validate_targets(&name, &config.targets)?;

            if graph.nodes.contains_key(&name) {
                tracing::warn!(project = %name, root = %root, "duplicate project name, first wins");
                continue;
            }

            let project_type = config
                .project_type
                .unwrap_or_else(|| self.infer_type(&root));
            let manifest_path = self
                .workspace_root
                .join(&root)
                .join(PACKAGE_MANIFEST_FILE);
            if manifest_path.exists() {
                let manifest = PackageManifest::load(&manifest_path)?;
                if let Some(pkg) = &manifest.name {
                    package_names.entry(pkg.clone()).or_insert_with(|| name.clone());
                }
                manifests.insert(name.clone(), manifest);
            }

            graph.nodes.insert(
                name.clone(),
                ProjectNode {
                    name,
                    root,
                    project_type,
                    tags: config.tags,
                    targets: config.targets,
                    named_inputs: config.named_inputs,
                    implicit_dependencies: config.implicit_dependencies,
                },
            );
        }
        Ok(())
    }

    /// Strategy 2: package.json without a sibling project.json.
    /// Name from the manifest, root from the directory, type by location,
    /// targets from the manifest's scripts.
    fn discover_package_manifests(
        &self,
        files: &WorkspaceFiles,
        graph: &mut ProjectGraph,
        package_names: &mut HashMap<String, String>,
        manifests: &mut HashMap<String, PackageManifest>,
    ) -> Result<()> {
        let explicit_roots: BTreeSet<String> =
            graph.nodes.values().map(|n| n.root.clone()).collect();

        for file in files.files() {
            let Some(root) = project_root_of(file, PACKAGE_MANIFEST_FILE) else {
                continue;
            };
            if root.is_empty() || explicit_roots.contains(&root) {
                continue;
            }
            let manifest = PackageManifest::load(&self.workspace_root.join(file))?;
            let name = manifest
                .name
                .clone()
                .or_else(|| dir_name(&root))
                .ok_or_else(|| {
                    StrataError::Config(format!("package at {root} has no resolvable name"))
                })?;

            if graph.nodes.contains_key(&name) {
                tracing::warn!(project = %name, root = %root, "duplicate project name, first wins");
                continue;
            }

            let targets = manifest
                .scripts
                .iter()
                .map(|(script, command)| {
                    (
                        script.clone(),
                        TargetConfig {
                            executor: RUN_COMMANDS_EXECUTOR.to_string(),
                            options: serde_json::json!({ "command": command, "cwd": root }),
                            ..TargetConfig::default()
                        },
                    )
                })
                .collect();

            if let Some(pkg) = &manifest.name {
                package_names.entry(pkg.clone()).or_insert_with(|| name.clone());
            }
            manifests.insert(name.clone(), manifest);

            graph.nodes.insert(
                name.clone(),
                ProjectNode {
                    name,
                    project_type: self.infer_type(&root),
                    root,
                    tags: Vec::new(),
                    targets,
                    named_inputs: HashMap::new(),
                    implicit_dependencies: Vec::new(),
                },
            );
        }
        Ok(())
    }

    /// Strategy 3: plugin-claimed files; explicit config keeps priority,
    /// plugin targets fill gaps only.
    fn discover_plugin_projects(
        &self,
        files: &WorkspaceFiles,
        graph: &mut ProjectGraph,
    ) -> Result<()> {
        for plugin in &self.plugins {
            let patterns = compile_globs(std::slice::from_ref(&plugin.pattern().to_string()))?;
            for file in files.files() {
                if !matches_any(&patterns, file) {
                    continue;
                }
                let Some(targets) = plugin.infer_targets(file) else {
                    continue;
                };
                let root = parent_dir(file);
                let owner = graph
                    .nodes
                    .iter()
                    .find(|(_, node)| node.root == root)
                    .map(|(name, _)| name.clone());
                if let Some(name) = owner {
                    if let Some(node) = graph.nodes.get_mut(&name) {
                        for (target, config) in targets {
                            node.targets.entry(target).or_insert(config);
                        }
                    }
                    continue;
                }
                let Some(name) = dir_name(&root) else {
                    continue;
                };
                if graph.nodes.contains_key(&name) {
                    tracing::warn!(project = %name, root = %root, "duplicate project name, first wins");
                    continue;
                }
                graph.nodes.insert(
                    name.clone(),
                    ProjectNode {
                        name,
                        project_type: self.infer_type(&root),
                        root,
                        tags: Vec::new(),
                        targets,
                        named_inputs: HashMap::new(),
                        implicit_dependencies: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    /// External nodes come from the root manifest's resolved versions
    fn collect_external_nodes(&self, graph: &mut ProjectGraph) -> Result<()> {
        let root_manifest = self.workspace_root.join(PACKAGE_MANIFEST_FILE);
        if !root_manifest.exists() {
            return Ok(());
        }
        let manifest = PackageManifest::load(&root_manifest)?;
        for (package, version) in manifest
            .dependencies
            .iter()
            .chain(manifest.dev_dependencies.iter())
        {
            graph.external_nodes.insert(
                format!("{NPM_PREFIX}{package}"),
                ExternalNode {
                    package_name: package.clone(),
                    version: version.clone(),
                },
            );
        }
        Ok(())
    }

    /// Edge pass: manifest deps (static), declared implicit deps, and
    /// resolver-reported imports (static/dynamic).
    fn connect(
        &self,
        files: &WorkspaceFiles,
        graph: &mut ProjectGraph,
        package_names: &HashMap<String, String>,
        manifests: &HashMap<String, PackageManifest>,
    ) {
        let project_names: Vec<String> = graph.nodes.keys().cloned().collect();

        for project in &project_names {
            if let Some(manifest) = manifests.get(project) {
                for dep in manifest
                    .dependencies
                    .keys()
                    .chain(manifest.dev_dependencies.keys())
                {
                    if let Some(internal) = package_names.get(dep) {
                        graph.add_edge(EdgeType::Static, project, internal);
                    } else {
                        graph.add_edge(EdgeType::Static, project, &format!("{NPM_PREFIX}{dep}"));
                    }
                }
            }

            let implicit: Vec<String> = graph.nodes[project].implicit_dependencies.clone();
            for dep in implicit {
                graph.add_edge(EdgeType::Implicit, project, &dep);
            }
        }

        if let Some(resolver) = &self.resolver {
            for project in &project_names {
                let root = graph.nodes[project].root.clone();
                let project_files: Vec<String> =
                    files.files_under(&root).map(str::to_string).collect();
                for file in project_files {
                    for import in resolver.resolve_imports(project, &file) {
                        let edge_type = match import.kind {
                            ImportKind::Static => EdgeType::Static,
                            ImportKind::Dynamic => EdgeType::Dynamic,
                        };
                        graph.add_edge(edge_type, project, &import.target);
                    }
                }
            }
        }
    }

    fn infer_type(&self, root: &str) -> ProjectType {
        let apps_prefix = format!("{}/", self.config.apps_dir());
        if root.starts_with(&apps_prefix) || root == self.config.apps_dir() {
            ProjectType::Application
        } else {
            ProjectType::Library
        }
    }
}

/// `libs/a/project.json` -> `libs/a`; only matches the exact file name
fn project_root_of(file: &str, config_file: &str) -> Option<String> {
    let (dir, name) = match file.rsplit_once('/') {
        Some((dir, name)) => (dir.to_string(), name),
        None => (String::new(), file),
    };
    (name == config_file).then_some(dir)
}

fn parent_dir(file: &str) -> String {
    file.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .unwrap_or_default()
}

fn dir_name(root: &str) -> Option<String> {
    root.rsplit('/').next().filter(|s| !s.is_empty()).map(String::from)
}

fn validate_targets(project: &str, targets: &HashMap<String, TargetConfig>) -> Result<()> {
    for (target, config) in targets {
        if config.executor.is_empty() {
            return Err(StrataError::Config(format!(
                "target {project}:{target} is missing an executor"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn build_graph(root: &Path) -> ProjectGraph {
        let config = WorkspaceConfig::default();
        let files = WorkspaceFiles::discover(root).unwrap();
        ProjectGraphBuilder::new(root, &config)
            .build(&files)
            .unwrap()
    }

    #[test]
    fn discovers_explicit_and_inferred_projects() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "libs/a/project.json",
            r#"{"name": "a", "targets": {"build": {"executor": "run-commands"}}}"#,
        );
        write(
            dir.path(),
            "apps/web/package.json",
            r#"{"name": "web", "scripts": {"build": "tsc"}}"#,
        );

        let graph = build_graph(dir.path());
        assert_eq!(graph.nodes["a"].project_type, ProjectType::Library);
        assert_eq!(graph.nodes["web"].project_type, ProjectType::Application);
        assert_eq!(graph.nodes["web"].targets["build"].executor, "run-commands");
    }

    #[test]
    fn manifest_dependencies_become_static_edges() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "package.json",
            r#"{"name": "root", "dependencies": {"lodash": "4.17.21"}}"#,
        );
        write(
            dir.path(),
            "libs/a/package.json",
            r#"{"name": "@org/a", "dependencies": {"@org/b": "*", "lodash": "4.17.21"}}"#,
        );
        write(dir.path(), "libs/b/package.json", r#"{"name": "@org/b"}"#);

        let graph = build_graph(dir.path());
        let deps = graph.dependencies_of("@org/a");
        assert!(deps
            .iter()
            .any(|e| e.target == "@org/b" && e.edge_type == EdgeType::Static));
        assert!(deps.iter().any(|e| e.target == "npm:lodash"));
        assert_eq!(graph.external_nodes["npm:lodash"].version, "4.17.21");
    }

    #[test]
    fn duplicate_project_name_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "libs/a/project.json", r#"{"name": "dup"}"#);
        write(dir.path(), "libs/z/project.json", r#"{"name": "dup"}"#);

        let graph = build_graph(dir.path());
        // sorted discovery order: libs/a comes first
        assert_eq!(graph.nodes["dup"].root, "libs/a");
        assert_eq!(graph.nodes.len(), 1);
    }

    #[test]
    fn missing_executor_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "libs/a/project.json",
            r#"{"name": "a", "targets": {"build": {}}}"#,
        );
        let config = WorkspaceConfig::default();
        let files = WorkspaceFiles::discover(dir.path()).unwrap();
        let err = ProjectGraphBuilder::new(dir.path(), &config)
            .build(&files)
            .unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
    }

    #[test]
    fn implicit_dependencies_become_implicit_edges() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "libs/a/project.json",
            r#"{"name": "a", "implicitDependencies": ["b"]}"#,
        );
        write(dir.path(), "libs/b/project.json", r#"{"name": "b"}"#);

        let graph = build_graph(dir.path());
        assert_eq!(
            graph.dependencies_of("a"),
            &[Edge {
                edge_type: EdgeType::Implicit,
                source: "a".into(),
                target: "b".into()
            }]
        );
    }

    #[test]
    fn reverse_flips_edges() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "libs/a/project.json",
            r#"{"name": "a", "implicitDependencies": ["b"]}"#,
        );
        write(dir.path(), "libs/b/project.json", r#"{"name": "b"}"#);

        let reversed = build_graph(dir.path()).reverse();
        assert_eq!(reversed.dependencies_of("b")[0].target, "a");
        assert!(reversed.dependencies_of("a").is_empty());
    }

    struct FixedResolver;
    impl ModuleResolver for FixedResolver {
        fn resolve_imports(&self, _project: &str, file: &str) -> Vec<ResolvedImport> {
            if file.ends_with("main.ts") {
                vec![ResolvedImport {
                    target: "b".into(),
                    kind: ImportKind::Dynamic,
                }]
            } else {
                Vec::new()
            }
        }
    }

    #[test]
    fn resolver_imports_are_recorded_with_kind() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "libs/a/project.json", r#"{"name": "a"}"#);
        write(dir.path(), "libs/a/main.ts", "import('b')");
        write(dir.path(), "libs/b/project.json", r#"{"name": "b"}"#);

        let config = WorkspaceConfig::default();
        let files = WorkspaceFiles::discover(dir.path()).unwrap();
        let graph = ProjectGraphBuilder::new(dir.path(), &config)
            .with_resolver(Box::new(FixedResolver))
            .build(&files)
            .unwrap();

        assert_eq!(
            graph.dependencies_of("a"),
            &[Edge {
                edge_type: EdgeType::Dynamic,
                source: "a".into(),
                target: "b".into()
            }]
        );
    }
}
