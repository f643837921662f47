//! Affected-Set Resolver - minimal project set touched by changed files
//!
//! An ordered list of touched-project locators maps changed files to
//! directly-touched projects (or the "touches everything" signal). The
//! resolver then walks the reversed graph for dependents (affected) and
//! the original graph for dependencies (needed to keep the subgraph
//! runnable).

use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;

use crate::config::{WorkspaceConfig, LOCKFILE_NAMES, PACKAGE_MANIFEST_FILE, WORKSPACE_CONFIG_FILE};
use crate::error::{Result, StrataError};
use crate::project_graph::{ProjectGraph, NPM_PREFIX};

const PATH_ALIAS_CONFIG_FILE: &str = "tsconfig.base.json";

/// What one locator reports for a change set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TouchedProjects {
    Projects(BTreeSet<String>),
    /// The change cannot be scoped (e.g. the root lockfile)
    Everything,
}

impl TouchedProjects {
    fn none() -> Self {
        TouchedProjects::Projects(BTreeSet::new())
    }
}

pub struct LocatorContext<'a> {
    pub workspace_root: &'a Path,
    pub config: &'a WorkspaceConfig,
}

/// Maps changed files to directly-touched project names; each locator is
/// independent and their results are unioned.
pub trait TouchedProjectLocator: Send + Sync {
    fn name(&self) -> &'static str;
    fn locate(
        &self,
        changed: &[String],
        graph: &ProjectGraph,
        ctx: &LocatorContext,
    ) -> Result<TouchedProjects>;
}

/// The affected subgraph plus the names actually worth re-running
#[derive(Debug, Clone)]
pub struct AffectedGraph {
    pub graph: ProjectGraph,
    /// Touched projects and their transitive dependents
    pub affected: BTreeSet<String>,
}

/// Direct file ownership: the project with the longest matching root
pub struct WorkspaceFilesLocator;

impl TouchedProjectLocator for WorkspaceFilesLocator {
    fn name(&self) -> &'static str {
        "workspace-files"
    }

    fn locate(
        &self,
        changed: &[String],
        graph: &ProjectGraph,
        _ctx: &LocatorContext,
    ) -> Result<TouchedProjects> {
        let mut touched = BTreeSet::new();
        for file in changed {
            if let Some(owner) = owning_project(graph, file) {
                touched.insert(owner.to_string());
            }
        }
        Ok(TouchedProjects::Projects(touched))
    }
}

/// Workspace-level configuration and the root lockfile force everything
pub struct GlobalConfigLocator;

impl TouchedProjectLocator for GlobalConfigLocator {
    fn name(&self) -> &'static str {
        "global-config"
    }

    fn locate(
        &self,
        changed: &[String],
        _graph: &ProjectGraph,
        _ctx: &LocatorContext,
    ) -> Result<TouchedProjects> {
        let unscopable = changed.iter().any(|file| {
            file == WORKSPACE_CONFIG_FILE || LOCKFILE_NAMES.contains(&file.as_str())
        });
        if unscopable {
            Ok(TouchedProjects::Everything)
        } else {
            Ok(TouchedProjects::none())
        }
    }
}

/// Root manifest diff: external packages whose resolved version differs
/// from the graph's recorded version map to the projects depending on
/// them. An uninterpretable manifest change falls back to everything.
pub struct NpmPackagesLocator;

impl TouchedProjectLocator for NpmPackagesLocator {
    fn name(&self) -> &'static str {
        "npm-packages"
    }

    fn locate(
        &self,
        changed: &[String],
        graph: &ProjectGraph,
        ctx: &LocatorContext,
    ) -> Result<TouchedProjects> {
        if !changed.iter().any(|f| f == PACKAGE_MANIFEST_FILE) {
            return Ok(TouchedProjects::none());
        }
        let manifest_path = ctx.workspace_root.join(PACKAGE_MANIFEST_FILE);
        let manifest = match crate::config::PackageManifest::load(&manifest_path) {
            Ok(m) => m,
            Err(_) => return Ok(TouchedProjects::Everything),
        };

        let mut changed_packages = BTreeSet::new();
        let mut current: HashMap<&String, &String> = HashMap::new();
        for (package, version) in manifest
            .dependencies
            .iter()
            .chain(manifest.dev_dependencies.iter())
        {
            current.insert(package, version);
            let key = format!("{NPM_PREFIX}{package}");
            match graph.external_nodes.get(&key) {
                Some(node) if &node.version == version => {}
                // new package or version bump
                _ => {
                    changed_packages.insert(key);
                }
            }
        }
        // removals count as changes too
        for (key, node) in &graph.external_nodes {
            if !current.contains_key(&node.package_name) {
                changed_packages.insert(key.clone());
            }
        }

        let reversed = graph.reverse();
        let mut touched = BTreeSet::new();
        for package in changed_packages {
            for edge in reversed.dependencies_of(&package) {
                if graph.nodes.contains_key(&edge.target) {
                    touched.insert(edge.target.clone());
                }
            }
        }
        Ok(TouchedProjects::Projects(touched))
    }
}

/// Path-alias config change: the projects owning alias targets
pub struct PathAliasLocator;

impl TouchedProjectLocator for PathAliasLocator {
    fn name(&self) -> &'static str {
        "path-aliases"
    }

    fn locate(
        &self,
        changed: &[String],
        graph: &ProjectGraph,
        ctx: &LocatorContext,
    ) -> Result<TouchedProjects> {
        if !changed.iter().any(|f| f == PATH_ALIAS_CONFIG_FILE) {
            return Ok(TouchedProjects::none());
        }
        let path = ctx.workspace_root.join(PATH_ALIAS_CONFIG_FILE);
        let parsed: Option<Value> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok());
        let Some(parsed) = parsed else {
            // deleted or unparseable alias config cannot be scoped
            return Ok(TouchedProjects::Everything);
        };

        let mut touched = BTreeSet::new();
        let paths = parsed
            .pointer("/compilerOptions/paths")
            .and_then(Value::as_object);
        let Some(paths) = paths else {
            return Ok(TouchedProjects::Everything);
        };
        for targets in paths.values() {
            let Some(targets) = targets.as_array() else {
                continue;
            };
            for target in targets.iter().filter_map(Value::as_str) {
                if let Some(owner) = owning_project(graph, target) {
                    touched.insert(owner.to_string());
                }
            }
        }
        Ok(TouchedProjects::Projects(touched))
    }
}

pub fn default_locators() -> Vec<Box<dyn TouchedProjectLocator>> {
    vec![
        Box::new(WorkspaceFilesLocator),
        Box::new(GlobalConfigLocator),
        Box::new(NpmPackagesLocator),
        Box::new(PathAliasLocator),
    ]
}

/// Filter the graph down to what a change set can influence.
///
/// Dependents of touched projects are marked affected; dependencies of
/// touched projects ride along unmarked so the subgraph stays valid.
pub fn affected(
    graph: &ProjectGraph,
    changed_files: &[String],
    ctx: &LocatorContext,
    locators: &[Box<dyn TouchedProjectLocator>],
) -> Result<AffectedGraph> {
    let mut touched: BTreeSet<String> = BTreeSet::new();
    for locator in locators {
        match locator.locate(changed_files, graph, ctx)? {
            TouchedProjects::Everything => {
                tracing::debug!(locator = locator.name(), "change touches every project");
                touched.extend(graph.project_names());
            }
            TouchedProjects::Projects(projects) => touched.extend(projects),
        }
    }

    for name in &touched {
        if !graph.contains(name) {
            return Err(StrataError::UnknownProject(name.clone()));
        }
    }

    let reversed = graph.reverse();
    let mut affected_names: BTreeSet<String> = BTreeSet::new();
    for name in &touched {
        walk(&reversed, name, &mut affected_names);
    }
    // keep only internal projects in the runnable set
    affected_names.retain(|name| graph.nodes.contains_key(name));

    let mut included: BTreeSet<String> = affected_names.clone();
    for name in &touched {
        walk(graph, name, &mut included);
    }

    let mut result = ProjectGraph::default();
    for name in &included {
        if let Some(node) = graph.nodes.get(name) {
            result.nodes.insert(name.clone(), node.clone());
        } else if let Some(node) = graph.external_nodes.get(name) {
            result.external_nodes.insert(name.clone(), node.clone());
        }
    }
    for name in &included {
        for edge in graph.dependencies_of(name) {
            if included.contains(&edge.target) {
                result
                    .dependencies
                    .entry(name.clone())
                    .or_default()
                    .push(edge.clone());
            }
        }
    }

    Ok(AffectedGraph {
        graph: result,
        affected: affected_names,
    })
}

/// BFS from `start`, inserting every visited node (including start)
fn walk(graph: &ProjectGraph, start: &str, visited: &mut BTreeSet<String>) {
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(current) = queue.pop_front() {
        if !visited.insert(current.clone()) {
            continue;
        }
        for edge in graph.dependencies_of(&current) {
            if !visited.contains(&edge.target) {
                queue.push_back(edge.target.clone());
            }
        }
    }
}

fn owning_project<'a>(graph: &'a ProjectGraph, file: &str) -> Option<&'a str> {
    graph
        .nodes
        .values()
        .filter(|node| {
            !node.root.is_empty()
                && (file.starts_with(&format!("{}/", node.root)) || file == node.root)
        })
        .max_by_key(|node| node.root.len())
        .map(|node| node.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectType;
    use crate::project_graph::{EdgeType, ExternalNode, ProjectNode};
    use std::collections::HashMap;

    fn node(name: &str, root: &str) -> ProjectNode {
        ProjectNode {
            name: name.into(),
            root: root.into(),
            project_type: ProjectType::Library,
            tags: Vec::new(),
            targets: HashMap::new(),
            named_inputs: HashMap::new(),
            implicit_dependencies: Vec::new(),
        }
    }

    /// parent -> child -> leaf, plus a detached project
    fn fixture() -> ProjectGraph {
        let mut graph = ProjectGraph::default();
        for (name, root) in [
            ("parent", "libs/parent"),
            ("child", "libs/child"),
            ("leaf", "libs/leaf"),
            ("detached", "libs/detached"),
        ] {
            graph.nodes.insert(name.into(), node(name, root));
        }
        graph.add_edge(EdgeType::Static, "parent", "child");
        graph.add_edge(EdgeType::Static, "child", "leaf");
        graph
    }

    fn run(graph: &ProjectGraph, changed: &[&str]) -> AffectedGraph {
        let config = WorkspaceConfig::default();
        let ctx = LocatorContext {
            workspace_root: Path::new("/nonexistent"),
            config: &config,
        };
        let changed: Vec<String> = changed.iter().map(|s| s.to_string()).collect();
        affected(graph, &changed, &ctx, &default_locators()).unwrap()
    }

    #[test]
    fn no_changes_affect_nothing() {
        let result = run(&fixture(), &[]);
        assert!(result.affected.is_empty());
        assert!(result.graph.nodes.is_empty());
    }

    #[test]
    fn leaf_change_affects_dependents_and_keeps_dependencies() {
        let result = run(&fixture(), &["libs/child/src/index.ts"]);

        // child itself and its dependent are affected
        assert_eq!(
            result.affected,
            BTreeSet::from(["child".to_string(), "parent".to_string()])
        );
        // leaf rides along for a runnable subgraph but is not affected
        assert!(result.graph.nodes.contains_key("leaf"));
        assert!(!result.affected.contains("leaf"));
        assert!(!result.graph.nodes.contains_key("detached"));
    }

    #[test]
    fn edges_are_restricted_to_the_subgraph() {
        let result = run(&fixture(), &["libs/leaf/file.ts"]);
        for edges in result.graph.dependencies.values() {
            for edge in edges {
                assert!(result.graph.contains(&edge.source));
                assert!(result.graph.contains(&edge.target));
            }
        }
    }

    #[test]
    fn lockfile_touches_everything() {
        let result = run(&fixture(), &["package-lock.json"]);
        assert_eq!(result.affected.len(), 4);
    }

    #[test]
    fn unknown_project_from_locator_is_fatal() {
        struct BadLocator;
        impl TouchedProjectLocator for BadLocator {
            fn name(&self) -> &'static str {
                "bad"
            }
            fn locate(
                &self,
                _changed: &[String],
                _graph: &ProjectGraph,
                _ctx: &LocatorContext,
            ) -> Result<TouchedProjects> {
                Ok(TouchedProjects::Projects(BTreeSet::from(["ghost".into()])))
            }
        }

        let graph = fixture();
        let config = WorkspaceConfig::default();
        let ctx = LocatorContext {
            workspace_root: Path::new("/nonexistent"),
            config: &config,
        };
        let locators: Vec<Box<dyn TouchedProjectLocator>> = vec![Box::new(BadLocator)];
        let err = affected(&graph, &["x".into()], &ctx, &locators).unwrap_err();
        assert!(matches!(err, StrataError::UnknownProject(name) if name == "ghost"));
    }

    #[test]
    fn version_bump_touches_dependents_of_package() {
        let mut graph = fixture();
        graph.external_nodes.insert(
            "npm:lodash".into(),
            ExternalNode {
                package_name: "lodash".into(),
                version: "4.17.20".into(),
            },
        );
        graph.add_edge(EdgeType::Static, "leaf", "npm:lodash");

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(PACKAGE_MANIFEST_FILE),
            r#"{"dependencies": {"lodash": "4.17.21"}}"#,
        )
        .unwrap();

        let config = WorkspaceConfig::default();
        let ctx = LocatorContext {
            workspace_root: dir.path(),
            config: &config,
        };
        let result = affected(
            &graph,
            &[PACKAGE_MANIFEST_FILE.to_string()],
            &ctx,
            &default_locators(),
        )
        .unwrap();

        // leaf depends on the bumped package; its dependents follow
        assert!(result.affected.contains("leaf"));
        assert!(result.affected.contains("child"));
        assert!(result.affected.contains("parent"));
        assert!(!result.affected.contains("detached"));
    }
}
