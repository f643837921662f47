//! Task Graph Builder - expand targets over projects into a task DAG
//!
//! `dependsOn` rules are expanded recursively: `^target` schedules the
//! same target on every static/implicit dependency first (dynamic edges
//! never force ordering), plain `target` schedules a sibling target on
//! the same project. Expansion is memoized per
//! (project, target, configuration); revisiting a node on the current
//! path is a fatal cycle unless tolerated, in which case the closing
//! edge is dropped with a warning.

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::config::{DependencyScope, TargetConfig, WorkspaceConfig};
use crate::error::{Result, StrataError};
use crate::project_graph::ProjectGraph;
use crate::workspace_files::interpolate_tokens;

/// One concrete (project, target, configuration) invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project: String,
    pub target: String,
    pub configuration: Option<String>,
    pub executor: String,
    /// Base options ⊕ configuration overlay ⊕ caller overrides
    pub options: Value,
    /// Caller-supplied overrides, kept separately for hashing
    pub overrides: Value,
    /// Output globs with tokens resolved to concrete workspace paths
    pub outputs: Vec<String>,
    pub project_root: String,
    pub cacheable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskGraph {
    pub tasks: HashMap<String, Task>,
    pub dependencies: HashMap<String, Vec<String>>,
    pub roots: Vec<String>,
}

impl TaskGraph {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn dependencies_of(&self, task_id: &str) -> &[String] {
        self.dependencies
            .get(task_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Dependencies-first order; ties broken lexicographically. Tasks
    /// stuck behind a pruned cycle are appended at the end.
    pub fn topological_order(&self) -> Vec<String> {
        let mut remaining: HashMap<&str, usize> = self
            .tasks
            .keys()
            .map(|id| (id.as_str(), self.dependencies_of(id).len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for (task, deps) in &self.dependencies {
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(task.as_str());
            }
        }

        let mut ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = ready.first().copied() {
            ready.remove(0);
            remaining.remove(id);
            order.push(id.to_string());
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        let pos = ready.binary_search(dependent).unwrap_or_else(|p| p);
                        ready.insert(pos, *dependent);
                    }
                }
            }
        }
        let mut stuck: Vec<String> = remaining.keys().map(|s| s.to_string()).collect();
        stuck.sort();
        order.extend(stuck);
        order
    }
}

pub fn task_id(project: &str, target: &str, configuration: Option<&str>) -> String {
    match configuration {
        Some(config) => format!("{project}:{target}:{config}"),
        None => format!("{project}:{target}"),
    }
}

pub struct TaskGraphBuilder<'a> {
    graph: &'a ProjectGraph,
    config: &'a WorkspaceConfig,
    ignore_cycles: bool,
}

struct Expansion<'a> {
    overrides: &'a Value,
    tasks: HashMap<String, Task>,
    dependencies: HashMap<String, Vec<String>>,
    /// (project, target, configuration) -> task id
    memo: HashMap<(String, String, Option<String>), String>,
    /// project:target keys on the current DFS path
    path: Vec<String>,
}

impl<'a> TaskGraphBuilder<'a> {
    pub fn new(graph: &'a ProjectGraph, config: &'a WorkspaceConfig) -> Self {
        Self {
            graph,
            config,
            ignore_cycles: false,
        }
    }

    pub fn ignore_cycles(mut self, enabled: bool) -> Self {
        self.ignore_cycles = enabled;
        self
    }

    /// Expand the requested targets across the project subset into a DAG.
    /// Projects not defining a requested target are skipped silently.
    pub fn build(
        &self,
        targets: &[String],
        projects: &[String],
        configuration: Option<&str>,
        overrides: &Value,
    ) -> Result<TaskGraph> {
        let mut expansion = Expansion {
            overrides,
            tasks: HashMap::new(),
            dependencies: HashMap::new(),
            memo: HashMap::new(),
            path: Vec::new(),
        };

        for project in projects {
            if !self.graph.nodes.contains_key(project) {
                return Err(StrataError::UnknownProject(project.clone()));
            }
            for target in targets {
                if self.graph.nodes[project].targets.contains_key(target) {
                    self.process_task(project, target, configuration, &mut expansion)?;
                }
            }
        }

        let mut graph = TaskGraph {
            roots: compute_roots(&expansion.tasks, &expansion.dependencies),
            tasks: expansion.tasks,
            dependencies: expansion.dependencies,
        };
        graph.roots.sort();

        if !self.ignore_cycles {
            verify_acyclic(&graph)?;
        }
        Ok(graph)
    }

    /// Returns the task id, or None when a tolerated cycle dropped the edge
    fn process_task(
        &self,
        project: &str,
        target: &str,
        configuration: Option<&str>,
        expansion: &mut Expansion,
    ) -> Result<Option<String>> {
        let node = &self.graph.nodes[project];
        let target_config = &node.targets[target];
        let resolved_config = resolve_configuration(target_config, configuration);

        let path_key = format!("{project}:{target}");
        if expansion.path.contains(&path_key) {
            let mut cycle = expansion.path.clone();
            cycle.push(path_key.clone());
            if self.ignore_cycles {
                tracing::warn!(
                    cycle = %cycle.join(" -> "),
                    "dropping cyclic task dependency"
                );
                return Ok(None);
            }
            return Err(StrataError::Cycle { path: cycle });
        }

        let memo_key = (
            project.to_string(),
            target.to_string(),
            resolved_config.clone(),
        );
        if let Some(id) = expansion.memo.get(&memo_key) {
            return Ok(Some(id.clone()));
        }

        let id = task_id(project, target, resolved_config.as_deref());
        expansion.memo.insert(memo_key, id.clone());
        expansion.tasks.insert(
            id.clone(),
            self.create_task(&id, project, target, target_config, resolved_config.as_deref(), expansion.overrides),
        );
        expansion.dependencies.entry(id.clone()).or_default();

        expansion.path.push(path_key);
        let mut dep_ids: Vec<String> = Vec::new();
        for rule in &target_config.depends_on {
            let (scope, dep_target) = rule.scope_and_target();
            match scope {
                DependencyScope::Dependencies => {
                    for dep in self.graph.internal_dependencies(project, false) {
                        if !self.graph.nodes[dep].targets.contains_key(dep_target) {
                            continue;
                        }
                        if let Some(dep_id) = self.process_task(
                            dep,
                            dep_target,
                            resolved_config.as_deref(),
                            expansion,
                        )? {
                            dep_ids.push(dep_id);
                        }
                    }
                }
                DependencyScope::OwnProject => {
                    if node.targets.contains_key(dep_target) && dep_target != target {
                        if let Some(dep_id) = self.process_task(
                            project,
                            dep_target,
                            resolved_config.as_deref(),
                            expansion,
                        )? {
                            dep_ids.push(dep_id);
                        }
                    }
                }
            }
        }
        expansion.path.pop();

        let entry = expansion.dependencies.entry(id.clone()).or_default();
        for dep_id in dep_ids {
            if !entry.contains(&dep_id) {
                entry.push(dep_id);
            }
        }
        entry.sort();

        Ok(Some(id))
    }

    fn create_task(
        &self,
        id: &str,
        project: &str,
        target: &str,
        target_config: &TargetConfig,
        configuration: Option<&str>,
        overrides: &Value,
    ) -> Task {
        let node = &self.graph.nodes[project];

        let mut options = target_config.options.clone();
        if let Some(config) = configuration {
            if let Some(overlay) = target_config.configurations.get(config) {
                options = merge_options(&options, overlay);
            }
        }
        options = merge_options(&options, overrides);

        let outputs = target_config
            .outputs
            .iter()
            .map(|pattern| resolve_output(pattern, &node.root, &options))
            .collect();

        Task {
            id: id.to_string(),
            project: project.to_string(),
            target: target.to_string(),
            configuration: configuration.map(String::from),
            executor: target_config.executor.clone(),
            options,
            overrides: overrides.clone(),
            outputs,
            project_root: node.root.clone(),
            cacheable: self.config.is_cacheable(target),
        }
    }
}

/// The requested configuration wins when the target defines it; otherwise
/// the target's defaultConfiguration applies.
fn resolve_configuration(target: &TargetConfig, requested: Option<&str>) -> Option<String> {
    match requested {
        Some(config) if target.configurations.contains_key(config) => Some(config.to_string()),
        _ => target
            .default_configuration
            .clone()
            .filter(|c| target.configurations.contains_key(c)),
    }
}

/// Shallow object merge; overlay keys win, null overlay is a no-op
fn merge_options(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in overlay_map {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => base.clone(),
        _ => overlay.clone(),
    }
}

/// Resolve `{projectRoot}`, `{workspaceRoot}` and `{options.key}` tokens
fn resolve_output(pattern: &str, project_root: &str, options: &Value) -> String {
    let mut resolved = interpolate_tokens(pattern, project_root);
    while let Some(start) = resolved.find("{options.") {
        let Some(end) = resolved[start..].find('}') else {
            break;
        };
        let key = &resolved[start + "{options.".len()..start + end];
        let replacement = options
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        resolved.replace_range(start..start + end + 1, &replacement);
    }
    resolved
}

fn compute_roots(
    tasks: &HashMap<String, Task>,
    dependencies: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    tasks
        .keys()
        .filter(|id| dependencies.get(*id).map(Vec::is_empty).unwrap_or(true))
        .cloned()
        .collect()
}

/// Defense for the acyclicity invariant; the DFS path check should have
/// already rejected any cycle.
fn verify_acyclic(graph: &TaskGraph) -> Result<()> {
    let mut petgraph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices = HashMap::new();
    for id in graph.tasks.keys() {
        indices.insert(id.as_str(), petgraph.add_node(id.as_str()));
    }
    for (task, deps) in &graph.dependencies {
        for dep in deps {
            if let (Some(&from), Some(&to)) = (indices.get(task.as_str()), indices.get(dep.as_str()))
            {
                petgraph.add_edge(from, to, ());
            }
        }
    }
    toposort(&petgraph, None).map_err(|cycle| StrataError::Cycle {
        path: vec![petgraph[cycle.node_id()].to_string()],
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DependsOn, ProjectType};
    use crate::project_graph::{EdgeType, ProjectNode};

    fn project(name: &str, targets: &[(&str, TargetConfig)]) -> ProjectNode {
        ProjectNode {
            name: name.into(),
            root: format!("libs/{name}"),
            project_type: ProjectType::Library,
            tags: Vec::new(),
            targets: targets
                .iter()
                .map(|(t, c)| (t.to_string(), c.clone()))
                .collect(),
            named_inputs: HashMap::new(),
            implicit_dependencies: Vec::new(),
        }
    }

    fn build_target(depends_on: &[&str]) -> TargetConfig {
        TargetConfig {
            executor: "run-commands".into(),
            depends_on: depends_on
                .iter()
                .map(|r| DependsOn::Rule(r.to_string()))
                .collect(),
            ..TargetConfig::default()
        }
    }

    fn chain_fixture() -> ProjectGraph {
        // app -> lib -> base
        let mut graph = ProjectGraph::default();
        for name in ["app", "lib", "base"] {
            graph
                .nodes
                .insert(name.into(), project(name, &[("build", build_target(&["^build"]))]));
        }
        graph.add_edge(EdgeType::Static, "app", "lib");
        graph.add_edge(EdgeType::Static, "lib", "base");
        graph
    }

    fn build(
        graph: &ProjectGraph,
        targets: &[&str],
        projects: &[&str],
    ) -> Result<TaskGraph> {
        let config = WorkspaceConfig::default();
        TaskGraphBuilder::new(graph, &config).build(
            &targets.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &projects.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            None,
            &Value::Null,
        )
    }

    #[test]
    fn caret_rule_expands_over_dependencies() {
        let graph = chain_fixture();
        let task_graph = build(&graph, &["build"], &["app"]).unwrap();

        assert_eq!(task_graph.len(), 3);
        assert_eq!(task_graph.dependencies_of("app:build"), &["lib:build"]);
        assert_eq!(task_graph.dependencies_of("lib:build"), &["base:build"]);
        assert_eq!(task_graph.roots, vec!["base:build"]);
    }

    #[test]
    fn self_rule_orders_sibling_target() {
        let mut graph = ProjectGraph::default();
        graph.nodes.insert(
            "lib".into(),
            project(
                "lib",
                &[
                    ("build", build_target(&["codegen"])),
                    ("codegen", build_target(&[])),
                ],
            ),
        );

        let task_graph = build(&graph, &["build"], &["lib"]).unwrap();
        assert_eq!(task_graph.dependencies_of("lib:build"), &["lib:codegen"]);
        assert_eq!(task_graph.roots, vec!["lib:codegen"]);
    }

    #[test]
    fn dynamic_edges_do_not_force_ordering() {
        let mut graph = ProjectGraph::default();
        for name in ["app", "lazy"] {
            graph
                .nodes
                .insert(name.into(), project(name, &[("build", build_target(&["^build"]))]));
        }
        graph.add_edge(EdgeType::Dynamic, "app", "lazy");

        let task_graph = build(&graph, &["build"], &["app"]).unwrap();
        assert_eq!(task_graph.len(), 1);
        assert!(task_graph.dependencies_of("app:build").is_empty());
    }

    #[test]
    fn cycle_is_fatal_by_default() {
        let mut graph = ProjectGraph::default();
        graph.nodes.insert(
            "a".into(),
            project("a", &[("build", build_target(&["^build"]))]),
        );
        graph.nodes.insert(
            "b".into(),
            project("b", &[("build", build_target(&["^build"]))]),
        );
        graph.add_edge(EdgeType::Static, "a", "b");
        graph.add_edge(EdgeType::Static, "b", "a");

        let err = build(&graph, &["build"], &["a"]).unwrap_err();
        assert!(matches!(err, StrataError::Cycle { .. }));
    }

    #[test]
    fn tolerated_cycle_drops_closing_edge() {
        let mut graph = ProjectGraph::default();
        graph.nodes.insert(
            "a".into(),
            project("a", &[("build", build_target(&["^build"]))]),
        );
        graph.nodes.insert(
            "b".into(),
            project("b", &[("build", build_target(&["^build"]))]),
        );
        graph.add_edge(EdgeType::Static, "a", "b");
        graph.add_edge(EdgeType::Static, "b", "a");

        let config = WorkspaceConfig::default();
        let task_graph = TaskGraphBuilder::new(&graph, &config)
            .ignore_cycles(true)
            .build(&["build".into()], &["a".into()], None, &Value::Null)
            .unwrap();

        assert_eq!(task_graph.len(), 2);
        assert_eq!(task_graph.dependencies_of("a:build"), &["b:build"]);
        assert!(task_graph.dependencies_of("b:build").is_empty());
    }

    #[test]
    fn every_dependency_key_is_a_task() {
        let task_graph = build(&chain_fixture(), &["build"], &["app", "lib"]).unwrap();
        for (task, deps) in &task_graph.dependencies {
            assert!(task_graph.tasks.contains_key(task));
            for dep in deps {
                assert!(task_graph.tasks.contains_key(dep));
            }
        }
    }

    #[test]
    fn configuration_inheritance_prefers_dependency_default() {
        let mut parent_target = build_target(&["^build"]);
        parent_target
            .configurations
            .insert("production".into(), serde_json::json!({"mode": "prod"}));

        let mut child_target = build_target(&[]);
        child_target
            .configurations
            .insert("ci".into(), serde_json::json!({"mode": "ci"}));
        child_target.default_configuration = Some("ci".into());

        let mut graph = ProjectGraph::default();
        graph
            .nodes
            .insert("parent".into(), project("parent", &[("build", parent_target)]));
        graph
            .nodes
            .insert("child".into(), project("child", &[("build", child_target)]));
        graph.add_edge(EdgeType::Static, "parent", "child");

        let config = WorkspaceConfig::default();
        let task_graph = TaskGraphBuilder::new(&graph, &config)
            .build(
                &["build".into()],
                &["parent".into()],
                Some("production"),
                &Value::Null,
            )
            .unwrap();

        assert!(task_graph.tasks.contains_key("parent:build:production"));
        // child does not define "production", so its own default applies
        assert!(task_graph.tasks.contains_key("child:build:ci"));
    }

    #[test]
    fn output_tokens_resolve_to_concrete_paths() {
        let mut target = build_target(&[]);
        target.outputs = vec![
            "{projectRoot}/dist".into(),
            "{workspaceRoot}/coverage/{options.reportsDir}".into(),
        ];
        target.options = serde_json::json!({"reportsDir": "lib"});

        let mut graph = ProjectGraph::default();
        graph
            .nodes
            .insert("lib".into(), project("lib", &[("build", target)]));

        let task_graph = build(&graph, &["build"], &["lib"]).unwrap();
        let task = &task_graph.tasks["lib:build"];
        assert_eq!(task.outputs, vec!["libs/lib/dist", "coverage/lib"]);
    }

    #[test]
    fn unknown_project_is_fatal() {
        let graph = chain_fixture();
        let err = build(&graph, &["build"], &["ghost"]).unwrap_err();
        assert!(matches!(err, StrataError::UnknownProject(p) if p == "ghost"));
    }
}
