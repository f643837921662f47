//! Workspace and project configuration models
//!
//! All configuration is read-only input to the core: `strata.json` at the
//! workspace root, `project.json` per project, `package.json` manifests.
//! Option blobs are passed through to executors, never interpreted here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Result, StrataError};

pub const WORKSPACE_CONFIG_FILE: &str = "strata.json";
pub const PROJECT_CONFIG_FILE: &str = "project.json";
pub const PACKAGE_MANIFEST_FILE: &str = "package.json";
pub const LOCKFILE_NAMES: &[&str] = &["package-lock.json", "yarn.lock", "pnpm-lock.yaml"];

pub const ENV_DAEMON: &str = "STRATA_DAEMON";
pub const ENV_WORKSPACE_ROOT: &str = "STRATA_WORKSPACE_ROOT";
pub const ENV_TASK_HASH: &str = "STRATA_TASK_HASH";
pub const ENV_TASK_TARGET_PROJECT: &str = "STRATA_TASK_TARGET_PROJECT";
pub const ENV_SKIP_CACHE: &str = "STRATA_SKIP_CACHE";
pub const ENV_PREFIX_OUTPUT: &str = "STRATA_PREFIX_OUTPUT";
pub const ENV_VERBOSE_LOGGING: &str = "STRATA_VERBOSE_LOGGING";

pub const DEFAULT_PARALLEL: usize = 3;

/// Built-in executor running `options.command` through the shell
pub const RUN_COMMANDS_EXECUTOR: &str = "run-commands";

/// Project classification used for discovery inference and tagging
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    Application,
    Library,
    E2e,
}

/// How a `dependsOn` rule scopes its target
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DependencyScope {
    /// Run the target on every dependency of this project first
    #[serde(rename = "dependencies")]
    Dependencies,
    /// Run another target on the same project first
    #[serde(rename = "self")]
    OwnProject,
}

/// A single `dependsOn` entry: `"^build"`, `"prebuild"`, or the explicit
/// object form `{ "projects": "self", "target": "prebuild" }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DependsOn {
    Rule(String),
    Explicit {
        projects: DependencyScope,
        target: String,
    },
}

impl DependsOn {
    pub fn scope_and_target(&self) -> (DependencyScope, &str) {
        match self {
            DependsOn::Rule(rule) => match rule.strip_prefix('^') {
                Some(target) => (DependencyScope::Dependencies, target),
                None => (DependencyScope::OwnProject, rule),
            },
            DependsOn::Explicit { projects, target } => (*projects, target),
        }
    }
}

/// One hash input: a named-input reference, an inline glob, or an env var.
/// A leading `^` on a reference pulls the fileset from dependencies
/// instead of the project itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum InputSpec {
    Env { env: String },
    Source(String),
}

/// A named operation on a project, bound to an executor and options
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetConfig {
    pub executor: String,
    /// Opaque blob handed to the executor, never interpreted by the core
    pub options: serde_json::Value,
    /// Output globs; may contain `{projectRoot}` / `{workspaceRoot}` tokens
    pub outputs: Vec<String>,
    pub depends_on: Vec<DependsOn>,
    pub inputs: Vec<InputSpec>,
    /// Named option overlays selectable per run
    pub configurations: HashMap<String, serde_json::Value>,
    pub default_configuration: Option<String>,
}

/// Contents of a `project.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectConfig {
    pub name: Option<String>,
    pub project_type: Option<ProjectType>,
    pub tags: Vec<String>,
    pub targets: HashMap<String, TargetConfig>,
    pub implicit_dependencies: Vec<String>,
    pub named_inputs: HashMap<String, Vec<InputSpec>>,
}

/// The subset of `package.json` the core reads
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageManifest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub dependencies: HashMap<String, String>,
    pub dev_dependencies: HashMap<String, String>,
    pub scripts: HashMap<String, String>,
}

impl PackageManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            StrataError::Config(format!("malformed manifest {}: {e}", path.display()))
        })
    }
}

/// How an executor name resolves to something runnable
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorDef {
    /// Shell command template; `{projectRoot}` is interpolated
    pub command: String,
    /// Batch-capable executors receive a whole task sub-graph in one process
    pub batch: bool,
}

/// Terminal output handling for task execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputStyle {
    /// Stream live, optionally prefixed per project
    #[default]
    Stream,
    /// Capture silently, replay when the task finishes
    Buffered,
}

/// Contents of `strata.json` at the workspace root
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceConfig {
    pub named_inputs: HashMap<String, Vec<InputSpec>>,
    /// Targets allowed to consult and write the cache
    pub cacheable_operations: Vec<String>,
    pub parallel: Option<usize>,
    pub output_style: Option<OutputStyle>,
    /// Directory whose projects are inferred as applications
    pub apps_dir: Option<String>,
    /// Explicit daemon opt-in/out; `STRATA_DAEMON` env overrides, CI disables
    pub use_daemon_process: Option<bool>,
    /// Workspace-declared executors, keyed by the name targets reference
    pub executors: HashMap<String, ExecutorDef>,
}

impl WorkspaceConfig {
    /// Load `strata.json`; an absent file yields the default config,
    /// a malformed one is a `Config` error.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(WORKSPACE_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| StrataError::Config(format!("malformed {WORKSPACE_CONFIG_FILE}: {e}")))
    }

    pub fn exists(workspace_root: &Path) -> bool {
        workspace_root.join(WORKSPACE_CONFIG_FILE).exists()
    }

    pub fn is_cacheable(&self, target: &str) -> bool {
        self.cacheable_operations.iter().any(|t| t == target)
    }

    pub fn apps_dir(&self) -> &str {
        self.apps_dir.as_deref().unwrap_or("apps")
    }
}

/// Which projects a run request addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectSelection {
    Named(Vec<String>),
    Affected,
}

/// A single CLI run request as consumed by the core
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub targets: Vec<String>,
    pub projects: ProjectSelection,
    pub configuration: Option<String>,
    pub parallel: usize,
    pub skip_cache: bool,
    pub output_style: OutputStyle,
    pub bail: bool,
    pub ignore_cycles: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            projects: ProjectSelection::Named(Vec::new()),
            configuration: None,
            parallel: DEFAULT_PARALLEL,
            skip_cache: false,
            output_style: OutputStyle::default(),
            bail: false,
            ignore_cycles: false,
        }
    }
}
