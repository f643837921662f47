//! Forked-process task execution
//!
//! Every uncached task runs in its own OS process with a curated
//! environment: .env files merged workspace-first (later files override),
//! then the parent environment, then the task-identity variables on top.
//! Output is captured line-by-line and optionally streamed with a
//! per-project colored prefix.

use colored::{Color, Colorize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::config::{
    ExecutorDef, OutputStyle, WorkspaceConfig, ENV_TASK_HASH, ENV_TASK_TARGET_PROJECT,
    ENV_WORKSPACE_ROOT, RUN_COMMANDS_EXECUTOR,
};
use crate::error::{Result, StrataError};
use crate::task_graph::Task;

const PREFIX_COLORS: &[Color] = &[
    Color::Green,
    Color::BrightGreen,
    Color::Cyan,
    Color::BrightCyan,
    Color::Yellow,
    Color::BrightYellow,
    Color::Magenta,
    Color::BrightMagenta,
    Color::Blue,
    Color::BrightBlue,
];

#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    pub output_style: OutputStyle,
    /// Prefix streamed lines with the project name (concurrency > 1)
    pub prefix: bool,
}

pub struct ProcessRunner {
    workspace_root: PathBuf,
    executors: HashMap<String, ExecutorDef>,
    children: Arc<Mutex<HashSet<u32>>>,
}

impl ProcessRunner {
    pub fn new(workspace_root: impl AsRef<Path>, config: &WorkspaceConfig) -> Self {
        Self {
            workspace_root: workspace_root.as_ref().to_path_buf(),
            executors: config.executors.clone(),
            children: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_batch_executor(&self, name: &str) -> bool {
        self.executors.get(name).map(|d| d.batch).unwrap_or(false)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Fork a dedicated process for the task's executor and capture its
    /// combined output. Exit code follows the POSIX 128+signal convention
    /// when the child died from a signal.
    pub async fn run_task(
        &self,
        task: &Task,
        hash: &str,
        options: &ExecutionOptions,
    ) -> Result<(i32, String)> {
        let (command, cwd) = self.command_for_task(task)?;
        let env = self.env_for_task(task, hash);

        if options.output_style == OutputStyle::Stream {
            println!("> {} $ {command}", task.id.as_str().bold());
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.children.lock().unwrap().insert(pid);
        }

        let combined = Arc::new(Mutex::new(String::new()));
        let stream = options.output_style == OutputStyle::Stream;
        let prefix = (options.prefix && stream).then(|| stream_prefix(&task.project));

        let stdout_task = child
            .stdout
            .take()
            .map(|out| consume_lines(out, Arc::clone(&combined), stream, prefix.clone()));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| consume_lines(err, Arc::clone(&combined), stream, prefix.clone()));

        if let Some(handle) = stdout_task {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_task {
            let _ = handle.await;
        }
        let status = child.wait().await?;

        if let Some(pid) = pid {
            self.children.lock().unwrap().remove(&pid);
        }

        let terminal_output = combined.lock().unwrap().clone();
        Ok((exit_code(&status), terminal_output))
    }

    pub(crate) fn command_for_task(&self, task: &Task) -> Result<(String, PathBuf)> {
        let cwd = task
            .options
            .get("cwd")
            .and_then(Value::as_str)
            .map(|c| self.workspace_root.join(c))
            .unwrap_or_else(|| self.workspace_root.clone());

        if task.executor == RUN_COMMANDS_EXECUTOR {
            let command = task
                .options
                .get("command")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    StrataError::Config(format!("{} declares no command option", task.id))
                })?;
            return Ok((command.to_string(), cwd));
        }

        let def = self.executors.get(&task.executor).ok_or_else(|| {
            StrataError::Config(format!(
                "unknown executor \"{}\" referenced by {}",
                task.executor, task.id
            ))
        })?;
        Ok((
            def.command.replace("{projectRoot}", &task.project_root),
            cwd,
        ))
    }

    /// .env files (workspace, then target-specific, then project, then
    /// project target-specific), overridden by the parent environment,
    /// overridden by the task identity variables.
    pub fn env_for_task(&self, task: &Task, hash: &str) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = HashMap::new();
        for file in self.dotenv_files(&task.project_root, &task.target) {
            for (key, value) in parse_env_file(&file) {
                env.insert(key, value);
            }
        }
        env.extend(std::env::vars());
        env.insert(
            ENV_WORKSPACE_ROOT.into(),
            self.workspace_root.to_string_lossy().into_owned(),
        );
        env.insert(ENV_TASK_TARGET_PROJECT.into(), task.project.clone());
        env.insert(ENV_TASK_HASH.into(), hash.to_string());
        env.entry("FORCE_COLOR".into()).or_insert_with(|| "true".into());
        env
    }

    fn dotenv_files(&self, project_root: &str, target: &str) -> Vec<PathBuf> {
        let ws = &self.workspace_root;
        let project = ws.join(project_root);
        vec![
            ws.join(".env"),
            ws.join(".env.local"),
            ws.join(format!(".{target}.env")),
            ws.join(format!(".env.{target}")),
            project.join(".env"),
            project.join(".env.local"),
            project.join(format!(".{target}.env")),
            project.join(format!(".env.{target}")),
        ]
    }

    /// Forward SIGTERM to every live child
    #[cfg(unix)]
    pub fn terminate_children(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        for pid in self.children.lock().unwrap().iter() {
            let _ = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    pub fn terminate_children(&self) {}

    pub(crate) fn track_child(&self, pid: u32) {
        self.children.lock().unwrap().insert(pid);
    }

    pub(crate) fn untrack_child(&self, pid: u32) {
        self.children.lock().unwrap().remove(&pid);
    }
}

/// Read lines into the combined buffer, optionally echoing them live
fn consume_lines(
    reader: impl AsyncRead + Unpin + Send + 'static,
    combined: Arc<Mutex<String>>,
    stream: bool,
    prefix: Option<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stream {
                match &prefix {
                    Some(prefix) => println!("{prefix} {line}"),
                    None => println!("{line}"),
                }
            }
            let mut buffer = combined.lock().unwrap();
            buffer.push_str(&line);
            buffer.push('\n');
        }
    })
}

/// Stable per-project color chosen by character-code sum
pub fn project_color(project: &str) -> Color {
    let code: usize = project.bytes().map(|b| b as usize).sum();
    PREFIX_COLORS[code % PREFIX_COLORS.len()]
}

fn stream_prefix(project: &str) -> String {
    let tag = format!("{project}:");
    tag.as_str()
        .color(project_color(project))
        .bold()
        .to_string()
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

/// Minimal KEY=VALUE parser; comments and blank lines are skipped,
/// surrounding quotes are stripped.
fn parse_env_file(path: &Path) -> Vec<(String, String)> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn runner(root: &Path) -> ProcessRunner {
        ProcessRunner::new(root, &WorkspaceConfig::default())
    }

    fn task(id: &str, project: &str, root: &str, command: &str) -> Task {
        Task {
            id: id.into(),
            project: project.into(),
            target: "build".into(),
            configuration: None,
            executor: RUN_COMMANDS_EXECUTOR.into(),
            options: serde_json::json!({ "command": command }),
            overrides: Value::Null,
            outputs: Vec::new(),
            project_root: root.into(),
            cacheable: false,
        }
    }

    #[tokio::test]
    async fn captures_combined_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let task = task("a:build", "a", "libs/a", "echo out; echo err >&2; exit 3");

        let options = ExecutionOptions {
            output_style: OutputStyle::Buffered,
            prefix: false,
        };
        let (code, output) = runner.run_task(&task, "hash", &options).await.unwrap();
        assert_eq!(code, 3);
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[test]
    fn env_file_precedence_is_workspace_then_target_then_project() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("libs/a")).unwrap();
        fs::write(dir.path().join(".env"), "FOO=workspace\nBASE=1").unwrap();
        fs::write(dir.path().join(".env.build"), "FOO=target").unwrap();
        fs::write(dir.path().join("libs/a/.env"), "FOO=project").unwrap();
        fs::write(dir.path().join("libs/a/.env.build"), "FOO=project-target").unwrap();

        let runner = runner(dir.path());
        let task = task("a:build", "a", "libs/a", "true");
        let env = runner.env_for_task(&task, "h");

        assert_eq!(env.get("FOO").map(String::as_str), Some("project-target"));
        assert_eq!(env.get("BASE").map(String::as_str), Some("1"));
        assert_eq!(env.get(ENV_TASK_HASH).map(String::as_str), Some("h"));
        assert_eq!(env.get(ENV_TASK_TARGET_PROJECT).map(String::as_str), Some("a"));
    }

    #[test]
    fn parse_env_file_strips_quotes_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(&path, "# comment\nA=1\nB=\"two\"\nC='three'\n\nnot a pair\n").unwrap();

        let parsed: HashMap<String, String> = parse_env_file(&path).into_iter().collect();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "two");
        assert_eq!(parsed["C"], "three");
    }

    #[test]
    fn project_color_is_stable() {
        assert_eq!(project_color("web"), project_color("web"));
    }

    #[tokio::test]
    async fn missing_command_option_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(dir.path());
        let mut task = task("a:build", "a", "libs/a", "true");
        task.options = serde_json::json!({});

        let options = ExecutionOptions {
            output_style: OutputStyle::Buffered,
            prefix: false,
        };
        let err = runner.run_task(&task, "h", &options).await.unwrap_err();
        assert!(matches!(err, StrataError::Config(_)));
    }
}
