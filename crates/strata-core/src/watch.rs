//! Watch-mode executors - a cancellable stream of completion events
//!
//! A watch-capable executor is a long-lived child process that emits a
//! marker line after every rebuild. The core consumes it as a lazy,
//! potentially infinite sequence of success/failure events, treating
//! each as a fresh completion for reporting. Dropping the stream (or
//! process teardown) cancels the child.

use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::forked_process::ProcessRunner;
use crate::task_graph::Task;

/// Marker a watch executor prints to report one rebuild cycle:
/// `::strata-watch::success` or `::strata-watch::failure`.
pub const WATCH_EVENT_PREFIX: &str = "::strata-watch::";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorEvent {
    pub success: bool,
}

/// Lazy sequence of rebuild completions from one watch task
pub struct WatchStream {
    events: mpsc::UnboundedReceiver<ExecutorEvent>,
    child: tokio::process::Child,
}

impl WatchStream {
    /// The next completion event, or None once the executor exits
    pub async fn next_event(&mut self) -> Option<ExecutorEvent> {
        self.events.recv().await
    }

    /// Terminate the underlying executor process
    pub async fn cancel(mut self) {
        let _ = self.child.kill().await;
    }
}

impl ProcessRunner {
    /// Spawn the task's executor in watch mode. Marker lines become
    /// events; every other line streams through to the terminal.
    pub fn run_watch_task(&self, task: &Task, hash: &str) -> Result<WatchStream> {
        let (command, cwd) = self.command_for_task(task)?;
        let env = self.env_for_task(task, hash);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match line.strip_prefix(WATCH_EVENT_PREFIX) {
                        Some(event) => {
                            let _ = tx.send(ExecutorEvent {
                                success: event.trim() != "failure",
                            });
                        }
                        None => println!("{line}"),
                    }
                }
            });
        }

        Ok(WatchStream { events: rx, child })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{WorkspaceConfig, RUN_COMMANDS_EXECUTOR};
    use serde_json::Value;

    fn watch_task(command: &str) -> Task {
        Task {
            id: "lib:serve".into(),
            project: "lib".into(),
            target: "serve".into(),
            configuration: None,
            executor: RUN_COMMANDS_EXECUTOR.into(),
            options: serde_json::json!({ "command": command }),
            overrides: Value::Null,
            outputs: Vec::new(),
            project_root: "libs/lib".into(),
            cacheable: false,
        }
    }

    #[tokio::test]
    async fn marker_lines_become_events_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(dir.path(), &WorkspaceConfig::default());
        let task = watch_task(
            "echo '::strata-watch::success'; echo building; echo '::strata-watch::failure'; echo '::strata-watch::success'",
        );

        let mut stream = runner.run_watch_task(&task, "h").unwrap();
        assert_eq!(
            stream.next_event().await,
            Some(ExecutorEvent { success: true })
        );
        assert_eq!(
            stream.next_event().await,
            Some(ExecutorEvent { success: false })
        );
        assert_eq!(
            stream.next_event().await,
            Some(ExecutorEvent { success: true })
        );
        // executor exited; the sequence ends
        assert_eq!(stream.next_event().await, None);
    }

    #[tokio::test]
    async fn cancel_terminates_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(dir.path(), &WorkspaceConfig::default());
        let task = watch_task("echo '::strata-watch::success'; sleep 600");

        let mut stream = runner.run_watch_task(&task, "h").unwrap();
        assert!(stream.next_event().await.is_some());
        stream.cancel().await;
    }
}
