//! Batch execution - many tasks, one worker process
//!
//! Tasks sharing a batch-capable executor are handed to a single child
//! process as a whole task sub-graph, trading spawn overhead for reduced
//! isolation: a worker crash fails every task in the batch with the
//! worker's exit code. Messages are a closed tagged union as
//! line-delimited JSON over the worker's stdio; unknown message types
//! are forwarded, never dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::{OutputStyle, WorkspaceConfig};
use crate::error::{Result, StrataError};
use crate::forked_process::{ExecutionOptions, ProcessRunner};
use crate::task_graph::TaskGraph;

/// Hidden CLI subcommand the parent invokes on the current executable
pub const BATCH_WORKER_COMMAND: &str = "batch-worker";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchMessage {
    /// Parent -> worker: the whole sub-graph to process
    Tasks {
        executor: String,
        task_graph: TaskGraph,
        /// Hash per task id, precomputed by the parent
        hashes: BTreeMap<String, String>,
    },
    /// Worker -> parent: per-task results
    Complete {
        results: BTreeMap<String, BatchTaskResult>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchTaskResult {
    pub success: bool,
    pub code: i32,
    pub terminal_output: String,
}

/// Tasks grouped under one batch-capable executor
#[derive(Debug)]
pub struct Batch {
    pub executor_name: String,
    pub task_graph: TaskGraph,
    pub hashes: BTreeMap<String, String>,
}

/// Spawn the worker, stream the sub-graph in, await the `Complete`
/// message. A worker death fails every task with the process exit code.
pub async fn run_batch(runner: &ProcessRunner, batch: &Batch) -> Result<BTreeMap<String, BatchTaskResult>> {
    let count = batch.task_graph.len();
    tracing::info!(
        executor = %batch.executor_name,
        tasks = count,
        "running batch"
    );

    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .arg(BATCH_WORKER_COMMAND)
        .current_dir(runner.workspace_root())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let pid = child.id();
    if let Some(pid) = pid {
        runner.track_child(pid);
    }

    let message = BatchMessage::Tasks {
        executor: batch.executor_name.clone(),
        task_graph: batch.task_graph.clone(),
        hashes: batch.hashes.clone(),
    };
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(serde_json::to_string(&message)?.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.shutdown().await?;
    }

    let mut results: Option<BTreeMap<String, BatchTaskResult>> = None;
    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_message(&line) {
                Some(BatchMessage::Complete { results: r }) => {
                    results = Some(r);
                }
                Some(other) => {
                    tracing::debug!(?other, "unexpected batch message");
                }
                // not ours: forward instead of dropping
                None => println!("{line}"),
            }
        }
    }

    let status = child.wait().await?;
    if let Some(pid) = pid {
        runner.untrack_child(pid);
    }

    match results {
        Some(results) => Ok(results),
        None => {
            let code = status.code().unwrap_or(1);
            tracing::warn!(
                executor = %batch.executor_name,
                code,
                "batch worker exited without results"
            );
            Ok(batch
                .task_graph
                .tasks
                .keys()
                .map(|id| {
                    (
                        id.clone(),
                        BatchTaskResult {
                            success: false,
                            code,
                            terminal_output: format!(
                                "batch executor \"{}\" exited unexpectedly with code {code}",
                                batch.executor_name
                            ),
                        },
                    )
                })
                .collect())
        }
    }
}

/// A known message, or None for anything foreign
fn parse_message(line: &str) -> Option<BatchMessage> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("type")?;
    serde_json::from_value(value).ok()
}

/// Worker entrypoint: read the sub-graph from stdin, run its tasks in
/// dependency order, report per-task results on stdout. Invoked by the
/// CLI's hidden subcommand in a fresh process.
pub async fn batch_worker_main() -> Result<()> {
    let workspace_root = std::env::current_dir()?;
    let config = WorkspaceConfig::load(&workspace_root)?;
    let runner = ProcessRunner::new(&workspace_root, &config);

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    while let Ok(Some(line)) = lines.next_line().await {
        let Some(message) = parse_message(&line) else {
            // foreign message: forward it
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            continue;
        };
        let BatchMessage::Tasks {
            task_graph, hashes, ..
        } = message
        else {
            continue;
        };

        let mut results = BTreeMap::new();
        let options = ExecutionOptions {
            output_style: OutputStyle::Buffered,
            prefix: false,
        };
        for task_id in task_graph.topological_order() {
            let task = &task_graph.tasks[&task_id];
            let hash = hashes.get(&task_id).map(String::as_str).unwrap_or("");
            let (code, terminal_output) = match runner.run_task(task, hash, &options).await {
                Ok(result) => result,
                Err(StrataError::Config(message)) => (1, message),
                Err(e) => return Err(e),
            };
            results.insert(
                task_id.clone(),
                BatchTaskResult {
                    success: code == 0,
                    code,
                    terminal_output,
                },
            );
        }

        let reply = BatchMessage::Complete { results };
        stdout
            .write_all(serde_json::to_string(&reply)?.as_bytes())
            .await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_roundtrip_with_screaming_tags() {
        let message = BatchMessage::Complete {
            results: BTreeMap::from([(
                "a:build".to_string(),
                BatchTaskResult {
                    success: true,
                    code: 0,
                    terminal_output: "done".into(),
                },
            )]),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"COMPLETE\""));

        match parse_message(&json) {
            Some(BatchMessage::Complete { results }) => {
                assert!(results["a:build"].success);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_types_are_not_swallowed_as_known() {
        assert!(parse_message(r#"{"type": "SOMETHING_ELSE", "x": 1}"#).is_none());
        assert!(parse_message("not json at all").is_none());
        assert!(parse_message(r#"{"no_type": true}"#).is_none());
    }
}
