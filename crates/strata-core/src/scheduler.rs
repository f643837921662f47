//! Scheduler - walk the task DAG with bounded concurrency
//!
//! A single-threaded coordinator makes every scheduling decision; each
//! task (or batch) runs in its own OS process. Before forking, the task
//! hash is computed and the cache consulted; hits replay recorded output
//! instead of executing. Failures skip dependents and, under bail, stop
//! any further scheduling while in-flight work finishes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::batch::{run_batch, Batch, BatchTaskResult};
use crate::cache::{CacheSource, CacheStore, OutputsTracker, RestoreOutcome};
use crate::config::{OutputStyle, RunRequest};
use crate::error::{Result, StrataError};
use crate::forked_process::{ExecutionOptions, ProcessRunner};
use crate::hasher::TaskHasher;
use crate::task_graph::{Task, TaskGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Failure,
    /// Not executed because a dependency failed or bail kicked in
    Skipped,
    LocalCacheHit,
    RemoteCacheHit,
    /// Outputs already on disk matched the cached snapshot
    UpToDate,
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::LocalCacheHit => "restored from local cache",
            TaskStatus::RemoteCacheHit => "restored from remote cache",
            TaskStatus::UpToDate => "already up to date",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::Failure)
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub code: i32,
    pub terminal_output: String,
}

#[derive(Debug)]
pub struct RunSummary {
    pub results: Vec<TaskResult>,
    pub success: bool,
    pub exit_code: i32,
}

/// Shared handles every task execution needs
pub struct ExecutionContext<'a> {
    pub hasher: &'a TaskHasher<'a>,
    pub cache: Arc<CacheStore>,
    pub runner: Arc<ProcessRunner>,
    pub tracker: Arc<dyn OutputsTracker>,
}

pub struct Scheduler {
    parallel: usize,
    bail: bool,
    skip_cache: bool,
    output_style: OutputStyle,
}

impl Scheduler {
    pub fn new(parallel: usize) -> Self {
        Self {
            parallel: parallel.max(1),
            bail: false,
            skip_cache: false,
            output_style: OutputStyle::default(),
        }
    }

    pub fn from_request(request: &RunRequest) -> Self {
        Self::new(request.parallel)
            .bail(request.bail)
            .skip_cache(request.skip_cache)
            .output_style(request.output_style)
    }

    pub fn bail(mut self, enabled: bool) -> Self {
        self.bail = enabled;
        self
    }

    pub fn skip_cache(mut self, enabled: bool) -> Self {
        self.skip_cache = enabled;
        self
    }

    pub fn output_style(mut self, style: OutputStyle) -> Self {
        self.output_style = style;
        self
    }

    /// Execute the whole graph to completion and aggregate results.
    /// Exit code: 0 when nothing failed; the failing task's own code when
    /// exactly one task ran; 1 otherwise.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        task_graph: &TaskGraph,
    ) -> Result<RunSummary> {
        let total = task_graph.len();
        if total == 0 {
            return Ok(RunSummary {
                results: Vec::new(),
                success: true,
                exit_code: 0,
            });
        }

        let mut remaining: HashMap<String, usize> = task_graph
            .tasks
            .keys()
            .map(|id| (id.clone(), task_graph.dependencies_of(id).len()))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (task, deps) in &task_graph.dependencies {
            for dep in deps {
                dependents.entry(dep.clone()).or_default().push(task.clone());
            }
        }

        let mut ready: VecDeque<String> = task_graph.roots.iter().cloned().collect();
        let mut statuses: HashMap<String, TaskStatus> = HashMap::new();
        let mut results: Vec<TaskResult> = Vec::new();
        let mut in_flight = 0usize;
        let mut bailed = false;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<TaskResult>>();

        #[cfg(unix)]
        let forwarder = spawn_signal_forwarder(Arc::clone(&ctx.runner));

        loop {
            while in_flight < self.parallel {
                let Some(task_id) = ready.pop_front() else {
                    break;
                };

                let dep_gave_up = task_graph.dependencies_of(&task_id).iter().any(|dep| {
                    matches!(
                        statuses.get(dep),
                        Some(TaskStatus::Failure) | Some(TaskStatus::Skipped)
                    )
                });
                if dep_gave_up || bailed {
                    record_result(
                        TaskResult {
                            task_id,
                            status: TaskStatus::Skipped,
                            code: 0,
                            terminal_output: String::new(),
                        },
                        &dependents,
                        &mut remaining,
                        &mut ready,
                        &mut statuses,
                        &mut results,
                    );
                    continue;
                }

                // opportunistic batching of ready tasks sharing the executor
                let executor = task_graph.tasks[&task_id].executor.clone();
                let mut group = vec![task_id];
                if ctx.runner.is_batch_executor(&executor) {
                    let extra: Vec<String> = ready
                        .iter()
                        .filter(|other| task_graph.tasks[*other].executor == executor)
                        .cloned()
                        .collect();
                    ready.retain(|other| !extra.contains(other));
                    group.extend(extra);
                }

                let mut hashes: BTreeMap<String, String> = BTreeMap::new();
                for id in &group {
                    let task = &task_graph.tasks[id];
                    if task.cacheable {
                        hashes.insert(id.clone(), ctx.hasher.hash_task(task)?);
                    }
                }

                in_flight += 1;
                if group.len() == 1 {
                    let task = task_graph.tasks[&group[0]].clone();
                    let hash = hashes.remove(&group[0]);
                    self.spawn_single(ctx, task, hash, tx.clone());
                } else {
                    let batch = Batch {
                        executor_name: executor,
                        task_graph: subgraph(task_graph, &group),
                        hashes,
                    };
                    self.spawn_batch(ctx, batch, tx.clone());
                }
            }

            if results.len() == total {
                break;
            }
            if in_flight == 0 && ready.is_empty() {
                tracing::warn!("task graph has unreachable tasks; aborting run");
                break;
            }

            let Some(finished) = rx.recv().await else {
                break;
            };
            in_flight -= 1;
            for result in finished {
                if result.status.is_failure() && self.bail {
                    bailed = true;
                }
                record_result(
                    result,
                    &dependents,
                    &mut remaining,
                    &mut ready,
                    &mut statuses,
                    &mut results,
                );
            }
        }

        #[cfg(unix)]
        forwarder.abort();

        let failures = results.iter().filter(|r| r.status.is_failure()).count();
        let success = failures == 0;
        let exit_code = if success {
            0
        } else if results.len() == 1 {
            results[0].code
        } else {
            1
        };

        Ok(RunSummary {
            results,
            success,
            exit_code,
        })
    }

    fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            output_style: self.output_style,
            prefix: self.parallel > 1,
        }
    }

    fn spawn_single(
        &self,
        ctx: &ExecutionContext<'_>,
        task: Task,
        hash: Option<String>,
        tx: mpsc::UnboundedSender<Vec<TaskResult>>,
    ) {
        let cache = Arc::clone(&ctx.cache);
        let runner = Arc::clone(&ctx.runner);
        let tracker = Arc::clone(&ctx.tracker);
        let options = self.execution_options();
        let skip_cache = self.skip_cache;

        tokio::spawn(async move {
            let result =
                run_single(&task, hash.as_deref(), &cache, &runner, &tracker, &options, skip_cache)
                    .await;
            let _ = tx.send(vec![result]);
        });
    }

    fn spawn_batch(
        &self,
        ctx: &ExecutionContext<'_>,
        batch: Batch,
        tx: mpsc::UnboundedSender<Vec<TaskResult>>,
    ) {
        let cache = Arc::clone(&ctx.cache);
        let runner = Arc::clone(&ctx.runner);
        let tracker = Arc::clone(&ctx.tracker);
        let options = self.execution_options();
        let skip_cache = self.skip_cache;

        tokio::spawn(async move {
            let results =
                run_batch_group(batch, &cache, &runner, &tracker, &options, skip_cache).await;
            let _ = tx.send(results);
        });
    }
}

fn record_result(
    result: TaskResult,
    dependents: &HashMap<String, Vec<String>>,
    remaining: &mut HashMap<String, usize>,
    ready: &mut VecDeque<String>,
    statuses: &mut HashMap<String, TaskStatus>,
    results: &mut Vec<TaskResult>,
) {
    statuses.insert(result.task_id.clone(), result.status);
    for dependent in dependents.get(&result.task_id).into_iter().flatten() {
        if let Some(count) = remaining.get_mut(dependent) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(dependent.clone());
            }
        }
    }
    results.push(result);
}

/// Restrict the graph to a set of simultaneously-ready tasks
fn subgraph(task_graph: &TaskGraph, group: &[String]) -> TaskGraph {
    let tasks: HashMap<String, Task> = group
        .iter()
        .filter_map(|id| task_graph.tasks.get(id).map(|t| (id.clone(), t.clone())))
        .collect();
    let dependencies: HashMap<String, Vec<String>> = group
        .iter()
        .map(|id| {
            let deps = task_graph
                .dependencies_of(id)
                .iter()
                .filter(|dep| tasks.contains_key(*dep))
                .cloned()
                .collect();
            (id.clone(), deps)
        })
        .collect();
    let mut roots: Vec<String> = dependencies
        .iter()
        .filter(|(_, deps)| deps.is_empty())
        .map(|(id, _)| id.clone())
        .collect();
    roots.sort();
    TaskGraph {
        tasks,
        dependencies,
        roots,
    }
}

async fn run_single(
    task: &Task,
    hash: Option<&str>,
    cache: &CacheStore,
    runner: &ProcessRunner,
    tracker: &Arc<dyn OutputsTracker>,
    options: &ExecutionOptions,
    skip_cache: bool,
) -> TaskResult {
    if let Some(hash) = hash {
        if !skip_cache {
            if let Some(result) = try_cache(task, hash, cache, tracker).await {
                return result;
            }
        }
    }

    match runner.run_task(task, hash.unwrap_or_default(), options).await {
        Ok((code, terminal_output)) => {
            if options.output_style == OutputStyle::Buffered {
                replay_output(&task.id, &terminal_output, None);
            }
            if code == 0 && !skip_cache && !task.outputs.is_empty() {
                if let Some(hash) = hash {
                    store_result(task, hash, cache, tracker, &terminal_output, code);
                }
            }
            TaskResult {
                task_id: task.id.clone(),
                status: if code == 0 {
                    TaskStatus::Success
                } else {
                    TaskStatus::Failure
                },
                code,
                terminal_output,
            }
        }
        Err(e) => TaskResult {
            task_id: task.id.clone(),
            status: TaskStatus::Failure,
            code: 1,
            terminal_output: e.to_string(),
        },
    }
}

/// A hit replays recorded output and restores declared outputs; cache
/// corruption downgrades to a miss with a warning.
async fn try_cache(
    task: &Task,
    hash: &str,
    cache: &CacheStore,
    tracker: &Arc<dyn OutputsTracker>,
) -> Option<TaskResult> {
    let lookup = cache.get(hash).await;
    let (cached, source) = match lookup {
        Ok(Some(hit)) => hit,
        Ok(None) => return None,
        Err(StrataError::CacheCorruption { hash }) => {
            tracing::warn!(hash, "corrupt cache entry, treating as a miss");
            return None;
        }
        Err(e) => {
            tracing::warn!(task = %task.id, "cache read failed, treating as a miss: {e}");
            return None;
        }
    };

    let mut status = match source {
        CacheSource::Local => TaskStatus::LocalCacheHit,
        CacheSource::Remote => TaskStatus::RemoteCacheHit,
    };

    if !task.outputs.is_empty() {
        if tracker.outputs_hashes_match(&task.outputs, hash) {
            status = TaskStatus::UpToDate;
        } else {
            match cache.restore_outputs(hash, &task.outputs) {
                Ok(RestoreOutcome::MatchedExisting) => status = TaskStatus::UpToDate,
                Ok(RestoreOutcome::Restored) => {}
                Err(e) => {
                    tracing::warn!(task = %task.id, "output restore failed, re-running: {e}");
                    return None;
                }
            }
            tracker.record_outputs_hash(&task.outputs, hash);
        }
    }

    replay_output(&task.id, &cached.terminal_output, Some(status.label()));
    Some(TaskResult {
        task_id: task.id.clone(),
        status,
        code: cached.code,
        terminal_output: cached.terminal_output,
    })
}

fn store_result(
    task: &Task,
    hash: &str,
    cache: &CacheStore,
    tracker: &Arc<dyn OutputsTracker>,
    terminal_output: &str,
    code: i32,
) {
    match cache.put(hash, &task.outputs, terminal_output, code) {
        Ok(()) => {
            tracker.record_outputs_hash(&task.outputs, hash);
            cache.push_remote_in_background(hash);
        }
        Err(StrataError::CacheCorruption { hash }) => {
            tracing::warn!(hash, task = %task.id, "conflicting cache write rejected");
        }
        Err(e) => {
            tracing::warn!(task = %task.id, "cache write failed: {e}");
        }
    }
}

/// Batch members still consult the cache individually; only the misses
/// travel to the worker process.
async fn run_batch_group(
    batch: Batch,
    cache: &CacheStore,
    runner: &ProcessRunner,
    tracker: &Arc<dyn OutputsTracker>,
    options: &ExecutionOptions,
    skip_cache: bool,
) -> Vec<TaskResult> {
    let mut results: Vec<TaskResult> = Vec::new();
    let mut misses: Vec<String> = Vec::new();

    for (id, task) in &batch.task_graph.tasks {
        let hit = match batch.hashes.get(id) {
            Some(hash) if !skip_cache => try_cache(task, hash, cache, tracker).await,
            _ => None,
        };
        match hit {
            Some(result) => results.push(result),
            None => misses.push(id.clone()),
        }
    }

    if misses.is_empty() {
        return results;
    }

    let remainder = Batch {
        executor_name: batch.executor_name.clone(),
        task_graph: subgraph(&batch.task_graph, &misses),
        hashes: batch.hashes.clone(),
    };
    match run_batch(runner, &remainder).await {
        Ok(batch_results) => {
            for (id, result) in batch_results {
                let Some(task) = batch.task_graph.tasks.get(&id) else {
                    continue;
                };
                finish_batch_task(task, &batch, result, cache, tracker, options, skip_cache, &mut results);
            }
        }
        Err(e) => {
            for id in &misses {
                results.push(TaskResult {
                    task_id: id.clone(),
                    status: TaskStatus::Failure,
                    code: 1,
                    terminal_output: e.to_string(),
                });
            }
        }
    }
    results
}

#[allow(clippy::too_many_arguments)]
fn finish_batch_task(
    task: &Task,
    batch: &Batch,
    result: BatchTaskResult,
    cache: &CacheStore,
    tracker: &Arc<dyn OutputsTracker>,
    options: &ExecutionOptions,
    skip_cache: bool,
    results: &mut Vec<TaskResult>,
) {
    if options.output_style == OutputStyle::Buffered {
        replay_output(&task.id, &result.terminal_output, None);
    }
    if result.success && !skip_cache && !task.outputs.is_empty() {
        if let Some(hash) = batch.hashes.get(&task.id) {
            store_result(task, hash, cache, tracker, &result.terminal_output, result.code);
        }
    }
    results.push(TaskResult {
        task_id: task.id.clone(),
        status: if result.success {
            TaskStatus::Success
        } else {
            TaskStatus::Failure
        },
        code: result.code,
        terminal_output: result.terminal_output,
    });
}

fn replay_output(task_id: &str, terminal_output: &str, note: Option<&str>) {
    match note {
        Some(note) => println!("> {task_id} ({note})"),
        None => println!("> {task_id}"),
    }
    if !terminal_output.is_empty() {
        print!("{terminal_output}");
        if !terminal_output.ends_with('\n') {
            println!();
        }
    }
}

#[cfg(unix)]
fn spawn_signal_forwarder(runner: Arc<ProcessRunner>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut interrupt), Ok(mut terminate), Ok(mut hangup)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            return;
        };
        loop {
            tokio::select! {
                _ = interrupt.recv() => runner.terminate_children(),
                _ = terminate.recv() => runner.terminate_children(),
                _ = hangup.recv() => runner.terminate_children(),
            }
        }
    })
}
