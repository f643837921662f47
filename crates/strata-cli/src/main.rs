//! Strata CLI - monorepo task orchestration
//!
//! Commands:
//! - strata run <targets> [-p projects]  - run targets with caching
//! - strata affected -t <targets> --files <changed>  - run on affected projects
//! - strata graph  - show the project graph
//! - strata daemon <start|stop|status|serve>  - daemon management
//! - strata cache <stats|clear>  - cache management

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use strata_core::affected::{affected, default_locators, LocatorContext};
use strata_core::cache::{CacheStore, InMemoryOutputsTracker, OutputsTracker};
use strata_core::config::{
    OutputStyle, ProjectSelection, RunRequest, WorkspaceConfig, DEFAULT_PARALLEL,
    ENV_VERBOSE_LOGGING,
};
use strata_core::error::StrataError;
use strata_core::forked_process::ProcessRunner;
use strata_core::hasher::TaskHasher;
use strata_core::project_graph::{ProjectGraph, ProjectGraphBuilder};
use strata_core::remote_cache::RemoteCache;
use strata_core::scheduler::{ExecutionContext, RunSummary, Scheduler, TaskStatus};
use strata_core::task_graph::TaskGraphBuilder;
use strata_core::workspace_files::{normalize_path, WorkspaceFiles};
use strata_daemon::{daemon_enabled, DaemonClient, DaemonOutputsTracker, DaemonServer};

#[derive(Parser)]
#[command(name = "strata", version, about = "Monorepo task orchestration")]
struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputStyleArg {
    Stream,
    Buffered,
}

impl From<OutputStyleArg> for OutputStyle {
    fn from(style: OutputStyleArg) -> Self {
        match style {
            OutputStyleArg::Stream => OutputStyle::Stream,
            OutputStyleArg::Buffered => OutputStyle::Buffered,
        }
    }
}

#[derive(clap::Args, Debug)]
struct RunFlags {
    #[arg(long)]
    configuration: Option<String>,

    /// Max concurrent tasks
    #[arg(long, default_value_t = DEFAULT_PARALLEL)]
    parallel: usize,

    /// Ignore existing cache entries
    #[arg(long)]
    skip_cache: bool,

    #[arg(long, value_enum, default_value_t = OutputStyleArg::Stream)]
    output_style: OutputStyleArg,

    /// Stop scheduling new tasks after the first failure
    #[arg(long)]
    bail: bool,

    /// Prune task graph cycles instead of failing
    #[arg(long)]
    ignore_cycles: bool,

    /// Option overrides as key=value, after --
    #[arg(last = true)]
    overrides: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more targets across projects
    Run {
        /// Target names (e.g. build, test)
        #[arg(required = true)]
        targets: Vec<String>,

        /// Projects to run on (default: every project defining the target)
        #[arg(short, long, value_delimiter = ',')]
        projects: Vec<String>,

        #[command(flatten)]
        flags: RunFlags,
    },
    /// Run targets on the projects affected by changed files
    Affected {
        #[arg(short, long, value_delimiter = ',', required = true)]
        targets: Vec<String>,

        /// Changed files, workspace-relative
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,

        #[command(flatten)]
        flags: RunFlags,
    },
    /// Run one target in watch mode, reporting each rebuild completion
    Watch {
        target: String,

        #[arg(short, long)]
        project: String,

        #[arg(long)]
        configuration: Option<String>,
    },
    /// Show the project graph
    Graph,
    /// Daemon management
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Cache management
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Internal batch worker entrypoint
    #[command(name = "batch-worker", hide = true)]
    BatchWorker,
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon in the background
    Start,
    /// Stop the daemon and remove its socket
    Stop,
    /// Report daemon liveness
    Status,
    /// Run the daemon in the foreground (used internally)
    #[command(hide = true)]
    Serve,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count and disk usage
    Stats,
    /// Delete every cache entry
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let root = std::env::current_dir()?;

    match cli.command {
        Commands::Run {
            targets,
            projects,
            flags,
        } => {
            let request = build_request(targets, ProjectSelection::Named(projects), &flags);
            let code = run_targets(&root, request, None, &flags.overrides).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Affected {
            targets,
            files,
            flags,
        } => {
            let request = build_request(targets, ProjectSelection::Affected, &flags);
            let changed: Vec<String> = files
                .iter()
                .map(|f| normalize_path(Path::new(f)))
                .collect();
            let code = run_targets(&root, request, Some(changed), &flags.overrides).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Watch {
            target,
            project,
            configuration,
        } => {
            watch_target(&root, &target, &project, configuration.as_deref()).await?;
        }

        Commands::Graph => {
            show_graph(&root).await?;
        }

        Commands::Daemon { action } => match action {
            DaemonAction::Start => {
                let client = DaemonClient::new(&root);
                if client.is_server_available().await {
                    println!("daemon already running");
                } else {
                    client.get_project_graph().await?;
                    println!("✅ daemon started");
                }
            }
            DaemonAction::Stop => {
                DaemonClient::new(&root).stop().await?;
                println!("✅ daemon stopped");
            }
            DaemonAction::Status => {
                let client = DaemonClient::new(&root);
                if client.is_server_available().await {
                    match client.read_pid() {
                        Some(pid) => println!("daemon running (pid {pid})"),
                        None => println!("daemon running"),
                    }
                } else {
                    println!("daemon not running");
                }
            }
            DaemonAction::Serve => {
                DaemonServer::new(&root)?.run().await?;
            }
        },

        Commands::Cache { action } => {
            let store = CacheStore::new(&root)?;
            match action {
                CacheAction::Stats => {
                    let stats = store.stats()?;
                    println!("📦 cache entries: {}", stats.entries);
                    println!("   disk usage: {} bytes", stats.size_bytes);
                    println!("   location: {}", stats.cache_dir.display());
                }
                CacheAction::Clear => {
                    store.clear()?;
                    println!("🗑️  cache cleared");
                }
            }
        }

        Commands::BatchWorker => {
            strata_core::batch::batch_worker_main().await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let verbose = verbose || std::env::var(ENV_VERBOSE_LOGGING).is_ok_and(|v| v == "true");
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_request(
    targets: Vec<String>,
    projects: ProjectSelection,
    flags: &RunFlags,
) -> RunRequest {
    RunRequest {
        targets,
        projects,
        configuration: flags.configuration.clone(),
        parallel: flags.parallel,
        skip_cache: flags.skip_cache,
        output_style: flags.output_style.into(),
        bail: flags.bail,
        ignore_cycles: flags.ignore_cycles,
    }
}

/// key=value pairs after `--` become a flat option override object
fn parse_overrides(overrides: &[String]) -> Value {
    if overrides.is_empty() {
        return Value::Null;
    }
    let map: serde_json::Map<String, Value> = overrides
        .iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
        })
        .collect();
    Value::Object(map)
}

/// Warm graph from the daemon when enabled and reachable, otherwise an
/// in-process build. A connection drop after first contact stays fatal.
async fn load_graph(
    root: &Path,
    config: &WorkspaceConfig,
    files: &WorkspaceFiles,
) -> Result<(ProjectGraph, Option<Arc<DaemonClient>>)> {
    if daemon_enabled(root, config) {
        let client = Arc::new(DaemonClient::new(root));
        match client.get_project_graph().await {
            Ok(graph) => return Ok((graph, Some(client))),
            Err(e @ StrataError::DaemonConnectionLost(_)) => return Err(e.into()),
            Err(e) => {
                tracing::debug!("daemon unavailable, computing in-process: {e}");
            }
        }
    }
    let graph = ProjectGraphBuilder::new(root, config).build(files)?;
    Ok((graph, None))
}

async fn run_targets(
    root: &Path,
    request: RunRequest,
    changed_files: Option<Vec<String>>,
    overrides: &[String],
) -> Result<i32> {
    let config = WorkspaceConfig::load(root)?;
    let files = WorkspaceFiles::discover(root)?;
    let (graph, daemon) = load_graph(root, &config, &files).await?;

    let project_names: Vec<String> = match &request.projects {
        ProjectSelection::Affected => {
            let ctx = LocatorContext {
                workspace_root: root,
                config: &config,
            };
            let changed = changed_files.unwrap_or_default();
            let result = affected(&graph, &changed, &ctx, &default_locators())?;
            println!(
                "🔍 {} affected project(s) from {} changed file(s)",
                result.affected.len(),
                changed.len()
            );
            result.affected.into_iter().collect()
        }
        ProjectSelection::Named(names) if names.is_empty() => {
            graph.project_names().into_iter().collect()
        }
        ProjectSelection::Named(names) => names.clone(),
    };

    let task_graph = TaskGraphBuilder::new(&graph, &config)
        .ignore_cycles(request.ignore_cycles)
        .build(
            &request.targets,
            &project_names,
            request.configuration.as_deref(),
            &parse_overrides(overrides),
        )?;

    if task_graph.is_empty() {
        println!("no tasks to run");
        return Ok(0);
    }
    println!(
        "▶ running {} task(s) for target(s) {}",
        task_graph.len(),
        request.targets.join(", ")
    );

    let hasher = TaskHasher::new(root, &graph, &config, &files);
    let cache = Arc::new(CacheStore::new(root)?.with_remote(RemoteCache::try_new()?));
    let runner = Arc::new(ProcessRunner::new(root, &config));
    let tracker: Arc<dyn OutputsTracker> = match daemon {
        Some(client) => Arc::new(DaemonOutputsTracker::new(client)),
        None => Arc::new(InMemoryOutputsTracker::default()),
    };

    let ctx = ExecutionContext {
        hasher: &hasher,
        cache,
        runner,
        tracker,
    };
    let summary = Scheduler::from_request(&request).execute(&ctx, &task_graph).await?;
    print_summary(&summary);
    Ok(summary.exit_code)
}

fn print_summary(summary: &RunSummary) {
    println!();
    for result in &summary.results {
        let icon = match result.status {
            TaskStatus::Success => "✓",
            TaskStatus::Failure => "✖",
            TaskStatus::Skipped => "⏭",
            TaskStatus::LocalCacheHit | TaskStatus::RemoteCacheHit | TaskStatus::UpToDate => "⚡",
        };
        println!("  {icon} {} ({})", result.task_id, result.status.label());
    }
    println!();
    if summary.success {
        println!("✅ successfully ran {} task(s)", summary.results.len());
    } else {
        let failed = summary
            .results
            .iter()
            .filter(|r| r.status.is_failure())
            .count();
        println!("❌ {failed} task(s) failed");
    }
}

/// Keep one watch task alive, reporting every completion event until
/// the executor exits or the user interrupts.
async fn watch_target(
    root: &Path,
    target: &str,
    project: &str,
    configuration: Option<&str>,
) -> Result<()> {
    let config = WorkspaceConfig::load(root)?;
    let files = WorkspaceFiles::discover(root)?;
    let (graph, _) = load_graph(root, &config, &files).await?;

    let task_graph = TaskGraphBuilder::new(&graph, &config).build(
        &[target.to_string()],
        &[project.to_string()],
        configuration,
        &serde_json::Value::Null,
    )?;
    let Some(task) = task_graph
        .tasks
        .values()
        .find(|t| t.project == project && t.target == target)
    else {
        println!("{project} does not define target {target}");
        return Ok(());
    };

    let runner = ProcessRunner::new(root, &config);
    let mut stream = runner.run_watch_task(task, "")?;
    println!("👀 watching {}", task.id);
    while let Some(event) = stream.next_event().await {
        if event.success {
            println!("✓ {} rebuilt", task.id);
        } else {
            println!("✖ {} rebuild failed", task.id);
        }
    }
    println!("watch executor for {} exited", task.id);
    Ok(())
}

async fn show_graph(root: &Path) -> Result<()> {
    let config = WorkspaceConfig::load(root)?;
    let files = WorkspaceFiles::discover(root)?;
    let (graph, _) = load_graph(root, &config, &files).await?;

    println!("📦 projects: {}", graph.nodes.len());
    println!("🔗 external packages: {}", graph.external_nodes.len());
    println!();

    let names: BTreeSet<String> = graph.project_names();
    for name in names {
        let node = &graph.nodes[&name];
        println!("  • {name} ({})", node.root);
        for edge in graph.dependencies_of(&name) {
            println!("      -> {} [{:?}]", edge.target, edge.edge_type);
        }
    }
    Ok(())
}
