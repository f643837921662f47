//! Daemon Client - used by every CLI invocation
//!
//! The daemon is a latency optimization, never a correctness
//! dependency: when the socket is unreachable before first contact the
//! caller silently computes in-process instead. A connection drop after
//! first contact is fatal for the invocation (state may be
//! inconsistent) and tells the user to retry. All requests share one
//! connection, serialized by an internal lock.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

use strata_core::cache::OutputsTracker;
use strata_core::config::{WorkspaceConfig, ENV_DAEMON};
use strata_core::error::{Result, StrataError};
use strata_core::project_graph::ProjectGraph;

use crate::messages::{encode_frame, DaemonRequest, DaemonResponse, FrameSplitter};
use crate::server::{log_path, pid_path, socket_path};

const START_ATTEMPTS: usize = 200;
const START_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Daemon enablement is a tri-state: the `STRATA_DAEMON` env override
/// wins, CI auto-disables, then the explicit workspace option applies.
/// A workspace without `strata.json` never gets a daemon.
pub fn daemon_enabled(workspace_root: &Path, config: &WorkspaceConfig) -> bool {
    match std::env::var(ENV_DAEMON).ok().as_deref() {
        Some("true") => return true,
        Some("false") => return false,
        _ => {}
    }
    if is_ci() {
        return false;
    }
    if !WorkspaceConfig::exists(workspace_root) {
        return false;
    }
    config.use_daemon_process.unwrap_or(true)
}

fn is_ci() -> bool {
    std::env::var("CI").is_ok_and(|value| !value.is_empty() && value != "false")
}

struct Connection {
    stream: UnixStream,
    splitter: FrameSplitter,
}

pub struct DaemonClient {
    workspace_root: PathBuf,
    socket_path: PathBuf,
    connection: Mutex<Option<Connection>>,
}

impl DaemonClient {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        Self {
            socket_path: socket_path(&workspace_root),
            workspace_root,
            connection: Mutex::new(None),
        }
    }

    pub async fn is_server_available(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(pid_path(&self.workspace_root))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub async fn get_project_graph(&self) -> Result<ProjectGraph> {
        match self.send(DaemonRequest::RequestProjectGraph).await? {
            DaemonResponse::ProjectGraph { project_graph } => Ok(project_graph),
            DaemonResponse::Error { message } => Err(StrataError::Config(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn process_in_background(&self, name: &str, payload: Value) -> Result<Value> {
        let request = DaemonRequest::ProcessInBackground {
            name: name.to_string(),
            payload,
        };
        match self.send(request).await? {
            DaemonResponse::BackgroundResult { result } => Ok(result),
            DaemonResponse::Error { message } => Err(StrataError::Config(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn record_outputs_hash(&self, outputs: &[String], hash: &str) -> Result<()> {
        let request = DaemonRequest::RecordOutputsHash {
            outputs: outputs.to_vec(),
            hash: hash.to_string(),
        };
        match self.send(request).await? {
            DaemonResponse::Ok => Ok(()),
            DaemonResponse::Error { message } => Err(StrataError::Config(message)),
            other => Err(unexpected(other)),
        }
    }

    pub async fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> Result<bool> {
        let request = DaemonRequest::OutputsHashesMatch {
            outputs: outputs.to_vec(),
            hash: hash.to_string(),
        };
        match self.send(request).await? {
            DaemonResponse::OutputsHashesMatch { matches } => Ok(matches),
            DaemonResponse::Error { message } => Err(StrataError::Config(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Graceful shutdown; removing the socket path afterwards guarantees
    /// a stale socket is never mistaken for a live daemon.
    pub async fn stop(&self) -> Result<()> {
        if self.is_server_available().await {
            let _ = self.send(DaemonRequest::Stop).await;
        }
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(pid_path(&self.workspace_root));
        Ok(())
    }

    async fn send(&self, request: DaemonRequest) -> Result<DaemonResponse> {
        let mut guard = self.connection.lock().await;

        if guard.is_none() {
            if !self.is_server_available().await {
                self.start_in_background().await?;
            }
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                StrataError::DaemonStart(format!("could not connect to daemon socket: {e}"))
            })?;
            *guard = Some(Connection {
                stream,
                splitter: FrameSplitter::default(),
            });
        }
        let Some(connection) = guard.as_mut() else {
            return Err(StrataError::DaemonStart("connection unavailable".into()));
        };

        let frame = encode_frame(&request).map_err(StrataError::Json)?;
        if let Err(e) = connection.stream.write_all(&frame).await {
            *guard = None;
            return Err(StrataError::DaemonConnectionLost(e.to_string()));
        }

        let mut buffer = [0u8; 4096];
        loop {
            let read = match connection.stream.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    *guard = None;
                    return Err(StrataError::DaemonConnectionLost(e.to_string()));
                }
            };
            if read == 0 {
                *guard = None;
                return Err(StrataError::DaemonConnectionLost(
                    "daemon closed the connection".into(),
                ));
            }
            if let Some(frame) = connection.splitter.push(&buffer[..read]).into_iter().next() {
                let response: DaemonResponse = serde_json::from_str(&frame).map_err(|e| {
                    StrataError::DaemonConnectionLost(format!(
                        "could not deserialize daemon response: {e}"
                    ))
                })?;
                return Ok(response);
            }
        }
    }

    /// Spawn a detached `daemon serve` process logging to the daemon log
    /// file, then poll the socket until connectable or give up.
    async fn start_in_background(&self) -> Result<()> {
        let log = log_path(&self.workspace_root);
        if let Some(parent) = log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)?;
        let stderr = stdout.try_clone()?;

        let exe = std::env::current_exe()?;
        std::process::Command::new(exe)
            .args(["daemon", "serve"])
            .current_dir(&self.workspace_root)
            .stdin(std::process::Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| StrataError::DaemonStart(format!("could not spawn daemon: {e}")))?;
        debug!("daemon spawned, waiting for socket");

        for _ in 0..START_ATTEMPTS {
            if self.is_server_available().await {
                return Ok(());
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
        Err(StrataError::DaemonStart(format!(
            "daemon did not become reachable\n{}",
            log_tail(&log)
        )))
    }
}

fn unexpected(response: DaemonResponse) -> StrataError {
    StrataError::DaemonConnectionLost(format!("unexpected daemon response: {response:?}"))
}

/// Last lines of the daemon log, for start-failure diagnostics
fn log_tail(path: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(path) else {
        return String::from("(no daemon log)");
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(20);
    lines[start..].join("\n")
}

/// Bridges the scheduler's synchronous bookkeeping calls onto the async
/// daemon connection; failures degrade silently to "no record".
pub struct DaemonOutputsTracker {
    client: Arc<DaemonClient>,
}

impl DaemonOutputsTracker {
    pub fn new(client: Arc<DaemonClient>) -> Self {
        Self { client }
    }
}

impl OutputsTracker for DaemonOutputsTracker {
    fn record_outputs_hash(&self, outputs: &[String], hash: &str) {
        let client = Arc::clone(&self.client);
        let result = tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(client.record_outputs_hash(outputs, hash))
        });
        if let Err(e) = result {
            debug!("daemon outputs-hash record failed: {e}");
        }
    }

    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> bool {
        let client = Arc::clone(&self.client);
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(client.outputs_hashes_match(outputs, hash))
        })
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_env<T>(key: &str, value: Option<&str>, f: impl FnOnce() -> T) -> T {
        let previous = std::env::var(key).ok();
        match value {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
        let result = f();
        match previous {
            Some(v) => std::env::set_var(key, v),
            None => std::env::remove_var(key),
        }
        result
    }

    // one test body so the env-var mutations cannot race each other
    #[test]
    fn daemon_enablement_tri_state() {
        let dir = tempfile::tempdir().unwrap();
        let default_config = WorkspaceConfig::default();
        let opted_out = WorkspaceConfig {
            use_daemon_process: Some(false),
            ..WorkspaceConfig::default()
        };

        // env override wins over both CI and the explicit option
        with_env("CI", Some("true"), || {
            with_env(ENV_DAEMON, Some("true"), || {
                assert!(daemon_enabled(dir.path(), &opted_out));
            });
            with_env(ENV_DAEMON, Some("false"), || {
                assert!(!daemon_enabled(dir.path(), &opted_out));
            });
        });

        // a workspace without strata.json never gets a daemon
        with_env(ENV_DAEMON, None, || {
            with_env("CI", None, || {
                assert!(!daemon_enabled(dir.path(), &default_config));
            });
        });

        std::fs::write(dir.path().join("strata.json"), "{}").unwrap();
        with_env(ENV_DAEMON, None, || {
            with_env("CI", Some("true"), || {
                assert!(!daemon_enabled(dir.path(), &default_config));
            });
            with_env("CI", None, || {
                assert!(daemon_enabled(dir.path(), &default_config));
                assert!(!daemon_enabled(dir.path(), &opted_out));
            });
        });
    }
}
