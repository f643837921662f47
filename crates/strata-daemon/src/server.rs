//! Daemon Server - Unix socket IPC over EOT-framed JSON
//!
//! Holds the warm project graph and the file watcher. Connections are
//! served concurrently; the shared state is only ever mutated here,
//! never by clients. Graceful shutdown removes the socket path so a
//! stale socket is never mistaken for a live daemon.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::messages::{encode_frame, DaemonRequest, DaemonResponse, FrameSplitter};
use crate::state::DaemonState;
use crate::watcher::FileWatcher;

pub const SOCKET_FILE: &str = "daemon.sock";
pub const PID_FILE: &str = "daemon.pid";
pub const LOG_FILE: &str = "daemon.log";

pub fn socket_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".strata").join(SOCKET_FILE)
}

pub fn pid_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".strata").join(PID_FILE)
}

pub fn log_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".strata").join(LOG_FILE)
}

pub struct DaemonServer {
    workspace_root: PathBuf,
    socket_path: PathBuf,
    state: Arc<Mutex<DaemonState>>,
    watcher: FileWatcher,
}

impl DaemonServer {
    pub fn new(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        let socket_path = socket_path(&workspace_root);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // a leftover socket from a dead daemon must not block binding
        let _ = std::fs::remove_file(&socket_path);

        Ok(Self {
            state: Arc::new(Mutex::new(DaemonState::new(&workspace_root)?)),
            watcher: FileWatcher::new(&workspace_root),
            workspace_root,
            socket_path,
        })
    }

    /// Serve until a STOP request arrives or the listener fails
    pub async fn run(&mut self) -> Result<()> {
        std::fs::write(
            pid_path(&self.workspace_root),
            std::process::id().to_string(),
        )?;

        info!("warming project graph");
        if let Err(e) = self.state.lock().unwrap().rebuild() {
            // a broken workspace config should not kill the daemon;
            // the next request surfaces the error to the client
            error!("initial graph build failed: {e}");
        }
        self.watcher.start()?;

        let listener = UnixListener::bind(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "daemon listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel::<()>();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let state = Arc::clone(&self.state);
                            let shutdown = shutdown_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, state, shutdown).await {
                                    debug!("connection ended: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {e}");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("stop requested");
                    break;
                }
                _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                    let changes = self.watcher.poll();
                    if !changes.is_empty() {
                        debug!(count = changes.len(), "workspace changed, graph invalidated");
                        self.state.lock().unwrap().mark_dirty();
                    }
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        self.watcher.stop();
        let _ = std::fs::remove_file(&self.socket_path);
        let _ = std::fs::remove_file(pid_path(&self.workspace_root));
        info!("daemon stopped");
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    state: Arc<Mutex<DaemonState>>,
    shutdown: mpsc::UnboundedSender<()>,
) -> Result<()> {
    let mut splitter = FrameSplitter::default();
    let mut buffer = [0u8; 4096];

    loop {
        let read = stream.read(&mut buffer).await?;
        if read == 0 {
            return Ok(());
        }
        for frame in splitter.push(&buffer[..read]) {
            let (response, stop) = dispatch(&frame, &state);
            stream.write_all(&encode_frame(&response)?).await?;
            if stop {
                let _ = shutdown.send(());
                return Ok(());
            }
        }
    }
}

/// Handle one request frame; the bool asks the accept loop to stop
fn dispatch(frame: &str, state: &Mutex<DaemonState>) -> (DaemonResponse, bool) {
    let request: DaemonRequest = match serde_json::from_str(frame) {
        Ok(request) => request,
        Err(e) => {
            return (
                DaemonResponse::Error {
                    message: format!("unrecognized request: {e}"),
                },
                false,
            )
        }
    };
    debug!(?request, "request");

    let response = match request {
        DaemonRequest::RequestProjectGraph => {
            match state.lock().unwrap().project_graph() {
                Ok(graph) => DaemonResponse::ProjectGraph {
                    project_graph: graph.clone(),
                },
                Err(e) => DaemonResponse::Error {
                    message: e.to_string(),
                },
            }
        }
        DaemonRequest::ProcessInBackground { name, .. } => match name.as_str() {
            "recompute-project-graph" => {
                let mut state = state.lock().unwrap();
                state.mark_dirty();
                match state.rebuild() {
                    Ok(()) => DaemonResponse::BackgroundResult {
                        result: Value::Null,
                    },
                    Err(e) => DaemonResponse::Error {
                        message: e.to_string(),
                    },
                }
            }
            other => DaemonResponse::Error {
                message: format!("unknown background unit of work: \"{other}\""),
            },
        },
        DaemonRequest::RecordOutputsHash { outputs, hash } => {
            match state.lock().unwrap().record_outputs_hash(&outputs, &hash) {
                Ok(()) => DaemonResponse::Ok,
                Err(e) => DaemonResponse::Error {
                    message: e.to_string(),
                },
            }
        }
        DaemonRequest::OutputsHashesMatch { outputs, hash } => DaemonResponse::OutputsHashesMatch {
            matches: state.lock().unwrap().outputs_hashes_match(&outputs, &hash),
        },
        DaemonRequest::Stop => return (DaemonResponse::Ok, true),
    };
    (response, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_answers_outputs_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let state = Mutex::new(DaemonState::new(dir.path()).unwrap());

        let record = serde_json::to_string(&DaemonRequest::RecordOutputsHash {
            outputs: vec!["dist".into()],
            hash: "h1".into(),
        })
        .unwrap();
        let (response, stop) = dispatch(&record, &state);
        assert!(matches!(response, DaemonResponse::Ok));
        assert!(!stop);

        let query = serde_json::to_string(&DaemonRequest::OutputsHashesMatch {
            outputs: vec!["dist".into()],
            hash: "h1".into(),
        })
        .unwrap();
        let (response, _) = dispatch(&query, &state);
        assert!(matches!(
            response,
            DaemonResponse::OutputsHashesMatch { matches: true }
        ));
    }

    #[test]
    fn dispatch_rejects_unknown_background_work() {
        let dir = tempfile::tempdir().unwrap();
        let state = Mutex::new(DaemonState::new(dir.path()).unwrap());
        let request = serde_json::to_string(&DaemonRequest::ProcessInBackground {
            name: "mystery".into(),
            payload: Value::Null,
        })
        .unwrap();
        let (response, _) = dispatch(&request, &state);
        assert!(matches!(response, DaemonResponse::Error { .. }));
    }

    #[test]
    fn stop_request_asks_the_loop_to_exit() {
        let dir = tempfile::tempdir().unwrap();
        let state = Mutex::new(DaemonState::new(dir.path()).unwrap());
        let request = serde_json::to_string(&DaemonRequest::Stop).unwrap();
        let (response, stop) = dispatch(&request, &state);
        assert!(matches!(response, DaemonResponse::Ok));
        assert!(stop);
    }
}
