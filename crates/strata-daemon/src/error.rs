//! Daemon-side error type; the client surfaces core errors instead so
//! the CLI handles both paths uniformly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Core(#[from] strata_core::StrataError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("state db error: {0}")]
    Db(#[from] sled::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("daemon state error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
