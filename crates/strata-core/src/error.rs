//! Error taxonomy for the orchestration core
//!
//! Configuration and cycle errors are fatal before any task runs.
//! Cache corruption is recovered locally (treated as a miss).
//! Task failures are recorded per task and never abort sibling branches
//! unless bail is enabled.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrataError {
    /// Malformed or ambiguous project/target configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Task dependency cycle (fatal unless ignore-cycles is set)
    #[error("task graph cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    /// A locator or CLI argument referenced a project that does not exist
    #[error("unknown project: \"{0}\"")]
    UnknownProject(String),

    /// A cache entry already exists under this hash with different content
    #[error("cache entry for {hash} already exists with different content")]
    CacheCorruption { hash: String },

    /// A child process exited non-zero
    #[error("task {task_id} exited with code {code}")]
    TaskExecution { task_id: String, code: i32 },

    /// The daemon could not be started or reached during startup
    #[error("failed to start daemon: {0}")]
    DaemonStart(String),

    /// The daemon connection dropped after it had been established
    #[error("daemon connection lost: {0}. Please rerun the command, which will restart the daemon")]
    DaemonConnectionLost(String),

    #[error("invalid glob pattern \"{pattern}\": {source}")]
    Glob {
        pattern: String,
        source: glob::PatternError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Errors that abort the invocation before any task is attempted
    pub fn is_fatal_before_run(&self) -> bool {
        matches!(
            self,
            StrataError::Config(_) | StrataError::Cycle { .. } | StrataError::UnknownProject(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_formats_path() {
        let err = StrataError::Cycle {
            path: vec!["a:build".into(), "b:build".into(), "a:build".into()],
        };
        assert_eq!(
            err.to_string(),
            "task graph cycle detected: a:build -> b:build -> a:build"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(StrataError::Config("bad".into()).is_fatal_before_run());
        assert!(!StrataError::CacheCorruption { hash: "h".into() }.is_fatal_before_run());
    }
}
