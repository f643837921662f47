//! Strata Daemon - warm project graph behind a local socket
//!
//! A long-lived background process holding the project graph and a file
//! watcher; short-lived CLI invocations talk to it over a Unix socket
//! with EOT-framed JSON and fall back to in-process computation when it
//! is unreachable.

pub mod client;
pub mod error;
pub mod messages;
pub mod server;
pub mod state;
pub mod watcher;

pub use client::{daemon_enabled, DaemonClient, DaemonOutputsTracker};
pub use error::DaemonError;
pub use messages::{DaemonRequest, DaemonResponse};
pub use server::DaemonServer;
pub use state::DaemonState;
pub use watcher::FileWatcher;
