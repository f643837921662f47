//! File Watcher - invalidates the warm graph on workspace changes
//!
//! notify-based (FSEvents on macOS, inotify on Linux); events are
//! drained by polling from the server loop, which marks daemon state
//! dirty rather than rebuilding eagerly.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;

const IGNORED_DIRS: &[&str] = &[".git", ".strata", "node_modules", "dist", "target", ".next"];

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

pub struct FileWatcher {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    receiver: Option<Receiver<std::result::Result<Event, notify::Error>>>,
}

impl FileWatcher {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            watcher: None,
            receiver: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let (tx, rx) = channel();
        let config = Config::default().with_poll_interval(Duration::from_millis(100));
        let mut watcher = RecommendedWatcher::new(tx, config)?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        self.watcher = Some(watcher);
        self.receiver = Some(rx);
        info!(root = %self.root.display(), "file watcher started");
        Ok(())
    }

    pub fn stop(&mut self) {
        self.watcher = None;
        self.receiver = None;
    }

    /// Drain pending events without blocking
    pub fn poll(&self) -> Vec<FileChange> {
        let mut changes = Vec::new();
        let Some(rx) = &self.receiver else {
            return changes;
        };

        while let Ok(result) = rx.try_recv() {
            match result {
                Ok(event) => {
                    let kind = match event.kind {
                        notify::EventKind::Create(_) => ChangeKind::Create,
                        notify::EventKind::Modify(_) => ChangeKind::Modify,
                        notify::EventKind::Remove(_) => ChangeKind::Delete,
                        _ => continue,
                    };
                    for path in event.paths {
                        if should_ignore(&path) {
                            continue;
                        }
                        debug!(path = %path.display(), ?kind, "file change");
                        changes.push(FileChange { path, kind });
                    }
                }
                Err(e) => warn!("watch error: {e}"),
            }
        }
        changes
    }
}

fn should_ignore(path: &Path) -> bool {
    path.components().any(|component| {
        matches!(
            component,
            std::path::Component::Normal(name)
                if IGNORED_DIRS.iter().any(|dir| name == *dir)
        )
    })
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_and_dependency_dirs_are_ignored() {
        assert!(should_ignore(Path::new("/ws/node_modules/lodash/index.js")));
        assert!(should_ignore(Path::new("/ws/.strata/cache/h/meta.json")));
        assert!(should_ignore(Path::new("/ws/libs/a/dist/out.js")));
        assert!(!should_ignore(Path::new("/ws/libs/a/src/index.ts")));
    }
}
