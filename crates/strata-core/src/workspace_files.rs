//! Workspace file enumeration and glob matching
//!
//! One sorted, `/`-separated, workspace-relative file list is computed per
//! graph build (or kept warm by the daemon) and shared by the hasher and
//! the affected resolver. Respects .gitignore patterns.

use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

const INTERNAL_DIR: &str = ".strata";

/// Token replaced with the project root in input/output globs
pub const PROJECT_ROOT_TOKEN: &str = "{projectRoot}";
/// Token replaced with the (empty) workspace-relative prefix
pub const WORKSPACE_ROOT_TOKEN: &str = "{workspaceRoot}";

/// Snapshot of all files in the workspace, relative to its root
#[derive(Debug, Clone)]
pub struct WorkspaceFiles {
    root: PathBuf,
    files: Vec<String>,
}

impl WorkspaceFiles {
    /// Walk the workspace, honoring .gitignore, skipping internal state
    pub fn discover(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let mut files: Vec<String> = WalkBuilder::new(&root)
            .hidden(false)
            .ignore(true)
            .git_ignore(true)
            .git_global(true)
            .filter_entry(|entry| entry.file_name() != INTERNAL_DIR && entry.file_name() != ".git")
            .build()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&root)
                    .ok()
                    .map(|rel| normalize_path(rel))
            })
            .collect();

        files.sort();
        files.dedup();

        Ok(Self { root, files })
    }

    /// Build from an already-known file list (daemon refresh, tests)
    pub fn from_files(root: impl AsRef<Path>, mut files: Vec<String>) -> Self {
        files.sort();
        files.dedup();
        Self {
            root: root.as_ref().to_path_buf(),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Files whose path starts with the given workspace-relative directory
    pub fn files_under<'a>(&'a self, rel_dir: &str) -> impl Iterator<Item = &'a str> {
        let prefix = if rel_dir.is_empty() || rel_dir == "." {
            String::new()
        } else {
            format!("{}/", rel_dir.trim_end_matches('/'))
        };
        self.files
            .iter()
            .map(|f| f.as_str())
            .filter(move |f| prefix.is_empty() || f.starts_with(&prefix))
    }

    /// All files matching any of the given glob patterns, sorted
    pub fn matching(&self, patterns: &[String]) -> Result<Vec<String>> {
        let compiled = compile_globs(patterns)?;
        Ok(self
            .files
            .iter()
            .filter(|f| matches_any(&compiled, f))
            .cloned()
            .collect())
    }
}

/// Compile patterns once for repeated matching
pub fn compile_globs(patterns: &[String]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p).map_err(|source| StrataError::Glob {
                pattern: p.clone(),
                source,
            })
        })
        .collect()
}

/// Glob matching with literal separators, so `dist/*.txt` does not cross
/// into subdirectories while `**` still recurses.
pub fn matches_any(patterns: &[Pattern], path: &str) -> bool {
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };
    patterns.iter().any(|p| p.matches_with(path, options))
}

/// Workspace-relative path with forward slashes, independent of platform
pub fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Resolve `{projectRoot}` / `{workspaceRoot}` tokens in a glob to a
/// workspace-relative pattern.
pub fn interpolate_tokens(pattern: &str, project_root: &str) -> String {
    let replaced = pattern
        .replace(PROJECT_ROOT_TOKEN, project_root)
        .replace(&format!("{WORKSPACE_ROOT_TOKEN}/"), "")
        .replace(WORKSPACE_ROOT_TOKEN, "");
    // A leading "./" or "/" left over from token substitution is noise
    replaced
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn discovers_relative_sorted_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "libs/a/src/index.ts", "x");
        write(dir.path(), "apps/web/main.ts", "y");
        write(dir.path(), ".strata/cache/junk", "z");

        let files = WorkspaceFiles::discover(dir.path()).unwrap();
        assert_eq!(files.files(), &["apps/web/main.ts", "libs/a/src/index.ts"]);
    }

    #[test]
    fn single_star_does_not_cross_directories() {
        let files = WorkspaceFiles::from_files(
            "/tmp/ws",
            vec![
                "dist/a.txt".into(),
                "dist/nested/b.txt".into(),
                "dist/c.js".into(),
            ],
        );

        let matched = files.matching(&["dist/*.txt".into()]).unwrap();
        assert_eq!(matched, vec!["dist/a.txt".to_string()]);

        let matched = files.matching(&["dist/**/*.txt".into()]).unwrap();
        assert_eq!(
            matched,
            vec!["dist/a.txt".to_string(), "dist/nested/b.txt".to_string()]
        );
    }

    #[test]
    fn interpolates_root_tokens() {
        assert_eq!(
            interpolate_tokens("{projectRoot}/**/*", "libs/a"),
            "libs/a/**/*"
        );
        assert_eq!(
            interpolate_tokens("{workspaceRoot}/dist/libs/a", "libs/a"),
            "dist/libs/a"
        );
    }

    #[test]
    fn files_under_scopes_by_prefix() {
        let files = WorkspaceFiles::from_files(
            "/tmp/ws",
            vec!["libs/a/x.ts".into(), "libs/ab/y.ts".into()],
        );
        let under: Vec<_> = files.files_under("libs/a").collect();
        assert_eq!(under, vec!["libs/a/x.ts"]);
    }
}
