//! Cache Store - content-addressed task results
//!
//! Layout: `.strata/cache/<hash>/` holding `meta.json` ({code, success}),
//! `terminal-output`, and an `outputs/` snapshot of declared output
//! files. Entries are written once via a temp-dir rename and never
//! mutated; a conflicting write for an existing hash is corruption,
//! reported and treated as a miss by callers.

use glob::MatchOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

use crate::error::{Result, StrataError};
use crate::remote_cache::RemoteCache;
use crate::workspace_files::normalize_path;

const META_FILE: &str = "meta.json";
const TERMINAL_OUTPUT_FILE: &str = "terminal-output";
const OUTPUTS_DIR: &str = "outputs";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntryMeta {
    pub code: i32,
    pub success: bool,
}

/// A cached task result as consumed by the scheduler
#[derive(Debug, Clone)]
pub struct CachedResult {
    pub code: i32,
    pub success: bool,
    pub terminal_output: String,
}

/// Where a hit was served from; surfaced to the user as distinct flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

/// Whether a restore copied anything or found outputs already in place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    MatchedExisting,
    Restored,
}

/// Serialized entry shape used by the remote backend
#[derive(Serialize, Deserialize)]
struct CacheBundle {
    meta: CacheEntryMeta,
    terminal_output: String,
    files: Vec<BundleFile>,
}

#[derive(Serialize, Deserialize)]
struct BundleFile {
    path: String,
    data: Vec<u8>,
}

pub struct CacheStore {
    workspace_root: PathBuf,
    cache_dir: PathBuf,
    remote: Option<RemoteCache>,
}

impl CacheStore {
    pub fn new(workspace_root: impl AsRef<Path>) -> Result<Self> {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        let cache_dir = workspace_root.join(".strata").join("cache");
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            workspace_root,
            cache_dir,
            remote: None,
        })
    }

    pub fn with_remote(mut self, remote: Option<RemoteCache>) -> Self {
        self.remote = remote;
        self
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(hash)
    }

    /// Look up a hash locally, then remotely. A remote hit is
    /// materialized into the local store before being returned.
    pub async fn get(&self, hash: &str) -> Result<Option<(CachedResult, CacheSource)>> {
        if let Some(result) = self.read_local(hash)? {
            return Ok(Some((result, CacheSource::Local)));
        }

        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let Some(data) = remote.download(hash).await? else {
            return Ok(None);
        };
        let bundle: CacheBundle = serde_json::from_slice(&data)?;
        self.materialize_bundle(hash, &bundle)?;

        Ok(self
            .read_local(hash)?
            .map(|result| (result, CacheSource::Remote)))
    }

    fn read_local(&self, hash: &str) -> Result<Option<CachedResult>> {
        let dir = self.entry_dir(hash);
        if !dir.join(META_FILE).exists() {
            return Ok(None);
        }
        let meta: CacheEntryMeta = serde_json::from_str(&fs::read_to_string(dir.join(META_FILE))?)?;
        let terminal_output = fs::read_to_string(dir.join(TERMINAL_OUTPUT_FILE)).unwrap_or_default();
        Ok(Some(CachedResult {
            code: meta.code,
            success: meta.success,
            terminal_output,
        }))
    }

    /// Store a finished task. A glob matching zero files is not an error.
    /// Re-storing identical content is a no-op; different content under
    /// the same hash is `CacheCorruption` and leaves the entry intact.
    pub fn put(
        &self,
        hash: &str,
        output_globs: &[String],
        terminal_output: &str,
        code: i32,
    ) -> Result<()> {
        let staging = self
            .cache_dir
            .join(format!("{hash}.tmp-{}", std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let meta = CacheEntryMeta {
            code,
            success: code == 0,
        };
        fs::write(staging.join(META_FILE), serde_json::to_string(&meta)?)?;
        fs::write(staging.join(TERMINAL_OUTPUT_FILE), terminal_output)?;

        let outputs_dir = staging.join(OUTPUTS_DIR);
        fs::create_dir_all(&outputs_dir)?;
        for file in files_matching_globs(&self.workspace_root, output_globs)? {
            let source = self.workspace_root.join(&file);
            let dest = outputs_dir.join(&file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &dest)?;
        }

        let dir = self.entry_dir(hash);
        if dir.exists() {
            let identical = dirs_identical(&dir, &staging)?;
            fs::remove_dir_all(&staging)?;
            if identical {
                return Ok(());
            }
            return Err(StrataError::CacheCorruption {
                hash: hash.to_string(),
            });
        }

        match fs::rename(&staging, &dir) {
            Ok(()) => Ok(()),
            // lost a race against a concurrent writer for the same hash;
            // same hash implies same content, so this is a no-op
            Err(_) if dir.exists() => {
                let _ = fs::remove_dir_all(&staging);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Restore declared outputs from the snapshot. Files on disk that do
    /// not match any declared glob are never touched. Reports
    /// `MatchedExisting` when the on-disk glob file list and contents
    /// already equal the snapshot.
    pub fn restore_outputs(&self, hash: &str, output_globs: &[String]) -> Result<RestoreOutcome> {
        let outputs_dir = self.entry_dir(hash).join(OUTPUTS_DIR);
        let snapshot = snapshot_files(&outputs_dir);
        let wanted: Vec<String> = {
            let compiled = crate::workspace_files::compile_globs(output_globs)?;
            snapshot
                .into_iter()
                .filter(|f| {
                    crate::workspace_files::matches_any(&compiled, f)
                        || prefix_matches(output_globs, f)
                })
                .collect()
        };

        let on_disk = files_matching_globs(&self.workspace_root, output_globs)?;
        let wanted_set: BTreeSet<String> = wanted.iter().cloned().collect();
        if on_disk == wanted_set && self.contents_equal(&outputs_dir, &wanted)? {
            return Ok(RestoreOutcome::MatchedExisting);
        }

        for file in &wanted {
            let source = outputs_dir.join(file);
            let dest = self.workspace_root.join(file);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&source, &dest)?;
        }
        Ok(RestoreOutcome::Restored)
    }

    fn contents_equal(&self, outputs_dir: &Path, files: &[String]) -> Result<bool> {
        for file in files {
            let cached = fs::read(outputs_dir.join(file))?;
            let Ok(current) = fs::read(self.workspace_root.join(file)) else {
                return Ok(false);
            };
            if blake3::hash(&cached) != blake3::hash(&current) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Serialize an entry for the remote backend
    pub fn bundle(&self, hash: &str) -> Result<Vec<u8>> {
        let dir = self.entry_dir(hash);
        let meta: CacheEntryMeta = serde_json::from_str(&fs::read_to_string(dir.join(META_FILE))?)?;
        let terminal_output = fs::read_to_string(dir.join(TERMINAL_OUTPUT_FILE)).unwrap_or_default();
        let outputs_dir = dir.join(OUTPUTS_DIR);
        let files = snapshot_files(&outputs_dir)
            .into_iter()
            .map(|path| {
                Ok(BundleFile {
                    data: fs::read(outputs_dir.join(&path))?,
                    path,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::to_vec(&CacheBundle {
            meta,
            terminal_output,
            files,
        })?)
    }

    fn materialize_bundle(&self, hash: &str, bundle: &CacheBundle) -> Result<()> {
        let staging = self
            .cache_dir
            .join(format!("{hash}.remote-{}", std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(staging.join(OUTPUTS_DIR))?;
        fs::write(staging.join(META_FILE), serde_json::to_string(&bundle.meta)?)?;
        fs::write(staging.join(TERMINAL_OUTPUT_FILE), &bundle.terminal_output)?;
        for file in &bundle.files {
            let dest = staging.join(OUTPUTS_DIR).join(&file.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(dest, &file.data)?;
        }
        let dir = self.entry_dir(hash);
        match fs::rename(&staging, &dir) {
            Ok(()) => Ok(()),
            Err(_) if dir.exists() => {
                let _ = fs::remove_dir_all(&staging);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fire-and-forget remote upload after a local store
    pub fn push_remote_in_background(&self, hash: &str) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let Ok(data) = self.bundle(hash) else {
            return;
        };
        let hash = hash.to_string();
        tokio::spawn(async move {
            if let Err(e) = remote.upload(&hash, data).await {
                tracing::warn!(hash, "remote cache upload failed: {e}");
            }
        });
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut entries = 0;
        let mut size_bytes = 0;
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                entries += 1;
                for file in WalkDir::new(entry.path())
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    if file.file_type().is_file() {
                        size_bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
                    }
                }
            }
        }
        Ok(CacheStats {
            entries,
            size_bytes,
            cache_dir: self.cache_dir.clone(),
        })
    }

    pub fn clear(&self) -> Result<()> {
        fs::remove_dir_all(&self.cache_dir)?;
        fs::create_dir_all(&self.cache_dir)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub cache_dir: PathBuf,
}

/// Records which hash last produced a set of outputs, so an unchanged
/// workspace can report "already up to date" without re-reading files.
/// The daemon offers a memory-resident implementation shared across
/// invocations.
pub trait OutputsTracker: Send + Sync {
    fn record_outputs_hash(&self, outputs: &[String], hash: &str);
    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> bool;
}

/// Process-local fallback tracker used when no daemon is reachable
#[derive(Default)]
pub struct InMemoryOutputsTracker {
    records: Mutex<std::collections::HashMap<String, String>>,
}

pub fn outputs_key(outputs: &[String]) -> String {
    let mut sorted: Vec<&String> = outputs.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("|")
}

impl OutputsTracker for InMemoryOutputsTracker {
    fn record_outputs_hash(&self, outputs: &[String], hash: &str) {
        self.records
            .lock()
            .unwrap()
            .insert(outputs_key(outputs), hash.to_string());
    }

    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> bool {
        self.records
            .lock()
            .unwrap()
            .get(&outputs_key(outputs))
            .is_some_and(|recorded| recorded == hash)
    }
}

/// Files currently on disk matching the globs, workspace-relative.
/// A glob naming a directory matches every file under it.
fn files_matching_globs(root: &Path, globs: &[String]) -> Result<BTreeSet<String>> {
    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };
    let mut matched = BTreeSet::new();
    for pattern in globs {
        let absolute = root.join(pattern);
        let paths = glob::glob_with(&absolute.to_string_lossy(), options).map_err(|source| {
            StrataError::Glob {
                pattern: pattern.clone(),
                source,
            }
        })?;
        for path in paths.filter_map(|p| p.ok()) {
            if path.is_dir() {
                for file in WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
                    if file.file_type().is_file() {
                        if let Ok(rel) = file.path().strip_prefix(root) {
                            matched.insert(normalize_path(rel));
                        }
                    }
                }
            } else if path.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    matched.insert(normalize_path(rel));
                }
            }
        }
    }
    Ok(matched)
}

/// True when the file lives under a glob that names a plain directory
fn prefix_matches(globs: &[String], file: &str) -> bool {
    globs
        .iter()
        .filter(|g| !g.contains('*') && !g.contains('?') && !g.contains('['))
        .any(|g| file.starts_with(&format!("{}/", g.trim_end_matches('/'))))
}

/// All files under a snapshot directory, relative and sorted
fn snapshot_files(outputs_dir: &Path) -> Vec<String> {
    if !outputs_dir.exists() {
        return Vec::new();
    }
    let mut files: Vec<String> = WalkDir::new(outputs_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            e.path()
                .strip_prefix(outputs_dir)
                .ok()
                .map(normalize_path)
        })
        .collect();
    files.sort();
    files
}

/// Byte-for-byte comparison of two entry directories
fn dirs_identical(a: &Path, b: &Path) -> Result<bool> {
    let list = |dir: &Path| -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.path().strip_prefix(dir).ok().map(normalize_path))
            .collect();
        files.sort();
        files
    };
    let files_a = list(a);
    if files_a != list(b) {
        return Ok(false);
    }
    for file in files_a {
        if fs::read(a.join(&file))? != fs::read(b.join(&file))? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        write(dir.path(), "dist/out.txt", "built");

        store
            .put("abc123", &["dist/*.txt".into()], "compiled ok\n", 0)
            .unwrap();

        let (result, source) = store.get("abc123").await.unwrap().unwrap();
        assert_eq!(source, CacheSource::Local);
        assert!(result.success);
        assert_eq!(result.code, 0);
        assert_eq!(result.terminal_output, "compiled ok\n");
    }

    #[tokio::test]
    async fn second_identical_put_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        write(dir.path(), "dist/out.txt", "built");

        store
            .put("abc123", &["dist/*.txt".into()], "ok", 0)
            .unwrap();
        store
            .put("abc123", &["dist/*.txt".into()], "ok", 0)
            .unwrap();

        assert!(store.get("abc123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn conflicting_put_is_corruption_and_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        write(dir.path(), "dist/out.txt", "built");

        store
            .put("abc123", &["dist/*.txt".into()], "first", 0)
            .unwrap();

        write(dir.path(), "dist/out.txt", "tampered");
        let err = store
            .put("abc123", &["dist/*.txt".into()], "second", 0)
            .unwrap_err();
        assert!(matches!(err, StrataError::CacheCorruption { .. }));

        let (result, _) = store.get("abc123").await.unwrap().unwrap();
        assert_eq!(result.terminal_output, "first");
    }

    #[test]
    fn restore_leaves_unmatched_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let globs = vec!["dist/*.txt".to_string()];
        write(dir.path(), "dist/a.txt", "alpha");
        write(dir.path(), "dist/b.txt", "beta");
        store.put("h1", &globs, "", 0).unwrap();

        // simulate a later state: outputs gone, an unrelated file present
        fs::remove_file(dir.path().join("dist/a.txt")).unwrap();
        fs::remove_file(dir.path().join("dist/b.txt")).unwrap();
        write(dir.path(), "dist/unrelated.ts", "keep me");

        let outcome = store.restore_outputs("h1", &globs).unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored);
        assert_eq!(
            fs::read_to_string(dir.path().join("dist/a.txt")).unwrap(),
            "alpha"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("dist/unrelated.ts")).unwrap(),
            "keep me"
        );
    }

    #[test]
    fn unchanged_outputs_report_matched_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let globs = vec!["dist/*.txt".to_string()];
        write(dir.path(), "dist/a.txt", "alpha");
        store.put("h1", &globs, "", 0).unwrap();

        assert_eq!(
            store.restore_outputs("h1", &globs).unwrap(),
            RestoreOutcome::MatchedExisting
        );

        fs::remove_file(dir.path().join("dist/a.txt")).unwrap();
        assert_eq!(
            store.restore_outputs("h1", &globs).unwrap(),
            RestoreOutcome::Restored
        );
    }

    #[test]
    fn empty_glob_match_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        store
            .put("h2", &["dist/*.nothing".into()], "no outputs", 1)
            .unwrap();
        let result = store.read_local("h2").unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.code, 1);
    }

    #[test]
    fn directory_output_snapshots_all_files_under_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path()).unwrap();
        let globs = vec!["dist/lib".to_string()];
        write(dir.path(), "dist/lib/index.js", "js");
        write(dir.path(), "dist/lib/nested/util.js", "util");
        store.put("h3", &globs, "", 0).unwrap();

        fs::remove_dir_all(dir.path().join("dist")).unwrap();
        let outcome = store.restore_outputs("h3", &globs).unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored);
        assert!(dir.path().join("dist/lib/nested/util.js").exists());
    }

    #[test]
    fn in_memory_tracker_matches_recorded_hash() {
        let tracker = InMemoryOutputsTracker::default();
        let outputs = vec!["dist/a".to_string(), "dist/b".to_string()];
        assert!(!tracker.outputs_hashes_match(&outputs, "h"));
        tracker.record_outputs_hash(&outputs, "h");
        assert!(tracker.outputs_hashes_match(&outputs, "h"));
        // order-insensitive key
        let reordered = vec!["dist/b".to_string(), "dist/a".to_string()];
        assert!(tracker.outputs_hashes_match(&reordered, "h"));
        assert!(!tracker.outputs_hashes_match(&outputs, "other"));
    }
}
