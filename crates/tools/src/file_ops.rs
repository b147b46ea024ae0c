//! Sandboxed file operations.
//!
//! Every call goes through the [`PolicyEngine`] before the filesystem is
//! touched. Writes are atomic (`<path>.tmp` then rename) and optionally backed
//! up to `<path>.bak`. The set of touched files and the cumulative diff size
//! are tracked per session and feed the run limits.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use regex_lite::RegexBuilder;
use sandcastle_core::ToolError;
use sandcastle_security::{DiffStats, Glob, PolicyEngine, ResolvedPath};
use serde::Serialize;
use tracing::{debug, warn};

use crate::patch::Patch;

/// Directories never descended into by `list_files`.
pub const PRUNED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "target",
    ".next",
    "coverage",
    ".sandcastle",
];

/// Upper bound on files scanned by a single search.
pub const MAX_SEARCH_FILES: usize = 500;

/// Longest line fragment returned in a search match.
pub const MAX_MATCH_LINE_CHARS: usize = 200;

pub const DEFAULT_LIST_LIMIT: usize = 200;
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub path: String,
    pub line: usize,
    pub content: String,
    #[serde(rename = "match")]
    pub matched: String,
}

/// What a successful write or patch did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub bytes_written: usize,
    pub created: bool,
    pub lines_added: usize,
    pub lines_removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

#[derive(Debug, Default)]
struct Session {
    touched: BTreeSet<String>,
    lines_added: usize,
    lines_removed: usize,
}

/// Policy-checked file access rooted at the engine's project root.
#[derive(Debug)]
pub struct SandboxedFileOps {
    engine: Arc<PolicyEngine>,
    session: Mutex<Session>,
}

impl SandboxedFileOps {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self {
            engine,
            session: Mutex::new(Session::default()),
        }
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Relative paths written this session, sorted.
    pub fn touched_files(&self) -> Vec<String> {
        self.session().touched.iter().cloned().collect()
    }

    pub fn clear_touched_files(&self) {
        *self.session() = Session::default();
    }

    /// Walk the project and return files matching `glob`, in walk order.
    pub async fn list_files(&self, glob: &str, max_results: usize) -> Result<Vec<String>, ToolError> {
        let matcher = Glob::new(glob).map_err(|e| ToolError::InvalidPattern {
            pattern: glob.to_string(),
            reason: e.to_string(),
        })?;

        let mut found = Vec::new();
        if max_results == 0 {
            return Ok(found);
        }

        // Depth-first; subdirectories are pushed in reverse so they pop in name order
        let mut stack: Vec<PathBuf> = vec![self.engine.root().to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = match read_dir_sorted(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };

            let mut subdirs = Vec::new();
            for (name, path, is_dir) in entries.drain(..) {
                let Some(rel) = self.engine.relative_to_root(&path) else {
                    continue;
                };
                if is_dir {
                    if PRUNED_DIRS.contains(&name.as_str()) {
                        continue;
                    }
                    // Allow globs name files, so directories only get the location and deny checks
                    if self.engine.check_path(&rel).is_ok() {
                        subdirs.push(path);
                    }
                    continue;
                }
                if matcher.is_match(&rel) && self.engine.check_read(&rel).is_ok() {
                    found.push(rel);
                    if found.len() >= max_results {
                        return Ok(found);
                    }
                }
            }
            stack.extend(subdirs.into_iter().rev());
        }

        Ok(found)
    }

    pub async fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.check_read(path)?;
        let metadata = match tokio::fs::metadata(&resolved.absolute).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound {
                    path: path.to_string(),
                });
            }
            Err(e) => return Err(ToolError::io(path, &e)),
        };
        if metadata.is_dir() {
            return Err(ToolError::IsDirectory {
                path: path.to_string(),
            });
        }
        tokio::fs::read_to_string(&resolved.absolute)
            .await
            .map_err(|e| ToolError::io(path, &e))
    }

    /// Replace a file's contents, backing up the previous version first.
    pub async fn write_file(
        &self,
        path: &str,
        content: &str,
        create_backup: bool,
    ) -> Result<FileChange, ToolError> {
        let resolved = self.check_write(path, content.len() as u64)?;
        if resolved.absolute.is_dir() {
            return Err(ToolError::IsDirectory {
                path: path.to_string(),
            });
        }

        let previous = read_if_exists(&resolved.absolute, path).await?;
        let (added, removed) = match &previous {
            Some(old) => line_delta(old, content),
            None => (content.lines().count(), 0),
        };
        self.check_diff(&resolved.relative, added, removed)?;

        self.commit(&resolved, path, previous.is_some(), content, added, removed, create_backup)
            .await
    }

    /// Apply a unified diff to a file. A missing file is patched from empty.
    pub async fn apply_patch(&self, path: &str, unified_diff: &str) -> Result<FileChange, ToolError> {
        let resolved = self
            .engine
            .check_write(path, None)
            .map_err(|v| ToolError::PolicyViolation(v.reason))?;
        if resolved.absolute.is_dir() {
            return Err(ToolError::IsDirectory {
                path: path.to_string(),
            });
        }

        let previous = read_if_exists(&resolved.absolute, path).await?;
        let patch = Patch::parse(unified_diff)?;
        let updated = patch.apply(previous.as_deref().unwrap_or(""))?;

        // The size is known only now
        let resolved = self.check_write(path, updated.len() as u64)?;
        let (added, removed) = (patch.lines_added(), patch.lines_removed());
        self.check_diff(&resolved.relative, added, removed)?;

        self.commit(&resolved, path, previous.is_some(), &updated, added, removed, true)
            .await
    }

    /// Regex search over files matching `glob`.
    pub async fn search(
        &self,
        query: &str,
        glob: Option<&str>,
        max_results: usize,
        case_sensitive: bool,
    ) -> Result<Vec<SearchMatch>, ToolError> {
        let regex = RegexBuilder::new(query)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| ToolError::InvalidPattern {
                pattern: query.to_string(),
                reason: e.to_string(),
            })?;

        let candidates = self
            .list_files(glob.unwrap_or("**/*"), MAX_SEARCH_FILES)
            .await?;
        let mut matches = Vec::new();
        if max_results == 0 {
            return Ok(matches);
        }

        for rel in candidates {
            let absolute = self.engine.root().join(&rel);
            let Ok(bytes) = tokio::fs::read(&absolute).await else {
                continue;
            };
            if bytes.iter().take(8192).any(|&b| b == 0) {
                continue;
            }
            let Ok(text) = String::from_utf8(bytes) else {
                continue;
            };

            for (index, line) in text.lines().enumerate() {
                let Some(found) = regex.find(line) else {
                    continue;
                };
                matches.push(SearchMatch {
                    path: rel.clone(),
                    line: index + 1,
                    content: truncate_chars(line, MAX_MATCH_LINE_CHARS),
                    matched: found.as_str().to_string(),
                });
                if matches.len() >= max_results {
                    return Ok(matches);
                }
            }
        }
        Ok(matches)
    }

    fn check_read(&self, path: &str) -> Result<ResolvedPath, ToolError> {
        self.engine
            .check_read(path)
            .map_err(|v| ToolError::PolicyViolation(v.reason))
    }

    fn check_write(&self, path: &str, size: u64) -> Result<ResolvedPath, ToolError> {
        self.engine
            .check_write(path, Some(size))
            .map_err(|v| ToolError::PolicyViolation(v.reason))
    }

    /// Diff limits over the session so far plus this change.
    fn check_diff(&self, rel: &str, added: usize, removed: usize) -> Result<(), ToolError> {
        let session = self.session();
        let mut files = session.touched.len();
        if !session.touched.contains(rel) {
            files += 1;
        }
        let stats = DiffStats {
            files_changed: files,
            lines_added: session.lines_added + added,
            lines_removed: session.lines_removed + removed,
        };
        drop(session);
        self.engine
            .check_diff_limits(&stats)
            .map_err(|v| ToolError::PolicyViolation(v.reason))
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        resolved: &ResolvedPath,
        path: &str,
        existed: bool,
        content: &str,
        added: usize,
        removed: usize,
        create_backup: bool,
    ) -> Result<FileChange, ToolError> {
        let target = &resolved.absolute;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::io(path, &e))?;
        }

        let backup_path = if existed && create_backup {
            let backup = with_suffix(target, ".bak");
            tokio::fs::copy(target, &backup)
                .await
                .map_err(|e| ToolError::io(path, &e))?;
            Some(format!("{}.bak", resolved.relative))
        } else {
            None
        };

        write_atomic(target, content)
            .await
            .map_err(|e| ToolError::io(path, &e))?;

        {
            let mut session = self.session();
            session.touched.insert(resolved.relative.clone());
            session.lines_added += added;
            session.lines_removed += removed;
        }

        debug!(
            path = %resolved.relative,
            bytes = content.len(),
            lines_added = added,
            lines_removed = removed,
            "File written"
        );

        Ok(FileChange {
            path: resolved.relative.clone(),
            bytes_written: content.len(),
            created: !existed,
            lines_added: added,
            lines_removed: removed,
            backup_path,
        })
    }
}

/// Write to `<path>.tmp` and rename over `path`.
///
/// A failure before the rename leaves the original untouched.
pub async fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = with_suffix(path, ".tmp");
    if let Err(e) = tokio::fs::write(&tmp, content).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!(path = %path.display(), error = %e, "Atomic rename failed");
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

async fn read_if_exists(absolute: &Path, path: &str) -> Result<Option<String>, ToolError> {
    match tokio::fs::read_to_string(absolute).await {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ToolError::io(path, &e)),
    }
}

async fn read_dir_sorted(dir: &Path) -> std::io::Result<Vec<(String, PathBuf, bool)>> {
    let mut reader = tokio::fs::read_dir(dir).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let path = entry.path();
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        entries.push((entry.file_name().to_string_lossy().into_owned(), path, is_dir));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Lines only in `new` and lines only in `old`, as multisets.
fn line_delta(old: &str, new: &str) -> (usize, usize) {
    let mut counts: HashMap<&str, isize> = HashMap::new();
    for line in old.lines() {
        *counts.entry(line).or_default() += 1;
    }
    for line in new.lines() {
        *counts.entry(line).or_default() -= 1;
    }
    counts.values().fold((0, 0), |(added, removed), &n| {
        if n < 0 {
            (added + n.unsigned_abs(), removed)
        } else {
            (added, removed + n as usize)
        }
    })
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandcastle_config::{Operation, Policy, PolicyLimits};
    use std::fs;

    fn ops_with(policy: Policy) -> (tempfile::TempDir, SandboxedFileOps) {
        let dir = tempfile::tempdir().unwrap();
        let engine = PolicyEngine::new(dir.path(), policy).unwrap();
        (dir, SandboxedFileOps::new(Arc::new(engine)))
    }

    fn ops() -> (tempfile::TempDir, SandboxedFileOps) {
        ops_with(Policy::default())
    }

    fn seed(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn list_files_prunes_and_sorts() {
        let (dir, ops) = ops();
        seed(dir.path(), "b.txt", "b");
        seed(dir.path(), "a.txt", "a");
        seed(dir.path(), "src/main.rs", "fn main() {}");
        seed(dir.path(), "node_modules/pkg/index.js", "x");
        seed(dir.path(), "target/debug/out", "x");
        seed(dir.path(), ".env", "KEY=1");

        let files = ops.list_files("**/*", 100).await.unwrap();
        assert_eq!(files, vec!["a.txt", "b.txt", "src/main.rs"]);
    }

    #[tokio::test]
    async fn list_files_applies_glob_and_limit() {
        let (dir, ops) = ops();
        for i in 0..5 {
            seed(dir.path(), &format!("src/f{i}.rs"), "");
        }
        seed(dir.path(), "src/readme.md", "");

        let rs = ops.list_files("src/*.rs", 100).await.unwrap();
        assert_eq!(rs.len(), 5);
        let limited = ops.list_files("**/*", 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn list_files_respects_allowed_paths() {
        let (dir, ops) = ops_with(Policy {
            allowed_paths: vec!["src/**".into()],
            ..Policy::default()
        });
        seed(dir.path(), "src/a.rs", "");
        seed(dir.path(), "config/x.json", "{}");
        let files = ops.list_files("**/*", 100).await.unwrap();
        assert_eq!(files, vec!["src/a.rs"]);
    }

    #[tokio::test]
    async fn read_file_errors() {
        let (dir, ops) = ops();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        assert!(matches!(
            ops.read_file("missing.txt").await,
            Err(ToolError::NotFound { .. })
        ));
        assert!(matches!(
            ops.read_file("src").await,
            Err(ToolError::IsDirectory { .. })
        ));
        assert!(matches!(
            ops.read_file("../outside").await,
            Err(ToolError::PolicyViolation(_))
        ));
    }

    #[tokio::test]
    async fn write_creates_parents_and_tracks_touched() {
        let (dir, ops) = ops();
        let change = ops.write_file("src/new/mod.rs", "a\nb\n", true).await.unwrap();
        assert!(change.created);
        assert_eq!(change.lines_added, 2);
        assert_eq!(change.backup_path, None);
        assert_eq!(fs::read_to_string(dir.path().join("src/new/mod.rs")).unwrap(), "a\nb\n");
        assert_eq!(ops.touched_files(), vec!["src/new/mod.rs"]);

        ops.clear_touched_files();
        assert!(ops.touched_files().is_empty());
    }

    #[tokio::test]
    async fn overwrite_makes_backup_and_leaves_no_tmp() {
        let (dir, ops) = ops();
        seed(dir.path(), "app.txt", "one\ntwo\n");
        let change = ops.write_file("app.txt", "one\nthree\n", true).await.unwrap();
        assert!(!change.created);
        assert_eq!((change.lines_added, change.lines_removed), (1, 1));
        assert_eq!(change.backup_path.as_deref(), Some("app.txt.bak"));
        assert_eq!(fs::read_to_string(dir.path().join("app.txt.bak")).unwrap(), "one\ntwo\n");
        assert!(!dir.path().join("app.txt.tmp").exists());
    }

    #[tokio::test]
    async fn failed_atomic_write_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.txt");
        fs::write(&target, "original").unwrap();
        // A directory squatting on the temp name makes the temp write fail
        fs::create_dir(dir.path().join("data.txt.tmp")).unwrap();

        assert!(write_atomic(&target, "new").await.is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "original");
    }

    #[tokio::test]
    async fn write_without_backup() {
        let (dir, ops) = ops();
        seed(dir.path(), "a.txt", "x");
        let change = ops.write_file("a.txt", "y", false).await.unwrap();
        assert!(change.backup_path.is_none());
        assert!(!dir.path().join("a.txt.bak").exists());
    }

    #[tokio::test]
    async fn write_rejects_oversized_and_denied() {
        let (_dir, ops) = ops_with(Policy {
            max_file_size: 4,
            ..Policy::default()
        });
        let err = ops.write_file("a.txt", "12345", true).await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
        let err = ops.write_file("server.pem", "k", true).await.unwrap_err();
        assert!(matches!(err, ToolError::PolicyViolation(_)));
    }

    #[tokio::test]
    async fn write_respects_file_limit() {
        let (_dir, ops) = ops_with(Policy {
            limits: PolicyLimits {
                max_files_per_run: 1,
                ..PolicyLimits::default()
            },
            ..Policy::default()
        });
        ops.write_file("a.txt", "1", true).await.unwrap();
        ops.write_file("a.txt", "2", true).await.unwrap();
        let err = ops.write_file("b.txt", "3", true).await.unwrap_err();
        assert!(err.to_string().contains("2 files"));
    }

    #[tokio::test]
    async fn write_respects_cumulative_line_limit() {
        let (_dir, ops) = ops_with(Policy {
            limits: PolicyLimits {
                max_diff_lines_per_run: 3,
                ..PolicyLimits::default()
            },
            ..Policy::default()
        });
        ops.write_file("a.txt", "1\n2\n", true).await.unwrap();
        let err = ops.write_file("b.txt", "3\n4\n", true).await.unwrap_err();
        assert!(err.to_string().contains("4 lines"));
    }

    #[tokio::test]
    async fn create_requires_create_operation() {
        let (_dir, ops) = ops_with(Policy {
            allowed_operations: vec![Operation::Read, Operation::Write],
            ..Policy::default()
        });
        let err = ops.write_file("new.txt", "x", true).await.unwrap_err();
        assert!(err.to_string().contains("create"));
    }

    #[tokio::test]
    async fn apply_patch_updates_file_with_backup() {
        let (dir, ops) = ops();
        seed(dir.path(), "src/lib.rs", "pub fn a() {}\npub fn b() {}\n");
        let diff = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,2 +1,2 @@\n pub fn a() {}\n-pub fn b() {}\n+pub fn c() {}\n";

        let change = ops.apply_patch("src/lib.rs", diff).await.unwrap();
        assert_eq!((change.lines_added, change.lines_removed), (1, 1));
        assert_eq!(
            fs::read_to_string(dir.path().join("src/lib.rs")).unwrap(),
            "pub fn a() {}\npub fn c() {}\n"
        );
        assert!(dir.path().join("src/lib.rs.bak").exists());
        assert_eq!(ops.touched_files(), vec!["src/lib.rs"]);
    }

    #[tokio::test]
    async fn apply_patch_to_missing_file_creates_it() {
        let (dir, ops) = ops();
        let change = ops
            .apply_patch("NOTES.md", "@@ -0,0 +1,1 @@\n+hello\n")
            .await
            .unwrap();
        assert!(change.created);
        assert_eq!(fs::read_to_string(dir.path().join("NOTES.md")).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn rejected_patch_leaves_file_alone() {
        let (dir, ops) = ops();
        seed(dir.path(), "a.txt", "keep\n");
        let err = ops
            .apply_patch("a.txt", "@@ -1,1 +1,1 @@\n-other\n+x\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PatchRejected(_)));
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "keep\n");
        assert!(ops.touched_files().is_empty());
    }

    #[tokio::test]
    async fn search_finds_lines() {
        let (dir, ops) = ops();
        seed(dir.path(), "src/a.rs", "fn alpha() {}\nfn beta() {}\n");
        seed(dir.path(), "src/b.rs", "// Alpha notes\n");
        seed(dir.path(), "bin.dat", "alpha\0\0");

        let hits = ops.search("alpha", None, 10, false).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "src/a.rs");
        assert_eq!(hits[0].line, 1);
        assert_eq!(hits[1].matched, "Alpha");

        let sensitive = ops.search("alpha", None, 10, true).await.unwrap();
        assert_eq!(sensitive.len(), 1);

        let limited = ops.search("fn", Some("src/*.rs"), 1, false).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn search_truncates_long_lines() {
        let (dir, ops) = ops();
        let long = format!("needle {}", "x".repeat(500));
        seed(dir.path(), "long.txt", &long);
        let hits = ops.search("needle", None, 5, false).await.unwrap();
        assert_eq!(hits[0].content.chars().count(), MAX_MATCH_LINE_CHARS);
    }

    #[tokio::test]
    async fn invalid_regex_is_reported() {
        let (_dir, ops) = ops();
        let err = ops.search("(unclosed", None, 5, false).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidPattern { .. }));
    }

    #[test]
    fn line_delta_counts_multiset_difference() {
        assert_eq!(line_delta("a\nb\nc\n", "a\nc\nd\ne\n"), (2, 1));
        assert_eq!(line_delta("same\n", "same\n"), (0, 0));
    }
}
