//! Policy engine: path validation for file tools.
//!
//! Every path an agent hands us is resolved against the project root before
//! anything touches the filesystem. Checks run in a fixed order and the first
//! failure wins:
//!
//! 1. lexical traversal (`..` escaping the root, absolute paths elsewhere)
//! 2. symlink escape (the nearest existing ancestor must canonicalize inside
//!    the root)
//! 3. denied file patterns, then denied paths (ancestors included)
//! 4. the requested operation
//! 5. the allowed-path list (empty = the whole project)
//! 6. size, for writes
//!
//! Deny rules are evaluated before the allowlist, so `src/secrets.json` is
//! blocked even when `src/**` is allowed.

use std::path::{Component, Path, PathBuf};

use sandcastle_config::{Operation, Policy};
use serde::Serialize;

use crate::glob::Glob;

/// Which rule rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    PathTraversal,
    Blocked,
    OperationNotAllowed,
    NotInAllowedPaths,
    SizeExceeded,
    CommandBlocked,
    LimitExceeded,
}

/// A rejected request with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct Violation {
    pub kind: ViolationKind,
    pub reason: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// The outcome of a validation call.
///
/// `allowed == false` always carries a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ViolationKind>,
}

impl ValidationResult {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            kind: None,
        }
    }

    pub fn deny(kind: ViolationKind, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            kind: Some(kind),
        }
    }
}

impl<T> From<Result<T, Violation>> for ValidationResult {
    fn from(result: Result<T, Violation>) -> Self {
        match result {
            Ok(_) => Self::allow(),
            Err(v) => Self::deny(v.kind, v.reason),
        }
    }
}

/// A path that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Absolute, lexically normalized location on disk
    pub absolute: PathBuf,
    /// Root-relative with `/` separators; empty for the root itself
    pub relative: String,
}

/// Errors building an engine from a policy document.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid glob '{pattern}' in policy: {reason}")]
    InvalidGlob { pattern: String, reason: String },

    #[error("Cannot resolve project root '{path}': {reason}")]
    Root { path: PathBuf, reason: String },
}

/// Evaluates one policy against one project root.
///
/// Immutable after construction and safe to share across tasks.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    root: PathBuf,
    canonical_root: PathBuf,
    policy: Policy,
    allowed_paths: Vec<Glob>,
    denied_paths: Vec<Glob>,
    denied_patterns: Vec<Glob>,
}

impl PolicyEngine {
    pub fn new(root: impl AsRef<Path>, policy: Policy) -> Result<Self, PolicyError> {
        let root = root.as_ref();
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| PolicyError::Root {
                    path: root.to_path_buf(),
                    reason: e.to_string(),
                })?
                .join(root)
        };
        let root = normalize_lexically(&absolute);
        let canonical_root = root.canonicalize().unwrap_or_else(|_| root.clone());

        let compile = |patterns: &[String]| -> Result<Vec<Glob>, PolicyError> {
            patterns
                .iter()
                .map(|p| {
                    Glob::new(p).map_err(|e| PolicyError::InvalidGlob {
                        pattern: p.clone(),
                        reason: e.to_string(),
                    })
                })
                .collect()
        };

        Ok(Self {
            allowed_paths: compile(&policy.allowed_paths)?,
            denied_paths: compile(&policy.denied_paths)?,
            denied_patterns: compile(&policy.denied_patterns)?,
            root,
            canonical_root,
            policy,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Location and containment checks shared by every file operation.
    pub fn validate_path(&self, path: &str) -> ValidationResult {
        self.check_path(path).into()
    }

    pub fn validate_read(&self, path: &str) -> ValidationResult {
        self.check_read(path).into()
    }

    /// `size` is the byte length of the content about to be written, when known.
    pub fn validate_write(&self, path: &str, size: Option<u64>) -> ValidationResult {
        self.check_write(path, size).into()
    }

    /// Resolve `path` and apply traversal, symlink and deny checks.
    pub fn check_path(&self, path: &str) -> Result<ResolvedPath, Violation> {
        let resolved = self.resolve(path)?;
        self.check_symlinks(path, &resolved)?;
        self.check_denied(&resolved)?;
        Ok(resolved)
    }

    pub fn check_read(&self, path: &str) -> Result<ResolvedPath, Violation> {
        let resolved = self.check_path(path)?;
        self.check_operation(Operation::Read)?;
        self.check_allowed(&resolved)?;
        Ok(resolved)
    }

    pub fn check_write(&self, path: &str, size: Option<u64>) -> Result<ResolvedPath, Violation> {
        let resolved = self.check_path(path)?;
        let op = if resolved.absolute.exists() {
            Operation::Write
        } else {
            Operation::Create
        };
        self.check_operation(op)?;
        self.check_allowed(&resolved)?;
        if let Some(size) = size
            && size > self.policy.max_file_size
        {
            return Err(Violation::new(
                ViolationKind::SizeExceeded,
                format!(
                    "File size {size} bytes exceeds maximum of {} bytes",
                    self.policy.max_file_size
                ),
            ));
        }
        Ok(resolved)
    }

    /// Express an absolute location inside the root as a relative path.
    pub fn relative_to_root(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        Some(to_slash(rel))
    }

    fn resolve(&self, input: &str) -> Result<ResolvedPath, Violation> {
        let cleaned = input.trim().replace('\\', "/");
        let joined = self.root.join(&cleaned);
        let absolute = normalize_lexically(&joined);

        match absolute.strip_prefix(&self.root) {
            Ok(rel) => Ok(ResolvedPath {
                relative: to_slash(rel),
                absolute,
            }),
            Err(_) => Err(Violation::new(
                ViolationKind::PathTraversal,
                format!("Path traversal detected: '{input}' resolves outside the project root"),
            )),
        }
    }

    fn check_symlinks(&self, input: &str, resolved: &ResolvedPath) -> Result<(), Violation> {
        let Some(existing) = resolved.absolute.ancestors().find(|p| p.exists()) else {
            return Ok(());
        };
        let Ok(canonical) = existing.canonicalize() else {
            return Ok(());
        };
        if canonical.starts_with(&self.canonical_root) {
            Ok(())
        } else {
            Err(Violation::new(
                ViolationKind::PathTraversal,
                format!("Path traversal detected: '{input}' escapes the project root through a symlink"),
            ))
        }
    }

    fn check_denied(&self, resolved: &ResolvedPath) -> Result<(), Violation> {
        if resolved.relative.is_empty() {
            return Ok(());
        }
        let rel = &resolved.relative;

        for pattern in &self.denied_patterns {
            let hit = if pattern.has_separator() {
                pattern.is_match(rel)
            } else {
                rel.split('/').any(|component| pattern.is_match(component))
            };
            if hit {
                return Err(Violation::new(
                    ViolationKind::Blocked,
                    format!(
                        "Access to '{rel}' is blocked: matches protected pattern '{}'",
                        pattern.as_str()
                    ),
                ));
            }
        }

        for prefix in ancestors_of(rel) {
            if let Some(pattern) = self.denied_paths.iter().find(|g| g.is_match(prefix)) {
                return Err(Violation::new(
                    ViolationKind::Blocked,
                    format!(
                        "Access to '{rel}' is blocked: '{prefix}' matches denied path '{}'",
                        pattern.as_str()
                    ),
                ));
            }
        }

        Ok(())
    }

    fn check_operation(&self, op: Operation) -> Result<(), Violation> {
        if self.policy.allows(op) {
            Ok(())
        } else {
            Err(Violation::new(
                ViolationKind::OperationNotAllowed,
                format!("Operation '{op}' is not allowed by policy"),
            ))
        }
    }

    fn check_allowed(&self, resolved: &ResolvedPath) -> Result<(), Violation> {
        if self.allowed_paths.is_empty()
            || self.allowed_paths.iter().any(|g| g.is_match(&resolved.relative))
        {
            return Ok(());
        }
        Err(Violation::new(
            ViolationKind::NotInAllowedPaths,
            format!(
                "Path '{}' is not in allowed paths ({})",
                resolved.relative,
                self.policy.allowed_paths.join(", ")
            ),
        ))
    }
}

/// Whether `id` can be used as one path component below a data directory.
pub fn is_path_segment(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

/// Fold `.` and `..` without touching the filesystem.
///
/// `..` at the filesystem root stays at the root.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn to_slash(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// `a/b/c` yields `a`, `a/b`, `a/b/c`.
fn ancestors_of(rel: &str) -> impl Iterator<Item = &str> {
    rel.match_indices('/')
        .map(move |(i, _)| &rel[..i])
        .chain(std::iter::once(rel))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(policy: Policy) -> (tempfile::TempDir, PolicyEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = PolicyEngine::new(dir.path(), policy).unwrap();
        (dir, engine)
    }

    fn engine() -> (tempfile::TempDir, PolicyEngine) {
        engine_with(Policy::default())
    }

    #[test]
    fn plain_relative_path_is_allowed() {
        let (_dir, engine) = engine();
        let result = engine.validate_read("src/main.rs");
        assert!(result.allowed, "{result:?}");
        assert!(result.reason.is_none());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let (_dir, engine) = engine();
        for path in ["../etc/passwd", "src/../../x", "..", "a/b/../../../c"] {
            let result = engine.validate_read(path);
            assert!(!result.allowed, "{path} should be rejected");
            assert_eq!(result.kind, Some(ViolationKind::PathTraversal));
            assert!(result.reason.unwrap().contains("traversal"));
        }
    }

    #[test]
    fn backslash_traversal_is_rejected() {
        let (_dir, engine) = engine();
        let result = engine.validate_read("..\\..\\etc\\passwd");
        assert_eq!(result.kind, Some(ViolationKind::PathTraversal));
    }

    #[test]
    fn inner_dotdot_that_stays_inside_is_fine() {
        let (_dir, engine) = engine();
        let resolved = engine.check_read("src/../lib/a.rs").unwrap();
        assert_eq!(resolved.relative, "lib/a.rs");
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let (_dir, engine) = engine();
        let result = engine.validate_read("/etc/passwd");
        assert_eq!(result.kind, Some(ViolationKind::PathTraversal));
    }

    #[test]
    fn absolute_path_inside_root_is_accepted() {
        let (dir, engine) = engine();
        let inside = dir.path().join("src").join("a.rs");
        let resolved = engine.check_read(inside.to_str().unwrap()).unwrap();
        assert_eq!(resolved.relative, "src/a.rs");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "x").unwrap();
        let (dir, engine) = engine();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let result = engine.validate_read("link/data.txt");
        assert_eq!(result.kind, Some(ViolationKind::PathTraversal));
        assert!(result.reason.unwrap().contains("symlink"));

        let result = engine.validate_write("link/new.txt", Some(1));
        assert_eq!(result.kind, Some(ViolationKind::PathTraversal));
    }

    #[test]
    fn denied_patterns_match_file_names() {
        let (_dir, engine) = engine();
        for path in [".env", "config/.env.local", "certs/server.pem", "id_rsa.pub"] {
            let result = engine.validate_read(path);
            assert_eq!(result.kind, Some(ViolationKind::Blocked), "{path}");
        }
    }

    #[test]
    fn denied_pattern_beats_allowed_path() {
        let (_dir, engine) = engine_with(Policy {
            allowed_paths: vec!["src/**".into()],
            ..Policy::default()
        });
        let result = engine.validate_read("src/secrets.json");
        assert!(!result.allowed);
        assert_eq!(result.kind, Some(ViolationKind::Blocked));
        assert!(engine.validate_read("src/app.ts").allowed);
    }

    #[test]
    fn denied_pattern_matches_directory_component() {
        let (_dir, engine) = engine();
        let result = engine.validate_read("config/secrets/db.json");
        assert_eq!(result.kind, Some(ViolationKind::Blocked));
    }

    #[test]
    fn denied_paths_cover_descendants_and_the_directory_itself() {
        let (_dir, engine) = engine();
        for path in [".git", ".git/config", "node_modules/pkg/index.js", ".sandcastle/runs/x.log"] {
            let result = engine.validate_read(path);
            assert_eq!(result.kind, Some(ViolationKind::Blocked), "{path}");
        }
    }

    #[test]
    fn denied_paths_match_ancestors() {
        let (_dir, engine) = engine_with(Policy {
            denied_paths: vec!["build".into()],
            ..Policy::default()
        });
        assert!(!engine.validate_read("build/out/app.js").allowed);
        assert!(engine.validate_read("builder/app.js").allowed);
    }

    #[test]
    fn allowlist_miss_has_reason() {
        let (_dir, engine) = engine_with(Policy {
            allowed_paths: vec!["src/**".into()],
            ..Policy::default()
        });
        let result = engine.validate_read("config/app.json");
        assert_eq!(result.kind, Some(ViolationKind::NotInAllowedPaths));
        assert!(result.reason.unwrap().contains("not in allowed paths"));
    }

    #[test]
    fn read_requires_read_operation() {
        let (_dir, engine) = engine_with(Policy {
            allowed_operations: vec![Operation::Write, Operation::Create],
            ..Policy::default()
        });
        let result = engine.validate_read("src/a.rs");
        assert_eq!(result.kind, Some(ViolationKind::OperationNotAllowed));
    }

    #[test]
    fn write_to_new_file_needs_create() {
        let (dir, engine) = engine_with(Policy {
            allowed_operations: vec![Operation::Read, Operation::Write],
            ..Policy::default()
        });
        let result = engine.validate_write("new.txt", Some(3));
        assert_eq!(result.kind, Some(ViolationKind::OperationNotAllowed));
        assert!(result.reason.unwrap().contains("create"));

        std::fs::write(dir.path().join("existing.txt"), "old").unwrap();
        assert!(engine.validate_write("existing.txt", Some(3)).allowed);
    }

    #[test]
    fn write_over_existing_file_needs_write() {
        let (dir, engine) = engine_with(Policy {
            allowed_operations: vec![Operation::Read, Operation::Create],
            ..Policy::default()
        });
        std::fs::write(dir.path().join("existing.txt"), "old").unwrap();
        let result = engine.validate_write("existing.txt", None);
        assert_eq!(result.kind, Some(ViolationKind::OperationNotAllowed));
        assert!(engine.validate_write("fresh.txt", None).allowed);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let (_dir, engine) = engine_with(Policy {
            max_file_size: 10,
            ..Policy::default()
        });
        assert!(engine.validate_write("a.txt", Some(10)).allowed);
        let result = engine.validate_write("a.txt", Some(11));
        assert_eq!(result.kind, Some(ViolationKind::SizeExceeded));
        assert_eq!(
            result.reason.as_deref(),
            Some("File size 11 bytes exceeds maximum of 10 bytes")
        );
    }

    #[test]
    fn traversal_is_reported_before_deny_rules() {
        let (_dir, engine) = engine();
        let result = engine.validate_read("../.env");
        assert_eq!(result.kind, Some(ViolationKind::PathTraversal));
    }

    #[test]
    fn validation_result_serializes_without_empty_fields() {
        let json = serde_json::to_value(ValidationResult::allow()).unwrap();
        assert_eq!(json, serde_json::json!({ "allowed": true }));
        let json = serde_json::to_value(ValidationResult::deny(ViolationKind::Blocked, "no")).unwrap();
        assert_eq!(json["kind"], "blocked");
    }

    #[test]
    fn ancestors_are_listed_shallow_first() {
        assert_eq!(ancestors_of("a/b/c").collect::<Vec<_>>(), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(ancestors_of("a").collect::<Vec<_>>(), vec!["a"]);
    }
}
