//! Protected-path snapshots
//!
//! A snapshot maps every file matched by the protected patterns to a
//! content hash. Patterns are plain files, directories (expanded
//! recursively), or globs. Patterns that match nothing contribute nothing.

use crate::git_ops::{self, RestoreOutcome};
use crate::util::{hash_bytes, rel_path_string};
use anyhow::{Context, Result};
use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtectedPathSnapshot {
    /// repository-relative path -> sha256 of content
    pub entries: BTreeMap<String, String>,
}

impl ProtectedPathSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Paths added, removed, or changed between `self` and `later`.
    pub fn changed_paths(&self, later: &ProtectedPathSnapshot) -> BTreeSet<String> {
        diff(self, later)
    }
}

/// Tool caches rewritten by merely running the test suite.
const CACHE_DIRS: &[&str] = &[
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
];

/// True when some component of `path` is a VCS or tool-cache directory.
pub fn is_cache_path(path: &str) -> bool {
    path.split('/')
        .any(|component| component == ".git" || CACHE_DIRS.contains(&component))
}

/// Hash everything under `repo_root` matched by `patterns`, skipping any
/// path under one of `excluded` (repository-relative prefixes).
pub fn snapshot(
    repo_root: &Path,
    patterns: &[String],
    excluded: &[String],
) -> Result<ProtectedPathSnapshot> {
    let mut snap = ProtectedPathSnapshot::default();
    let (literals, globs) = split_patterns(patterns);

    for literal in literals {
        let absolute = repo_root.join(&literal);
        if absolute.is_dir() {
            collect_dir(repo_root, &absolute, excluded, &mut snap);
        } else if absolute.is_file() || absolute.is_symlink() {
            insert_file(repo_root, &absolute, excluded, &mut snap);
        }
    }

    if !globs.is_empty() {
        let set = compile_globset(&globs)?;
        for entry in walk(repo_root, excluded) {
            let rel = match entry.path().strip_prefix(repo_root) {
                Ok(rel) => rel_path_string(rel),
                Err(_) => continue,
            };
            if rel.is_empty() || !set.is_match(&rel) {
                continue;
            }
            if entry.file_type().is_dir() {
                collect_dir(repo_root, entry.path(), excluded, &mut snap);
            } else {
                insert_file(repo_root, entry.path(), excluded, &mut snap);
            }
        }
    }

    debug!(files = snap.len(), "protected-path snapshot taken");
    Ok(snap)
}

/// Paths whose presence or content differs between two snapshots.
pub fn diff(before: &ProtectedPathSnapshot, after: &ProtectedPathSnapshot) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (path, hash) in &before.entries {
        if after.entries.get(path) != Some(hash) {
            changed.insert(path.clone());
        }
    }
    for path in after.entries.keys() {
        if !before.entries.contains_key(path) {
            changed.insert(path.clone());
        }
    }
    changed
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertReport {
    pub restored: Vec<String>,
    pub removed: Vec<String>,
    /// (path, error) for paths that could not be reverted
    pub failed: Vec<(String, String)>,
}

impl RevertReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Restore `paths` to HEAD. Tracked paths get their committed content back,
/// paths new since HEAD are deleted, and already-correct or missing paths
/// are left alone. Running it twice has the same effect as once.
pub fn revert<'a, I>(repo_root: &Path, paths: I) -> RevertReport
where
    I: IntoIterator<Item = &'a String>,
{
    let mut report = RevertReport::default();
    for path in paths {
        match git_ops::restore_path(repo_root, Path::new(path)) {
            Ok(RestoreOutcome::Restored) => report.restored.push(path.clone()),
            Ok(RestoreOutcome::Removed) => report.removed.push(path.clone()),
            Ok(RestoreOutcome::Unchanged) => {}
            Err(err) => {
                warn!(path = %path, error = %err, "failed to revert path");
                report.failed.push((path.clone(), err.to_string()));
            }
        }
    }
    report
}

fn split_patterns(patterns: &[String]) -> (Vec<PathBuf>, Vec<String>) {
    let mut literals = Vec::new();
    let mut globs = Vec::new();
    for pattern in patterns {
        let pattern = pattern.trim().trim_start_matches("./");
        if pattern.is_empty() {
            continue;
        }
        if pattern.contains(['*', '?', '[', '{']) {
            globs.push(pattern.trim_end_matches('/').to_string());
        } else {
            literals.push(PathBuf::from(pattern.trim_end_matches('/')));
        }
    }
    (literals, globs)
}

fn compile_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob: Glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid protected-path glob '{pattern}'"))?;
        builder.add(glob);
    }
    builder.build().context("failed to build protected-path globset")
}

fn walk<'a>(dir: &'a Path, excluded: &'a [String]) -> impl Iterator<Item = walkdir::DirEntry> + 'a {
    let root = dir.to_path_buf();
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(move |entry| !is_skipped(&root, entry.path(), excluded))
        .filter_map(|entry| entry.ok())
}

fn is_skipped(root: &Path, path: &Path, excluded: &[String]) -> bool {
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name == ".git" || CACHE_DIRS.contains(&name))
    {
        return true;
    }
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    let rel = rel_path_string(rel);
    excluded
        .iter()
        .any(|prefix| crate::guard::path_has_prefix(&rel, prefix))
}

fn collect_dir(
    repo_root: &Path,
    dir: &Path,
    excluded: &[String],
    snap: &mut ProtectedPathSnapshot,
) {
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !is_skipped(repo_root, entry.path(), excluded))
        .filter_map(|entry| entry.ok())
    {
        if !entry.file_type().is_dir() {
            insert_file(repo_root, entry.path(), excluded, snap);
        }
    }
}

fn insert_file(
    repo_root: &Path,
    path: &Path,
    excluded: &[String],
    snap: &mut ProtectedPathSnapshot,
) {
    if is_skipped(repo_root, path, excluded) {
        return;
    }
    let Ok(rel) = path.strip_prefix(repo_root) else {
        return;
    };
    let hash = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => std::fs::read_link(path)
            .ok()
            .map(|target| hash_bytes(target.to_string_lossy().as_bytes())),
        Ok(_) => std::fs::read(path).ok().map(|bytes| hash_bytes(&bytes)),
        Err(_) => None,
    };
    if let Some(hash) = hash {
        snap.entries.insert(rel_path_string(rel), hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_ops::test_support::{commit_test_file, create_temp_repo};
    use std::fs;

    fn patterns(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_snapshot_expands_dirs_and_globs() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "tests/test_a.py", "a\n");
        commit_test_file(&repo, "tests/unit/test_b.py", "b\n");
        commit_test_file(&repo, "docs/one.md", "1\n");
        commit_test_file(&repo, "docs/deep/two.md", "2\n");
        commit_test_file(&repo, "src/app.py", "x\n");

        let snap = snapshot(
            &repo,
            &patterns(&["tests/", "docs/*.md", "missing/", "nope.txt"]),
            &[],
        )
        .unwrap();
        let keys: Vec<&str> = snap.entries.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["docs/one.md", "tests/test_a.py", "tests/unit/test_b.py"]);
    }

    #[test]
    fn test_snapshot_skips_excluded_and_git_dirs() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "tests/test_a.py", "a\n");
        fs::create_dir_all(repo.join(".patchwarden")).unwrap();
        fs::write(repo.join(".patchwarden/latest.log"), "log").unwrap();

        let snap = snapshot(&repo, &patterns(&["**"]), &[".patchwarden".to_string()]).unwrap();
        assert!(snap.entries.contains_key("tests/test_a.py"));
        assert!(snap.entries.keys().all(|k| !k.starts_with(".patchwarden")));
        assert!(snap.entries.keys().all(|k| !k.starts_with(".git/")));
    }

    #[test]
    fn test_cache_dirs_are_not_protected_content() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "tests/test_a.py", "a\n");
        let before = snapshot(&repo, &patterns(&["tests/"]), &[]).unwrap();
        fs::create_dir_all(repo.join("tests/__pycache__")).unwrap();
        fs::write(repo.join("tests/__pycache__/test_a.cpython-312.pyc"), "bytes").unwrap();
        let after = snapshot(&repo, &patterns(&["tests/"]), &[]).unwrap();
        assert!(diff(&before, &after).is_empty());
        assert!(is_cache_path("tests/__pycache__/test_a.cpython-312.pyc"));
        assert!(!is_cache_path("tests/test_a.py"));
    }

    #[test]
    fn test_diff_reports_added_removed_and_changed() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "tests/test_a.py", "a\n");
        commit_test_file(&repo, "tests/test_b.py", "b\n");
        let protected = patterns(&["tests/"]);
        let before = snapshot(&repo, &protected, &[]).unwrap();

        fs::write(repo.join("tests/test_a.py"), "changed\n").unwrap();
        fs::remove_file(repo.join("tests/test_b.py")).unwrap();
        fs::write(repo.join("tests/test_c.py"), "new\n").unwrap();
        let after = snapshot(&repo, &protected, &[]).unwrap();

        let changed: Vec<String> = diff(&before, &after).into_iter().collect();
        assert_eq!(
            changed,
            vec!["tests/test_a.py", "tests/test_b.py", "tests/test_c.py"]
        );
        assert!(diff(&before, &before).is_empty());
    }

    #[test]
    fn test_revert_restores_snapshot_and_is_idempotent() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "tests/test_a.py", "a\n");
        commit_test_file(&repo, "tests/test_b.py", "b\n");
        let protected = patterns(&["tests/"]);
        let before = snapshot(&repo, &protected, &[]).unwrap();

        fs::write(repo.join("tests/test_a.py"), "changed\n").unwrap();
        fs::remove_file(repo.join("tests/test_b.py")).unwrap();
        fs::write(repo.join("tests/test_c.py"), "new\n").unwrap();
        let drift = diff(&before, &snapshot(&repo, &protected, &[]).unwrap());

        let first = revert(&repo, &drift);
        assert!(first.is_clean());
        assert_eq!(first.restored, vec!["tests/test_a.py", "tests/test_b.py"]);
        assert_eq!(first.removed, vec!["tests/test_c.py"]);
        assert_eq!(snapshot(&repo, &protected, &[]).unwrap(), before);

        let second = revert(&repo, &drift);
        assert!(second.is_clean());
        assert!(second.restored.is_empty() && second.removed.is_empty());
        assert_eq!(snapshot(&repo, &protected, &[]).unwrap(), before);
    }

    #[test]
    fn test_revert_of_missing_untracked_path_is_noop() {
        let (_tmp, repo) = create_temp_repo();
        let paths = vec!["tests/never_existed.py".to_string()];
        let report = revert(&repo, &paths);
        assert_eq!(report, RevertReport::default());
    }
}
