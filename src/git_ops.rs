//! Version-control operations used by the acceptance loop
//!
//! Reads committed content, measures working-tree changes, applies,
//! restores, stages, and commits. Reads go through git2; `git apply`
//! shells out so the patch is validated by git itself.

use crate::error::InfraError;
use crate::util::{resolve_repo_path_allow_new, run_command_with_input};
use anyhow::{Context, Result};
use git2::{DiffOptions, ErrorCode, Index, Repository, Signature, StatusOptions};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

const GIT_APPLY_TIMEOUT: Duration = Duration::from_secs(60);

fn open_repo_discover(repo_path: &Path) -> Result<Repository> {
    Repository::discover(repo_path)
        .with_context(|| format!("No git repository at or above '{}'", repo_path.display()))
}

/// Working-tree root of the repository containing `path`.
pub fn repo_root(path: &Path) -> Result<PathBuf> {
    let repo = Repository::discover(path).map_err(|_| InfraError::NotARepository {
        path: path.to_path_buf(),
    })?;
    let workdir = repo.workdir().ok_or_else(|| InfraError::NotARepository {
        path: path.to_path_buf(),
    })?;
    Ok(workdir.to_path_buf())
}

/// HEAD commit, or `None` on an unborn branch.
fn head_commit(repo: &Repository) -> Result<Option<git2::Commit<'_>>> {
    match repo.head() {
        Ok(head) => Ok(Some(head.peel_to_commit()?)),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn head_tree(repo: &Repository) -> Result<Option<git2::Tree<'_>>> {
    head_commit(repo)?.map(|c| c.tree()).transpose().map_err(Into::into)
}

/// Committed content of `file_path`, or `None` when HEAD has no such file.
pub fn read_file_from_head(repo_path: &Path, file_path: &Path) -> Result<Option<String>> {
    Ok(read_blob_from_head(repo_path, file_path)?
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
}

fn read_blob_from_head(repo_path: &Path, file_path: &Path) -> Result<Option<Vec<u8>>> {
    let repo = open_repo_discover(repo_path)?;
    let Some(tree) = head_tree(&repo)? else {
        return Ok(None);
    };
    match tree.get_path(file_path) {
        Ok(entry) => {
            let blob = repo.find_blob(entry.id())?;
            Ok(Some(blob.content().to_vec()))
        }
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Content rewritten from HEAD
    Restored,
    /// Path did not exist at HEAD and was deleted
    Removed,
    /// Nothing to do
    Unchanged,
}

/// Restore a path to its state at HEAD. Paths that are new since HEAD are
/// deleted. Restoring a path that is already correct, or deleting one that
/// is already gone, is a no-op.
pub fn restore_path(repo_path: &Path, file_path: &Path) -> Result<RestoreOutcome> {
    let resolved = resolve_repo_path_allow_new(repo_path, file_path)
        .map_err(|e| anyhow::anyhow!("Invalid path '{}': {}", file_path.display(), e))?;

    let repo = open_repo_discover(repo_path)?;
    let committed = read_blob_from_head(repo_path, &resolved.relative)?;
    let mut index = repo.index()?;

    let outcome = match committed {
        Some(content) => {
            let current = std::fs::read(&resolved.absolute).ok();
            if current.as_deref() == Some(content.as_slice()) {
                RestoreOutcome::Unchanged
            } else {
                if let Some(parent) = resolved.absolute.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&resolved.absolute, &content)
                    .with_context(|| format!("Failed to restore {}", file_path.display()))?;
                RestoreOutcome::Restored
            }
        }
        None => {
            if resolved.absolute.is_file() || resolved.absolute.is_symlink() {
                std::fs::remove_file(&resolved.absolute).with_context(|| {
                    format!("Failed to remove new file {}", file_path.display())
                })?;
                RestoreOutcome::Removed
            } else {
                RestoreOutcome::Unchanged
            }
        }
    };

    // Reset the index entry so nothing from the reverted change stays staged.
    if resolved.absolute.exists() {
        index.add_path(&resolved.relative)?;
    } else {
        let _ = index.remove_path(&resolved.relative);
    }
    index.write()?;

    Ok(outcome)
}

/// Paths that differ from HEAD in the index or working tree, untracked
/// files included.
pub fn changed_paths(repo_path: &Path) -> Result<BTreeSet<String>> {
    let repo = open_repo_discover(repo_path)?;
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;

    let mut paths = BTreeSet::new();
    for entry in statuses.iter() {
        if let Some(path) = entry.path() {
            paths.insert(path.to_string());
        }
    }
    Ok(paths)
}

/// (files changed, added+removed lines) between HEAD and the working tree,
/// limited to `paths`. Untracked files count as fully added.
pub fn numstat(repo_path: &Path, paths: &BTreeSet<String>) -> Result<(usize, usize)> {
    if paths.is_empty() {
        return Ok((0, 0));
    }
    let repo = open_repo_discover(repo_path)?;
    let tree = head_tree(&repo)?;
    let mut opts = DiffOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(true)
        .show_untracked_content(true)
        .disable_pathspec_match(true);
    for path in paths {
        opts.pathspec(path);
    }
    let diff = repo.diff_tree_to_workdir_with_index(tree.as_ref(), Some(&mut opts))?;
    let stats = diff.stats()?;
    Ok((stats.files_changed(), stats.insertions() + stats.deletions()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// git refused the patch; nothing was written
    Refused(String),
}

/// Apply `diff` to the working tree. `git apply --check` runs first so a
/// refused patch never leaves partial edits behind.
pub fn apply_patch(repo_path: &Path, diff: &str) -> Result<ApplyOutcome> {
    let check = run_git_with_input(
        repo_path,
        &["apply", "--check", "--whitespace=nowarn", "-"],
        diff,
    )?;
    if !check.0 {
        return Ok(ApplyOutcome::Refused(check.1));
    }
    let apply = run_git_with_input(repo_path, &["apply", "--whitespace=nowarn", "-"], diff)?;
    if apply.0 {
        Ok(ApplyOutcome::Applied)
    } else {
        Ok(ApplyOutcome::Refused(apply.1))
    }
}

fn run_git_with_input(repo_path: &Path, args: &[&str], input: &str) -> Result<(bool, String)> {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_path).args(args);
    let output = run_command_with_input(&mut cmd, Some(input), Some(GIT_APPLY_TIMEOUT))
        .map_err(|e| anyhow::anyhow!("Failed to execute git {}: {}", args.join(" "), e))?;
    if output.timed_out {
        return Err(anyhow::anyhow!(
            "git {} timed out after {}s",
            args.join(" "),
            GIT_APPLY_TIMEOUT.as_secs()
        ));
    }
    Ok((output.success(), output.stderr.trim().to_string()))
}

/// Stage `paths`, recording deletions for paths that no longer exist.
pub fn stage_paths(repo_path: &Path, paths: &BTreeSet<String>) -> Result<()> {
    let repo = open_repo_discover(repo_path)?;
    let root = repo
        .workdir()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| repo_path.to_path_buf());
    let mut index = repo.index()?;
    for path in paths {
        let rel = Path::new(path);
        if root.join(rel).exists() {
            index.add_path(rel)?;
        } else {
            let _ = index.remove_path(rel);
        }
    }
    index.write()?;
    Ok(())
}

/// Commit the staged state of `paths` on top of HEAD. Anything else the
/// user has staged stays staged and out of the commit. Returns the new
/// commit id.
pub fn commit(repo_path: &Path, paths: &BTreeSet<String>, message: &str) -> Result<String> {
    let repo = open_repo_discover(repo_path)?;
    let parent = head_commit(&repo)?;
    let staged = repo.index()?;
    let mut index = Index::new()?;
    if let Some(parent) = &parent {
        index.read_tree(&parent.tree()?)?;
    }
    for path in paths {
        let rel = Path::new(path);
        match staged.get_path(rel, 0) {
            Some(entry) => index.add(&entry)?,
            None => {
                let _ = index.remove_path(rel);
            }
        }
    }
    let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();

    // Author from git config; automation hosts often have none.
    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "patchwarden".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "patchwarden@localhost".to_string());
    let sig = Signature::now(&name, &email)?;

    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    Ok(oid.to_string())
}

#[cfg(test)]
pub(crate) mod test_support {
    use git2::{Repository, Signature};
    use std::path::{Path, PathBuf};

    /// Helper to create a temporary git repo with an initial commit
    pub fn create_temp_repo() -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let repo_path = temp_dir.path().to_path_buf();

        let repo = Repository::init(&repo_path).expect("Failed to init repo");
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();

        let sig = Signature::now("Test User", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();

        (temp_dir, repo_path)
    }

    pub fn commit_test_file(repo_path: &Path, rel_path: &str, content: &str) {
        let full_path = repo_path.join(rel_path);
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&full_path, content).unwrap();

        let repo = Repository::open(repo_path).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new(rel_path)).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let parent = repo.head().unwrap().peel_to_commit().unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &format!("Add {}", rel_path),
            &tree,
            &[&parent],
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{commit_test_file, create_temp_repo};
    use super::*;

    #[test]
    fn test_read_file_from_head_returns_none_for_new_file() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "src/app.py", "a = 1\n");
        std::fs::write(repo.join("src/new.py"), "b = 2\n").unwrap();

        assert_eq!(
            read_file_from_head(&repo, Path::new("src/app.py")).unwrap(),
            Some("a = 1\n".to_string())
        );
        assert_eq!(read_file_from_head(&repo, Path::new("src/new.py")).unwrap(), None);
    }

    #[test]
    fn test_restore_path_is_idempotent() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "src/app.py", "a = 1\n");
        std::fs::write(repo.join("src/app.py"), "a = 2\n").unwrap();
        std::fs::write(repo.join("src/extra.py"), "x = 1\n").unwrap();

        assert_eq!(
            restore_path(&repo, Path::new("src/app.py")).unwrap(),
            RestoreOutcome::Restored
        );
        assert_eq!(
            restore_path(&repo, Path::new("src/extra.py")).unwrap(),
            RestoreOutcome::Removed
        );
        assert_eq!(
            restore_path(&repo, Path::new("src/app.py")).unwrap(),
            RestoreOutcome::Unchanged
        );
        assert_eq!(
            restore_path(&repo, Path::new("src/extra.py")).unwrap(),
            RestoreOutcome::Unchanged
        );
        assert_eq!(std::fs::read_to_string(repo.join("src/app.py")).unwrap(), "a = 1\n");
        assert!(changed_paths(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_restore_recreates_deleted_tracked_file() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "tests/test_a.py", "def test_a(): pass\n");
        std::fs::remove_file(repo.join("tests/test_a.py")).unwrap();
        assert_eq!(
            restore_path(&repo, Path::new("tests/test_a.py")).unwrap(),
            RestoreOutcome::Restored
        );
        assert!(repo.join("tests/test_a.py").exists());
    }

    #[test]
    fn test_apply_patch_and_numstat() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "src/app.py", "a = 1\nb = 2\n");
        let diff = "--- a/src/app.py
+++ b/src/app.py
@@ -1,2 +1,3 @@
 a = 1
-b = 2
+b = 3
+c = 4
--- /dev/null
+++ b/src/new.py
@@ -0,0 +1 @@
+d = 5
";
        assert_eq!(apply_patch(&repo, diff).unwrap(), ApplyOutcome::Applied);
        let changed = changed_paths(&repo).unwrap();
        assert!(changed.contains("src/app.py"));
        assert!(changed.contains("src/new.py"));
        assert_eq!(numstat(&repo, &changed).unwrap(), (2, 4));
    }

    #[test]
    fn test_apply_patch_refuses_mismatched_context() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "src/app.py", "a = 1\n");
        let diff = "--- a/src/app.py
+++ b/src/app.py
@@ -1 +1 @@
-zzz = 0
+a = 2
";
        assert!(matches!(
            apply_patch(&repo, diff).unwrap(),
            ApplyOutcome::Refused(_)
        ));
        assert_eq!(std::fs::read_to_string(repo.join("src/app.py")).unwrap(), "a = 1\n");
    }

    #[test]
    fn test_stage_and_commit_clears_changes() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "src/app.py", "a = 1\n");
        std::fs::write(repo.join("src/app.py"), "a = 2\n").unwrap();
        let paths: BTreeSet<String> = ["src/app.py".to_string()].into_iter().collect();
        stage_paths(&repo, &paths).unwrap();
        let oid = commit(&repo, &paths, "accept patch").unwrap();
        assert_eq!(oid.len(), 40);
        assert!(changed_paths(&repo).unwrap().is_empty());
    }

    #[test]
    fn test_commit_leaves_unrelated_staged_files_out() {
        let (_tmp, repo) = create_temp_repo();
        commit_test_file(&repo, "src/app.py", "a = 1\n");
        commit_test_file(&repo, "src/old.py", "gone = True\n");
        std::fs::write(repo.join("notes.md"), "wip\n").unwrap();
        let unrelated: BTreeSet<String> = ["notes.md".to_string()].into_iter().collect();
        stage_paths(&repo, &unrelated).unwrap();

        std::fs::write(repo.join("src/app.py"), "a = 2\n").unwrap();
        std::fs::remove_file(repo.join("src/old.py")).unwrap();
        let paths: BTreeSet<String> = ["src/app.py".to_string(), "src/old.py".to_string()]
            .into_iter()
            .collect();
        stage_paths(&repo, &paths).unwrap();
        commit(&repo, &paths, "accept patch").unwrap();

        assert_eq!(
            read_file_from_head(&repo, Path::new("src/app.py")).unwrap().as_deref(),
            Some("a = 2\n")
        );
        assert_eq!(read_file_from_head(&repo, Path::new("src/old.py")).unwrap(), None);
        assert_eq!(read_file_from_head(&repo, Path::new("notes.md")).unwrap(), None);

        let git = Repository::open(&repo).unwrap();
        let status = git.status_file(Path::new("notes.md")).unwrap();
        assert!(status.contains(git2::Status::INDEX_NEW));
        assert_eq!(changed_paths(&repo).unwrap(), unrelated);
    }

    #[test]
    fn test_repo_root_rejects_plain_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let err = repo_root(tmp.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InfraError>(),
            Some(InfraError::NotARepository { .. })
        ));
    }
}
