//! Working-tree lock and state directory setup
//!
//! One invocation at a time may mutate a working tree. The lock is an
//! advisory `fs2` lock on `<state_dir>/lock`; acquisition never waits.

use crate::error::InfraError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const LOCK_FILE: &str = "lock";

/// Held for the duration of one pass sequence. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock or fail with [`InfraError::LockHeld`] at once.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create {}", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // Lock file content doesn't matter, just the lock
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock || is_contended(&err) => {
                return Err(InfraError::LockHeld { path }.into());
            }
            Err(err) => return Err(err).context("Failed to lock working tree"),
        }

        // Holder pid, for humans inspecting a stuck lock.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        debug!(path = %path.display(), "working-tree lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Create the state directory and keep it out of `git status` through
/// `.git/info/exclude`, so tool output never counts as a working-tree change.
pub fn ensure_state_dir(repo_root: &Path, state_dir: &Path) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let Ok(relative) = state_dir.strip_prefix(repo_root) else {
        return Ok(());
    };
    let git_dir = repo_root.join(".git");
    if !git_dir.is_dir() {
        return Ok(());
    }
    let entry = format!("{}/", crate::util::rel_path_string(relative).trim_end_matches('/'));
    let exclude_path = git_dir.join("info").join("exclude");
    if let Some(parent) = exclude_path.parent() {
        fs::create_dir_all(parent)?;
    }
    append_ignore_entry(&exclude_path, &entry)
}

fn append_ignore_entry(path: &Path, entry: &str) -> Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let bare = entry.trim_end_matches('/');
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed == bare
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# patchwarden state")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git_ops::test_support::create_temp_repo;

    #[test]
    fn test_second_acquire_fails_fast_with_lock_held() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join(".patchwarden");
        let first = RunLock::acquire(&state).unwrap();

        let err = RunLock::acquire(&state).unwrap_err();
        match err.downcast_ref::<InfraError>() {
            Some(InfraError::LockHeld { path }) => assert_eq!(path, first.path()),
            other => panic!("unexpected: {:?}", other),
        }

        drop(first);
        assert!(RunLock::acquire(&state).is_ok());
    }

    #[test]
    fn test_state_dir_is_excluded_from_status() {
        let (_tmp, repo) = create_temp_repo();
        let state = repo.join(".patchwarden");
        ensure_state_dir(&repo, &state).unwrap();
        ensure_state_dir(&repo, &state).unwrap();
        fs::write(state.join("latest.log"), "output").unwrap();

        let exclude = fs::read_to_string(repo.join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches(".patchwarden/").count(), 1);
        assert!(crate::git_ops::changed_paths(&repo).unwrap().is_empty());
    }
}
