//! Small shared helpers: text clipping, subprocesses, repo-relative paths.

use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Clip `s` to `max` characters, marking the cut with `...` when room allows.
pub fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        None => s.to_string(),
        Some(_) if max <= 3 => s.chars().take(max).collect(),
        Some(_) => {
            let kept: String = s.chars().take(max - 3).collect();
            kept + "..."
        }
    }
}

/// Last `max_lines` lines of `text`, joined with `\n`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Exit state and captured output of one child process.
#[derive(Debug)]
pub struct CommandRunResult {
    /// `None` when the child could not be reaped after a kill
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandRunResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.is_some_and(|s| s.success())
    }

    /// stdout followed by stderr, separated by a newline when both are present.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) if self.stdout.ends_with('\n') => {
                format!("{}{}", self.stdout, self.stderr)
            }
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Run `command` without stdin. `None` waits for as long as the child runs.
pub fn run_command_with_timeout(
    command: &mut Command,
    timeout: Option<Duration>,
) -> Result<CommandRunResult, String> {
    run_command_with_input(command, None, timeout)
}

/// Run `command` to completion or until `timeout`, feeding `input` on stdin.
///
/// Output pipes are drained on their own threads so a chatty child never
/// blocks on a full pipe. A timed-out child is killed and reaped. A timeout
/// too large to represent as an instant means no deadline.
pub fn run_command_with_input(
    command: &mut Command,
    input: Option<&str>,
    timeout: Option<Duration>,
) -> Result<CommandRunResult, String> {
    let mut child = command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("cannot spawn child process: {e}"))?;

    let writer = input.zip(child.stdin.take()).map(|(text, mut stdin)| {
        let text = text.to_owned();
        // Broken pipe is fine: the child may stop reading early.
        thread::spawn(move || drop(stdin.write_all(text.as_bytes())))
    });
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    let (status, timed_out) = wait_with_deadline(&mut child, deadline)?;

    if let Some(handle) = writer {
        let _ = handle.join();
    }
    Ok(CommandRunResult {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
        timed_out,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
) -> Result<(Option<ExitStatus>, bool), String> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| format!("cannot poll child process: {e}"))?
        {
            return Ok((Some(status), false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            let _ = child.kill();
            return Ok((child.wait().ok(), true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// `sh -c <command_line>` rooted at `cwd`.
pub fn shell_command(cwd: &Path, command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.current_dir(cwd).args(["-c", command_line]);
    command
}

/// First whitespace-separated word of a command line.
pub fn command_program(command_line: &str) -> Option<&str> {
    command_line.split_whitespace().next()
}

/// Whether `program` resolves to an executable, directly or through `PATH`.
pub fn program_available_on_path(program: &str) -> bool {
    let program = program.trim();
    if program.is_empty() {
        return false;
    }
    if program.contains('/') {
        return is_executable(Path::new(program));
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program)))
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A path inside the repository, possibly not created yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoPath {
    pub absolute: PathBuf,
    pub relative: PathBuf,
}

/// Validate a repo-relative `candidate` that may not exist yet.
///
/// Rejects absolute paths, `..` components, and anything whose nearest
/// existing ancestor resolves (through symlinks) outside `repo_root`.
pub fn resolve_repo_path_allow_new(repo_root: &Path, candidate: &Path) -> Result<RepoPath, String> {
    if candidate.as_os_str().is_empty() {
        return Err("empty path".to_string());
    }
    if let Some(bad) = candidate
        .components()
        .find(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(format!(
            "'{}' is not repository-relative ({:?})",
            candidate.display(),
            bad
        ));
    }

    let root = repo_root
        .canonicalize()
        .map_err(|e| format!("cannot resolve {}: {e}", repo_root.display()))?;
    let absolute = root.join(candidate);
    let anchor = absolute
        .ancestors()
        .skip(1)
        .find(|p| p.exists())
        .ok_or_else(|| format!("'{}' has no existing ancestor", candidate.display()))?;
    let anchor = anchor
        .canonicalize()
        .map_err(|e| format!("cannot resolve {}: {e}", anchor.display()))?;
    if !anchor.starts_with(&root) {
        return Err(format!("'{}' escapes the repository", candidate.display()));
    }

    let relative = absolute
        .strip_prefix(&root)
        .map_or_else(|_| candidate.to_path_buf(), Path::to_path_buf);
    Ok(RepoPath { absolute, relative })
}

/// Repository-relative path rendered with forward slashes.
pub fn rel_path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Hex sha256 of `content`.
pub fn hash_bytes(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}
