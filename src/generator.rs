//! Patch generator collaborator
//!
//! The generator is an external, unreliable text producer. It receives a
//! prompt and a working directory and returns whatever it printed; the
//! acceptance loop extracts and vets any diff in that text.

use crate::config::Config;
use crate::ladder::FirstFailure;
use crate::util::{command_program, run_command_with_input, shell_command, truncate};
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Lines of the guardrails document quoted in the prompt.
const GUARDRAIL_LINES: usize = 60;
/// Lines of the latest run log quoted in the prompt.
pub const LOG_TAIL_LINES: usize = 80;

/// Everything the generator is told about one attempt.
#[derive(Debug, Clone, Default)]
pub struct PatchRequest {
    pub cwd: PathBuf,
    /// Human-readable scope, e.g. `feature spec 'demo'`
    pub scope_label: String,
    pub allowed_prefixes: Vec<String>,
    pub tracked_document: Option<String>,
    pub max_files: usize,
    pub max_lines: usize,
    pub failure: Option<FirstFailure>,
    pub guardrails: Option<String>,
    pub log_tail: String,
}

impl PatchRequest {
    pub fn new(cwd: &Path, scope_label: impl Into<String>) -> Self {
        Self {
            cwd: cwd.to_path_buf(),
            scope_label: scope_label.into(),
            ..Default::default()
        }
    }

    pub fn with_limits(mut self, max_files: usize, max_lines: usize) -> Self {
        self.max_files = max_files;
        self.max_lines = max_lines;
        self
    }

    pub fn with_allowed_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.allowed_prefixes = prefixes;
        self
    }

    pub fn with_tracked_document(mut self, path: Option<String>) -> Self {
        self.tracked_document = path;
        self
    }

    pub fn with_failure(mut self, failure: Option<FirstFailure>) -> Self {
        self.failure = failure;
        self
    }

    /// Quote the head of the guardrails document, if it exists.
    pub fn with_guardrails_from(mut self, repo_root: &Path, rel_path: Option<&str>) -> Self {
        self.guardrails = rel_path.and_then(|rel| {
            let content = fs::read_to_string(repo_root.join(rel)).ok()?;
            let head: Vec<&str> = content.lines().take(GUARDRAIL_LINES).collect();
            (!head.is_empty()).then(|| head.join("\n"))
        });
        self
    }

    pub fn with_log_tail(mut self, tail: String) -> Self {
        self.log_tail = tail;
        self
    }

    /// Render the prompt text sent to the generator.
    pub fn prompt(&self) -> String {
        let mut out = String::new();
        out.push_str("You are repairing a failing verification run.\n\n");

        out.push_str("## Scope\n");
        out.push_str(&format!("Working on: {}\n", self.scope_label));
        out.push_str("You may only change files under:\n");
        for prefix in &self.allowed_prefixes {
            out.push_str(&format!("- {}\n", prefix));
        }
        if let Some(doc) = &self.tracked_document {
            out.push_str(&format!(
                "You may also append notes to {} under its existing allowed sections. \
                 Never change its status line or headings.\n",
                doc
            ));
        }
        if self.max_files > 0 {
            out.push_str(&format!(
                "Keep the change to at most {} files and {} changed lines.\n",
                self.max_files, self.max_lines
            ));
        }

        if let Some(failure) = &self.failure {
            out.push_str("\n## First failure\n");
            out.push_str(&format!(
                "Stage {} ({})\nCommand: {}\nReason: {}\n",
                failure.id,
                failure.description,
                failure.command,
                truncate(&failure.reason, 400)
            ));
        }

        if let Some(guardrails) = &self.guardrails {
            out.push_str("\n## Guardrails\n");
            out.push_str(guardrails);
            out.push('\n');
        }

        if !self.log_tail.trim().is_empty() {
            out.push_str("\n## Recent output\n```\n");
            out.push_str(&self.log_tail);
            if !self.log_tail.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("```\n");
        }

        out.push_str(
            "\n## Response format\n\
             Reply with exactly one unified diff inside a ```diff fenced block. \
             Paths are relative to the repository root. Do not add network access, \
             randomness, wall-clock reads, or skip markers to tests.\n",
        );
        out
    }
}

pub trait PatchGenerator {
    /// Program the generator depends on, checked before each request.
    fn required_tool(&self) -> Option<&str> {
        None
    }

    /// Produce raw text for one request. Called at most once per pass.
    fn generate(&mut self, request: &PatchRequest) -> Result<String>;
}

/// Runs a shell command with the prompt on stdin and returns its stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command_line: String,
    timeout: Duration,
}

impl CommandGenerator {
    pub fn new(command_line: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command_line: command_line.into(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Option<Self> {
        let command = config.generator_command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }
        Some(Self::new(
            command,
            Duration::from_secs(config.generator_timeout_secs),
        ))
    }
}

impl PatchGenerator for CommandGenerator {
    fn required_tool(&self) -> Option<&str> {
        command_program(&self.command_line)
    }

    fn generate(&mut self, request: &PatchRequest) -> Result<String> {
        let prompt = request.prompt();
        let mut command = shell_command(&request.cwd, &self.command_line);
        info!(command = %self.command_line, prompt_chars = prompt.len(), "requesting patch");

        let result =
            run_command_with_input(&mut command, Some(&prompt), Some(self.timeout)).map_err(|e| {
                anyhow::anyhow!("Failed to run generator '{}': {}", self.command_line, e)
            })?;
        if result.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "generator timed out");
        } else if !result.success() {
            warn!(
                status = ?result.status.and_then(|s| s.code()),
                stderr = %truncate(result.stderr.trim(), 200),
                "generator exited with failure"
            );
        }
        Ok(result.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(root: &Path) -> PatchRequest {
        PatchRequest::new(root, "feature spec 'demo'")
            .with_allowed_prefixes(vec!["tests/feature_specs/demo/".to_string()])
            .with_tracked_document(Some("docs/LEDGER.md".to_string()))
            .with_limits(6, 300)
            .with_failure(Some(FirstFailure {
                id: "01.1".to_string(),
                description: "Feature spec 'demo' passes".to_string(),
                command: "python -m pytest -x -q tests/feature_specs/demo/".to_string(),
                reason: "E   assert 1 == 2".to_string(),
            }))
            .with_log_tail("FAILED test_x.py::test_a\n".to_string())
    }

    #[test]
    fn test_prompt_contains_scope_guardrails_and_log_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let guardrails: String = (1..=100).map(|i| format!("rule {i}\n")).collect();
        fs::write(tmp.path().join("AGENTS.md"), guardrails).unwrap();

        let prompt = request(tmp.path())
            .with_guardrails_from(tmp.path(), Some("AGENTS.md"))
            .prompt();
        assert!(prompt.contains("- tests/feature_specs/demo/"));
        assert!(prompt.contains("docs/LEDGER.md"));
        assert!(prompt.contains("at most 6 files and 300 changed lines"));
        assert!(prompt.contains("Stage 01.1"));
        assert!(prompt.contains("rule 60\n"));
        assert!(!prompt.contains("rule 61\n"));
        assert!(prompt.contains("FAILED test_x.py::test_a"));
    }

    #[test]
    fn test_missing_guardrails_document_is_omitted() {
        let tmp = tempfile::tempdir().unwrap();
        let prompt = request(tmp.path())
            .with_guardrails_from(tmp.path(), Some("AGENTS.md"))
            .prompt();
        assert!(!prompt.contains("## Guardrails"));
    }

    #[test]
    fn test_command_generator_reads_prompt_from_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let mut generator = CommandGenerator::new("grep -c 'Working on'", Duration::from_secs(10));
        assert_eq!(generator.required_tool(), Some("grep"));
        let output = generator.generate(&request(tmp.path())).unwrap();
        assert_eq!(output.trim(), "1");
    }

    #[test]
    fn test_from_config_requires_a_command() {
        assert!(CommandGenerator::from_config(&Config::default()).is_none());
        let config = Config {
            generator_command: Some("llm-patch --model local".to_string()),
            ..Config::default()
        };
        let generator = CommandGenerator::from_config(&config).unwrap();
        assert_eq!(generator.required_tool(), Some("llm-patch"));
    }
}
