//! Configuration for patchwarden
//!
//! Read from `<repo>/.patchwarden.toml`, then overridden by `PATCHWARDEN_*`
//! environment variables. Every numeric ceiling falls back to its documented
//! default when missing, unparseable, or zero.

use crate::error::InfraError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_FILE: &str = ".patchwarden.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Most files a single patch may touch
    #[serde(default = "default_max_patch_files")]
    pub max_patch_files: usize,
    /// Most added+removed lines a single patch may carry
    #[serde(default = "default_max_patch_lines")]
    pub max_patch_lines: usize,
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
    /// Coverage percentage the coverage stage must reach
    #[serde(default = "default_coverage_min")]
    pub coverage_min: f64,
    /// Package or directory measured by the coverage stage; `None` disables it
    #[serde(default = "default_coverage_target")]
    pub coverage_target: Option<String>,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    /// Timeout for the collect-only test count
    #[serde(default = "default_collect_timeout_secs")]
    pub collect_timeout_secs: u64,
    #[serde(default = "default_generator_timeout_secs")]
    pub generator_timeout_secs: u64,
    /// Lines of stage output kept in memory per StageResult
    #[serde(default = "default_output_tail_lines")]
    pub output_tail_lines: usize,
    /// Globs (or plain files/directories) whose content must not drift
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
    /// Path prefixes a patch may touch in global mode
    #[serde(default = "default_runtime_allowlist")]
    pub runtime_allowlist: Vec<String>,
    /// Directory holding one sub-directory per feature spec (scoped mode)
    #[serde(default = "default_spec_root")]
    pub spec_root: String,
    #[serde(default = "default_test_root")]
    pub test_root: String,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub stages: StageCommands,
    /// Auto-format commands; the target paths are appended to each
    #[serde(default = "default_format_commands")]
    pub format_commands: Vec<String>,
    /// Shell command that receives the prompt on stdin and prints a diff
    #[serde(default)]
    pub generator_command: Option<String>,
    #[serde(default = "default_llm_enabled")]
    pub llm_enabled: bool,
    /// Document whose head is quoted to the generator as guardrails
    #[serde(default = "default_guardrails_path")]
    pub guardrails_path: Option<String>,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

/// The one tracked document a patch may edit besides its scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: String,
    /// Headings under which lines may be inserted
    #[serde(default = "default_ledger_sections")]
    pub allowed_sections: Vec<String>,
    /// Lines matching this pattern may never be added or removed
    #[serde(default = "default_status_pattern")]
    pub status_pattern: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            allowed_sections: default_ledger_sections(),
            status_pattern: default_status_pattern(),
        }
    }
}

/// Command lines for each ladder stage. A stage whose program is not on
/// PATH is left out of the ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCommands {
    #[serde(default = "default_test_runner")]
    pub test_runner: String,
    #[serde(default = "default_lint")]
    pub lint: Option<String>,
    #[serde(default = "default_format_check")]
    pub format_check: Option<String>,
    #[serde(default = "default_typecheck")]
    pub typecheck: Option<String>,
    #[serde(default)]
    pub security: Option<String>,
    #[serde(default = "default_build")]
    pub build: Option<String>,
}

impl Default for StageCommands {
    fn default() -> Self {
        Self {
            test_runner: default_test_runner(),
            lint: default_lint(),
            format_check: default_format_check(),
            typecheck: default_typecheck(),
            security: None,
            build: default_build(),
        }
    }
}

fn default_max_patch_files() -> usize {
    6
}

fn default_max_patch_lines() -> usize {
    300
}

fn default_max_passes() -> u32 {
    3
}

fn default_coverage_min() -> f64 {
    80.0
}

fn default_coverage_target() -> Option<String> {
    Some("src".to_string())
}

fn default_stage_timeout_secs() -> u64 {
    600
}

fn default_collect_timeout_secs() -> u64 {
    120
}

fn default_generator_timeout_secs() -> u64 {
    900
}

fn default_output_tail_lines() -> usize {
    40
}

fn default_protected_paths() -> Vec<String> {
    vec![
        "tests/".to_string(),
        CONFIG_FILE.to_string(),
        "pyproject.toml".to_string(),
    ]
}

fn default_runtime_allowlist() -> Vec<String> {
    vec!["src/".to_string()]
}

fn default_spec_root() -> String {
    "tests/feature_specs".to_string()
}

fn default_test_root() -> String {
    "tests".to_string()
}

fn default_format_commands() -> Vec<String> {
    vec!["ruff format".to_string(), "ruff check --fix".to_string()]
}

fn default_llm_enabled() -> bool {
    true
}

fn default_guardrails_path() -> Option<String> {
    Some("AGENTS.md".to_string())
}

fn default_state_dir() -> String {
    ".patchwarden".to_string()
}

fn default_ledger_path() -> String {
    "docs/LEDGER.md".to_string()
}

fn default_ledger_sections() -> Vec<String> {
    vec!["Notes".to_string(), "Changelog".to_string()]
}

fn default_status_pattern() -> String {
    r"^\s*status\s*:".to_string()
}

fn default_test_runner() -> String {
    "python -m pytest".to_string()
}

fn default_lint() -> Option<String> {
    Some("ruff check".to_string())
}

fn default_format_check() -> Option<String> {
    Some("ruff format --check".to_string())
}

fn default_typecheck() -> Option<String> {
    Some("mypy src".to_string())
}

fn default_build() -> Option<String> {
    Some("python -m compileall -q src".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_patch_files: default_max_patch_files(),
            max_patch_lines: default_max_patch_lines(),
            max_passes: default_max_passes(),
            coverage_min: default_coverage_min(),
            coverage_target: default_coverage_target(),
            stage_timeout_secs: default_stage_timeout_secs(),
            collect_timeout_secs: default_collect_timeout_secs(),
            generator_timeout_secs: default_generator_timeout_secs(),
            output_tail_lines: default_output_tail_lines(),
            protected_paths: default_protected_paths(),
            runtime_allowlist: default_runtime_allowlist(),
            spec_root: default_spec_root(),
            test_root: default_test_root(),
            ledger: LedgerConfig::default(),
            stages: StageCommands::default(),
            format_commands: default_format_commands(),
            generator_command: None,
            llm_enabled: default_llm_enabled(),
            guardrails_path: default_guardrails_path(),
            state_dir: default_state_dir(),
        }
    }
}

impl Config {
    /// Load config for a repository, or return defaults.
    ///
    /// Environment overrides are applied on top of whatever was loaded.
    pub fn load(repo_root: &Path) -> Self {
        let mut config = Self::load_file(&repo_root.join(CONFIG_FILE));
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn load_file(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match toml::from_str::<Config>(&content) {
            Ok(config) => config.sanitized(),
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Apply `PATCHWARDEN_*` overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("PATCHWARDEN_MAX_FILES") {
            self.max_patch_files = parse_positive(&v).unwrap_or_else(default_max_patch_files);
        }
        if let Some(v) = lookup("PATCHWARDEN_MAX_LINES") {
            self.max_patch_lines = parse_positive(&v).unwrap_or_else(default_max_patch_lines);
        }
        if let Some(v) = lookup("PATCHWARDEN_MAX_PASSES") {
            self.max_passes = parse_positive(&v).unwrap_or_else(default_max_passes);
        }
        if let Some(v) = lookup("PATCHWARDEN_COVERAGE_MIN") {
            self.coverage_min = v
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite() && (0.0..=100.0).contains(n))
                .unwrap_or_else(default_coverage_min);
        }
        if let Some(v) = lookup("PATCHWARDEN_STAGE_TIMEOUT_SECS") {
            self.stage_timeout_secs =
                parse_positive(&v).unwrap_or_else(default_stage_timeout_secs);
        }
        if let Some(v) = lookup("PATCHWARDEN_PROTECTED_PATHS") {
            let paths: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            if !paths.is_empty() {
                self.protected_paths = paths;
            }
        }
        if let Some(v) = lookup("PATCHWARDEN_GENERATOR_CMD") {
            let v = v.trim();
            if !v.is_empty() {
                self.generator_command = Some(v.to_string());
            }
        }
        if let Some(v) = lookup("PATCHWARDEN_LLM") {
            self.llm_enabled = !matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "0" | "false" | "off" | "no"
            );
        }
    }

    /// Replace zero ceilings from a config file with defaults.
    fn sanitized(mut self) -> Self {
        if self.max_patch_files == 0 {
            self.max_patch_files = default_max_patch_files();
        }
        if self.max_patch_lines == 0 {
            self.max_patch_lines = default_max_patch_lines();
        }
        if self.max_passes == 0 {
            self.max_passes = default_max_passes();
        }
        if self.stage_timeout_secs == 0 {
            self.stage_timeout_secs = default_stage_timeout_secs();
        }
        if self.collect_timeout_secs == 0 {
            self.collect_timeout_secs = default_collect_timeout_secs();
        }
        if self.generator_timeout_secs == 0 {
            self.generator_timeout_secs = default_generator_timeout_secs();
        }
        if !self.coverage_min.is_finite() || !(0.0..=100.0).contains(&self.coverage_min) {
            self.coverage_min = default_coverage_min();
        }
        self
    }

    /// Reject settings that would make later stages misbehave.
    pub fn validate(&self) -> Result<(), InfraError> {
        regex::Regex::new(&self.ledger.status_pattern).map_err(|e| {
            InfraError::Config(format!(
                "ledger.status_pattern '{}' is not a valid regex: {}",
                self.ledger.status_pattern, e
            ))
        })?;
        if self.stages.test_runner.trim().is_empty() {
            return Err(InfraError::Config(
                "stages.test_runner must not be empty".to_string(),
            ));
        }
        if self.state_dir.trim().is_empty() {
            return Err(InfraError::Config("state_dir must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn state_dir(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.state_dir)
    }

    /// Path prefix of one feature spec directory.
    pub fn scope_prefix(&self, spec: &str) -> String {
        format!(
            "{}/{}/",
            self.spec_root.trim_end_matches('/'),
            spec.trim_matches('/')
        )
    }
}

fn parse_positive<T>(raw: &str) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    raw.trim().parse::<T>().ok().filter(|n| *n > T::default())
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("toml.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}
