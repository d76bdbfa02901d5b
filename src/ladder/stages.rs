//! Declarative stage list.
//!
//! [`build_stages`] is the only place that decides which commands a ladder
//! run executes. It is a pure function of the mode, the configuration, and
//! a tool-availability check, so it is rebuilt for every run.

use crate::config::Config;
use crate::error::InfraError;
use crate::util::command_program;
use serde::Serialize;
use std::time::Duration;

/// Which part of the repository a run verifies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Mode {
    Global,
    /// One feature spec directory under the spec root
    Scoped { spec: String },
}

impl Mode {
    /// Scoped mode for `spec`, which must name one directory directly under
    /// the spec root. Surrounding slashes are dropped.
    pub fn scoped(spec: &str) -> Result<Self, InfraError> {
        let name = spec.trim_matches('/');
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return Err(InfraError::InvalidScope {
                spec: spec.to_string(),
            });
        }
        Ok(Mode::Scoped {
            spec: name.to_string(),
        })
    }

    /// Re-check a mode built directly from its variant.
    pub fn validate(&self) -> Result<(), InfraError> {
        match self {
            Mode::Global => Ok(()),
            Mode::Scoped { spec } => Mode::scoped(spec).map(drop),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Mode::Global => "global",
            Mode::Scoped { .. } => "scoped",
        }
    }

    pub fn spec(&self) -> Option<&str> {
        match self {
            Mode::Global => None,
            Mode::Scoped { spec } => Some(spec),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stage {
    /// `NN.M`: group number, then position within the group
    pub id: String,
    pub description: String,
    pub command: String,
    pub timeout: Option<Duration>,
    /// Failure of this stage means the coverage threshold was missed
    pub coverage: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageGroup {
    pub title: String,
    pub stages: Vec<Stage>,
    /// Stages may run concurrently
    pub parallel: bool,
}

/// Build the ordered stage groups for one run. Tool-backed stages whose
/// program `tool_available` rejects are omitted, and groups left without
/// stages are dropped.
pub fn build_stages<F>(mode: &Mode, config: &Config, tool_available: F) -> Vec<StageGroup>
where
    F: Fn(&str) -> bool,
{
    let timeout = Some(Duration::from_secs(config.stage_timeout_secs));
    let runner = config.stages.test_runner.trim();
    let test_root = config.test_root.trim_end_matches('/');
    let available = |command: &str| command_program(command).is_some_and(&tool_available);

    let mut groups = Vec::new();
    let mut push_group = |number: u8, title: &str, parallel: bool, entries: Vec<(String, String, bool)>| {
        let stages: Vec<Stage> = entries
            .into_iter()
            .filter(|(_, command, _)| available(command))
            .enumerate()
            .map(|(i, (description, command, coverage))| Stage {
                id: format!("{:02}.{}", number, i + 1),
                description,
                command,
                timeout,
                coverage,
            })
            .collect();
        if !stages.is_empty() {
            groups.push(StageGroup {
                title: title.to_string(),
                stages,
                parallel,
            });
        }
    };

    push_group(
        0,
        "Health",
        false,
        vec![
            (
                "Test runner responds".to_string(),
                format!("{runner} --version"),
                false,
            ),
            (
                "No whitespace errors in working tree".to_string(),
                "git diff --check".to_string(),
                false,
            ),
        ],
    );

    if let Mode::Scoped { spec } = mode {
        push_group(
            1,
            "Scoped smoke",
            false,
            vec![(
                format!("Feature spec '{spec}' passes"),
                format!("{runner} -x -q {}", config.scope_prefix(spec)),
                false,
            )],
        );
    }

    push_group(
        2,
        "Test grid",
        false,
        vec![(
            "Full test suite".to_string(),
            format!("{runner} -q {test_root}"),
            false,
        )],
    );

    if let Some(target) = config.coverage_target.as_deref().filter(|t| !t.trim().is_empty()) {
        push_group(
            3,
            "Coverage",
            false,
            vec![(
                format!("Coverage of {target} >= {}%", config.coverage_min),
                format!(
                    "{runner} -q --cov={target} --cov-report=term --cov-fail-under={} {test_root}",
                    config.coverage_min
                ),
                true,
            )],
        );
    }

    let mut security_build = Vec::new();
    if let Some(command) = config.stages.security.as_deref() {
        security_build.push(("Security scan".to_string(), command.to_string(), false));
    }
    if let Some(command) = config.stages.build.as_deref() {
        security_build.push(("Sources compile".to_string(), command.to_string(), false));
    }
    push_group(4, "Security & build", false, security_build);

    let mut gates = Vec::new();
    if let Some(command) = config.stages.lint.as_deref() {
        gates.push(("Lint".to_string(), command.to_string(), false));
    }
    if let Some(command) = config.stages.format_check.as_deref() {
        gates.push(("Formatting".to_string(), command.to_string(), false));
    }
    if let Some(command) = config.stages.typecheck.as_deref() {
        gates.push(("Type check".to_string(), command.to_string(), false));
    }
    push_group(5, "Style & type gates", true, gates);

    groups
}

/// Command that lists tests without running them.
pub fn collect_command(config: &Config) -> String {
    format!(
        "{} --collect-only -q {}",
        config.stages.test_runner.trim(),
        config.test_root.trim_end_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(groups: &[StageGroup]) -> Vec<String> {
        groups
            .iter()
            .flat_map(|g| g.stages.iter().map(|s| s.id.clone()))
            .collect()
    }

    #[test]
    fn test_global_mode_with_all_tools() {
        let groups = build_stages(&Mode::Global, &Config::default(), |_| true);
        let titles: Vec<&str> = groups.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Health", "Test grid", "Coverage", "Security & build", "Style & type gates"]
        );
        assert_eq!(
            ids(&groups),
            vec!["00.1", "00.2", "02.1", "03.1", "04.1", "05.1", "05.2", "05.3"]
        );
        assert!(groups.iter().all(|g| g.parallel == (g.title == "Style & type gates")));
        let coverage = &groups[2].stages[0];
        assert!(coverage.coverage);
        assert!(coverage.command.contains("--cov=src"));
        assert!(coverage.command.contains("--cov-fail-under=80"));
    }

    #[test]
    fn test_scoped_mode_adds_smoke_group() {
        let mode = Mode::Scoped {
            spec: "demo".to_string(),
        };
        let groups = build_stages(&mode, &Config::default(), |_| true);
        assert_eq!(groups[1].title, "Scoped smoke");
        assert_eq!(
            groups[1].stages[0].command,
            "python -m pytest -x -q tests/feature_specs/demo/"
        );
    }

    #[test]
    fn test_missing_tools_drop_stages_and_empty_groups() {
        let groups = build_stages(&Mode::Global, &Config::default(), |program| {
            matches!(program, "python" | "git")
        });
        let titles: Vec<&str> = groups.iter().map(|g| g.title.as_str()).collect();
        assert_eq!(titles, vec!["Health", "Test grid", "Coverage", "Security & build"]);
    }

    #[test]
    fn test_coverage_group_needs_a_target() {
        let config = Config {
            coverage_target: None,
            ..Config::default()
        };
        let groups = build_stages(&Mode::Global, &config, |_| true);
        assert!(groups.iter().all(|g| g.title != "Coverage"));
        assert!(groups
            .iter()
            .flat_map(|g| &g.stages)
            .all(|s| !s.coverage));
    }

    #[test]
    fn test_scoped_mode_rejects_names_that_leave_the_spec_root() {
        assert_eq!(
            Mode::scoped("/demo/").unwrap(),
            Mode::Scoped {
                spec: "demo".to_string()
            }
        );
        for bad in ["", "/", ".", "..", "../..", "demo/../../etc", "a\\b"] {
            assert!(
                matches!(Mode::scoped(bad), Err(InfraError::InvalidScope { .. })),
                "{bad:?} accepted"
            );
        }
        let sneaky = Mode::Scoped {
            spec: "../..".to_string(),
        };
        assert!(sneaky.validate().is_err());
        assert!(Mode::Global.validate().is_ok());
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = Config::default();
        let a = build_stages(&Mode::Global, &config, |_| true);
        let b = build_stages(&Mode::Global, &config, |_| true);
        assert_eq!(a, b);
    }
}
