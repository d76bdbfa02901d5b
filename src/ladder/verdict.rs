use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

/// Outcome of one stage execution. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    /// Declaration order across the whole run
    pub index: usize,
    pub id: String,
    pub description: String,
    pub command: String,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub success: bool,
    pub timed_out: bool,
    pub coverage: bool,
    /// Last N lines of combined output
    pub output_tail: String,
    pub failure_reason: Option<String>,
    /// Parsed from the full output of a coverage-bearing stage
    pub coverage_percent: Option<f64>,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstFailure {
    pub id: String,
    pub description: String,
    pub command: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunVerdict {
    pub run_id: u64,
    pub success: bool,
    pub first_failure: Option<FirstFailure>,
    pub coverage_failed: bool,
    pub coverage_target: Option<String>,
    pub coverage_threshold: f64,
    pub coverage_percent: Option<f64>,
    pub results: Vec<StageResult>,
}

/// Fold stage results into a verdict. Results are ordered by declaration
/// index first, so the reported first failure does not depend on the order
/// in which parallel stages finished.
pub fn aggregate(
    run_id: u64,
    mut results: Vec<StageResult>,
    coverage_target: Option<String>,
    coverage_threshold: f64,
) -> RunVerdict {
    results.sort_by_key(|r| r.index);

    let first_failure = results.iter().find(|r| !r.success).map(|r| FirstFailure {
        id: r.id.clone(),
        description: r.description.clone(),
        command: r.command.clone(),
        reason: r
            .failure_reason
            .clone()
            .unwrap_or_else(|| "stage failed".to_string()),
    });
    let coverage_failed = results.iter().any(|r| r.coverage && !r.success);
    let coverage_percent = results.iter().find_map(|r| r.coverage_percent);

    RunVerdict {
        run_id,
        success: first_failure.is_none(),
        first_failure,
        coverage_failed,
        coverage_target,
        coverage_threshold,
        coverage_percent,
        results,
    }
}

/// Percentage from a coverage report's `TOTAL` line. `None` when there is
/// no such line; a missing report is not 0%.
pub fn parse_coverage_percent(output: &str) -> Option<f64> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| Regex::new(r"(?m)^TOTAL\s+.*?\b(\d+(?:\.\d+)?)%\s*$").ok())
        .as_ref()?;
    re.captures_iter(output)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

/// Test count from a collect-only run: `12 tests collected`,
/// `collected 12 items`, or `no tests collected`.
pub fn parse_collected_count(output: &str) -> Option<usize> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| {
            Regex::new(r"(?m)(?:\b(\d+)\s+tests?\s+collected\b|\bcollected\s+(\d+)\s+items?\b|\b(no)\s+tests\s+collected\b)")
                .ok()
        })
        .as_ref()?;
    let caps = re.captures_iter(output).last()?;
    if caps.get(3).is_some() {
        return Some(0);
    }
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}
