//! Hermetic checks on generated code
//!
//! Scans the lines a patch adds to source files for constructs that make
//! tests non-deterministic or reach the network: network clients,
//! unseeded randomness, wall-clock reads, and skip directives.

use crate::diff::PatchSet;
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HermeticRule {
    Network,
    Randomness,
    WallClock,
    SkipDirective,
}

impl HermeticRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            HermeticRule::Network => "network",
            HermeticRule::Randomness => "randomness",
            HermeticRule::WallClock => "wall_clock",
            HermeticRule::SkipDirective => "skip_directive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HermeticViolation {
    pub path: String,
    pub line_no: usize,
    pub rule: HermeticRule,
    pub text: String,
}

impl fmt::Display for HermeticViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} ({})",
            self.path,
            self.line_no,
            self.rule.as_str(),
            crate::util::truncate(self.text.trim(), 80)
        )
    }
}

const SOURCE_EXTENSIONS: &[&str] = &["py", "pyi"];

const NETWORK_PATTERNS: &[&str] = &[
    r"^\s*(import|from)\s+(requests|httpx|aiohttp|urllib3|socket)\b",
    r"^\s*(import|from)\s+(urllib\.request|http\.client)\b",
    r"\b(requests|httpx)\.(get|post|put|patch|delete|head|request|Client|AsyncClient)\b",
    r"\burlopen\s*\(",
    r"\bsocket\.(socket|create_connection)\s*\(",
];

const RANDOMNESS_PATTERNS: &[&str] = &[
    r"^\s*(import|from)\s+(random|secrets)\b",
    r"\brandom\.(random|randint|choice|choices|shuffle|sample|uniform|randrange)\s*\(",
    r"\buuid\.uuid[14]\s*\(",
    r"\bos\.urandom\s*\(",
];

const WALL_CLOCK_PATTERNS: &[&str] = &[
    r"\btime\.(time|time_ns|sleep|monotonic)\s*\(",
    r"\b(datetime|date)\.(now|utcnow|today)\s*\(",
];

const SKIP_PATTERNS: &[&str] = &[
    r"@pytest\.mark\.(skip|skipif|xfail)\b",
    r"\bpytest\.(skip|xfail)\s*\(",
    r"@unittest\.(skip|skipIf|skipUnless|expectedFailure)\b",
];

/// Compiled rule set. Build once per invocation.
#[derive(Debug, Clone)]
pub struct HermeticChecker {
    rules: Vec<(HermeticRule, Regex)>,
}

impl Default for HermeticChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HermeticChecker {
    pub fn new() -> Self {
        let groups: [(HermeticRule, &[&str]); 4] = [
            (HermeticRule::Network, NETWORK_PATTERNS),
            (HermeticRule::Randomness, RANDOMNESS_PATTERNS),
            (HermeticRule::WallClock, WALL_CLOCK_PATTERNS),
            (HermeticRule::SkipDirective, SKIP_PATTERNS),
        ];
        let rules = groups
            .iter()
            .flat_map(|(rule, patterns)| {
                patterns
                    .iter()
                    .filter_map(move |p| Regex::new(p).ok().map(|re| (*rule, re)))
            })
            .collect();
        Self { rules }
    }

    /// Check one line of source text.
    pub fn check_line(&self, line: &str) -> Option<HermeticRule> {
        let code = strip_comment(line);
        if code.trim().is_empty() {
            return None;
        }
        self.rules
            .iter()
            .find(|(_, re)| re.is_match(code))
            .map(|(rule, _)| *rule)
    }

    /// Violations among the lines `patch` adds to source files.
    pub fn check_patch(&self, patch: &PatchSet) -> Vec<HermeticViolation> {
        let mut violations = Vec::new();
        for file in &patch.files {
            if !is_source_path(file.path()) {
                continue;
            }
            for (line_no, text) in file.added_lines() {
                if let Some(rule) = self.check_line(text) {
                    violations.push(HermeticViolation {
                        path: file.path().to_string(),
                        line_no,
                        rule,
                        text: text.to_string(),
                    });
                }
            }
        }
        violations
    }
}

fn is_source_path(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Drop a trailing `#` comment. Quote-aware enough for one-line strings.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '"') | (None, '\'') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '#') => return &line[..i],
            _ => {}
        }
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse_patch;

    #[test]
    fn test_flags_each_rule() {
        let checker = HermeticChecker::new();
        assert_eq!(checker.check_line("import requests"), Some(HermeticRule::Network));
        assert_eq!(
            checker.check_line("    resp = httpx.get(url)"),
            Some(HermeticRule::Network)
        );
        assert_eq!(
            checker.check_line("    n = random.randint(1, 6)"),
            Some(HermeticRule::Randomness)
        );
        assert_eq!(
            checker.check_line("    stamp = datetime.now()"),
            Some(HermeticRule::WallClock)
        );
        assert_eq!(
            checker.check_line("@pytest.mark.skip(reason='flaky')"),
            Some(HermeticRule::SkipDirective)
        );
    }

    #[test]
    fn test_ignores_comments_and_strings_after_hash() {
        let checker = HermeticChecker::new();
        assert_eq!(checker.check_line("# import requests"), None);
        assert_eq!(checker.check_line("x = 1  # time.time() is banned"), None);
        assert_eq!(checker.check_line("label = 'issue #4'"), None);
        assert_eq!(checker.check_line("value = compute(seed=3)"), None);
    }

    #[test]
    fn test_check_patch_reports_added_source_lines_only() {
        let diff = "--- a/tests/test_a.py
+++ b/tests/test_a.py
@@ -1,3 +1,3 @@
 import pytest
-import time
+import socket
 def test_a(): pass
--- a/docs/notes.md
+++ b/docs/notes.md
@@ -1 +1,2 @@
 notes
+use requests.get in prod
";
        let patch = parse_patch(diff).unwrap();
        let violations = HermeticChecker::new().check_patch(&patch);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "tests/test_a.py");
        assert_eq!(violations[0].line_no, 2);
        assert_eq!(violations[0].rule, HermeticRule::Network);
    }
}
