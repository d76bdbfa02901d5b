//! Structural rule for the one tracked document a patch may edit.
//!
//! The document is markdown. Lines matching the status pattern are frozen,
//! heading lines are frozen, and every inserted or removed line must sit
//! under an allowed heading. The enclosing heading is the nearest heading
//! line above the change, looking first through the hunk and then through
//! the committed baseline. A change with no heading above it is rejected.

use crate::diff::{DiffLine, FileDiff};
use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerViolation {
    StatusField { line: String },
    HeadingChanged { line: String },
    OutsideAllowedSection { heading: Option<String>, line: String },
    BinaryEdit,
}

impl fmt::Display for LedgerViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerViolation::StatusField { line } => {
                write!(f, "status field line may not change: '{}'", line.trim())
            }
            LedgerViolation::HeadingChanged { line } => {
                write!(f, "section heading may not change: '{}'", line.trim())
            }
            LedgerViolation::OutsideAllowedSection { heading, line } => match heading {
                Some(h) => write!(f, "'{}' is under section '{}'", line.trim(), h),
                None => write!(f, "'{}' precedes the first section heading", line.trim()),
            },
            LedgerViolation::BinaryEdit => write!(f, "binary edit"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerRules {
    status_pattern: Regex,
    allowed_sections: Vec<String>,
}

impl LedgerRules {
    pub fn new(status_pattern: &str, allowed_sections: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            status_pattern: Regex::new(status_pattern)?,
            allowed_sections: allowed_sections
                .iter()
                .map(|s| normalize_heading(s))
                .collect(),
        })
    }

    /// Check one file section of the tracked document against its committed
    /// content (`None` when the document is new).
    pub fn check(&self, file: &FileDiff, baseline: Option<&str>) -> Result<(), LedgerViolation> {
        if file.binary {
            return Err(LedgerViolation::BinaryEdit);
        }
        let baseline_lines: Vec<&str> = baseline
            .map(|b| b.lines().collect())
            .unwrap_or_default();

        for hunk in &file.hunks {
            // Lines of the baseline that precede this hunk. A zero-length old
            // range names the line *after which* the hunk inserts.
            let before_hunk = if hunk.old_count == 0 {
                hunk.old_start
            } else {
                hunk.old_start.saturating_sub(1)
            }
            .min(baseline_lines.len());
            let prefix = &baseline_lines[..before_hunk];

            for (idx, line) in hunk.lines.iter().enumerate() {
                let (text, in_new_file) = match line {
                    DiffLine::Context(_) => continue,
                    DiffLine::Add(s) => (s.as_str(), true),
                    DiffLine::Remove(s) => (s.as_str(), false),
                };

                if self.status_pattern.is_match(text) {
                    return Err(LedgerViolation::StatusField {
                        line: text.to_string(),
                    });
                }
                if is_heading(text) {
                    return Err(LedgerViolation::HeadingChanged {
                        line: text.to_string(),
                    });
                }

                let heading = nearest_heading(&hunk.lines[..idx], prefix, in_new_file);
                let allowed = heading
                    .as_deref()
                    .map(|h| {
                        let h = normalize_heading(h);
                        self.allowed_sections.iter().any(|a| *a == h)
                    })
                    .unwrap_or(false);
                if !allowed {
                    return Err(LedgerViolation::OutsideAllowedSection {
                        heading: heading.map(|h| heading_text(&h)),
                        line: text.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Scan upward from a change. Insertions see the new-file view (context and
/// added lines); removals see the old-file view (context and removed lines).
fn nearest_heading(
    hunk_before: &[DiffLine],
    baseline_prefix: &[&str],
    new_view: bool,
) -> Option<String> {
    for line in hunk_before.iter().rev() {
        let visible = match line {
            DiffLine::Context(_) => true,
            DiffLine::Add(_) => new_view,
            DiffLine::Remove(_) => !new_view,
        };
        if visible && is_heading(line.content()) {
            return Some(line.content().to_string());
        }
    }
    baseline_prefix
        .iter()
        .rev()
        .find(|l| is_heading(l))
        .map(|l| l.to_string())
}

fn is_heading(line: &str) -> bool {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map(|c| c.is_whitespace())
            .unwrap_or(true)
}

fn heading_text(line: &str) -> String {
    line.trim().trim_start_matches('#').trim().to_string()
}

fn normalize_heading(text: &str) -> String {
    heading_text(text).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::parse_patch;

    const BASELINE: &str = "# Ledger
status: draft

## Decisions
- use sqlite

## Notes
- first note
";

    fn rules() -> LedgerRules {
        LedgerRules::new(r"^\s*status\s*:", &["Notes".to_string()]).unwrap()
    }

    fn check(diff: &str) -> Result<(), LedgerViolation> {
        let patch = parse_patch(diff).unwrap();
        rules().check(&patch.files[0], Some(BASELINE))
    }

    #[test]
    fn test_append_under_allowed_section_passes() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -7,2 +7,3 @@
 ## Notes
 - first note
+- second note
";
        assert_eq!(check(diff), Ok(()));
    }

    #[test]
    fn test_heading_found_in_baseline_above_hunk() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -8 +8,2 @@
 - first note
+- second note
";
        assert_eq!(check(diff), Ok(()));
    }

    #[test]
    fn test_pure_insertion_hunk_uses_line_after_which_it_inserts() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -8,0 +9 @@
+- appended
";
        assert_eq!(check(diff), Ok(()));
    }

    #[test]
    fn test_status_line_rejected_even_in_allowed_section() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -7,2 +7,3 @@
 ## Notes
 - first note
+status: accepted
";
        assert!(matches!(check(diff), Err(LedgerViolation::StatusField { .. })));
    }

    #[test]
    fn test_status_change_at_top_rejected() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -1,2 +1,2 @@
 # Ledger
-status: draft
+status: accepted
";
        assert!(matches!(check(diff), Err(LedgerViolation::StatusField { .. })));
    }

    #[test]
    fn test_insertion_under_disallowed_section_rejected() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -4,2 +4,3 @@
 ## Decisions
 - use sqlite
+- use postgres
";
        match check(diff) {
            Err(LedgerViolation::OutsideAllowedSection { heading, .. }) => {
                assert_eq!(heading.as_deref(), Some("Decisions"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_insertion_before_first_heading_rejected() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -0,0 +1 @@
+preamble
";
        assert_eq!(
            check(diff),
            Err(LedgerViolation::OutsideAllowedSection {
                heading: None,
                line: "preamble".to_string()
            })
        );
    }

    #[test]
    fn test_removal_outside_allowed_section_rejected() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -4,2 +4,1 @@
 ## Decisions
-- use sqlite
";
        assert!(matches!(
            check(diff),
            Err(LedgerViolation::OutsideAllowedSection { .. })
        ));
    }

    #[test]
    fn test_new_heading_rejected() {
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -8 +8,2 @@
 - first note
+## Extra
";
        assert!(matches!(check(diff), Err(LedgerViolation::HeadingChanged { .. })));
    }

    #[test]
    fn test_heading_detection() {
        assert!(is_heading("## Notes"));
        assert!(is_heading("#"));
        assert!(!is_heading("#hashtag"));
        assert!(!is_heading("plain"));
        assert_eq!(normalize_heading("##  Notes  "), "notes");
    }
}
