//! Patch Guard
//!
//! Structural validation of a proposed diff before it touches disk. Checks
//! run in a fixed order and stop at the first failure:
//!
//! 1. scope containment
//! 2. size bound
//! 3. tracked-document structure
//! 4. non-emptiness
//!
//! Evaluation is a pure function of the diff text and the [`Scope`]; text
//! that does not parse as a diff is treated exactly like an empty diff.

pub mod ledger;

use crate::diff::{parse_patch, PatchSet};
use crate::rejection::Rejection;
pub use ledger::{LedgerRules, LedgerViolation};
use std::path::{Component, Path};

/// Where a patch may write.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    /// A touched path must start with one of these
    pub allowed_prefixes: Vec<String>,
    /// The one document that may be edited outside the prefixes
    pub tracked_document: Option<TrackedDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedDocument {
    pub path: String,
    /// Committed content, `None` when the document does not exist at HEAD
    pub baseline: Option<String>,
}

impl Scope {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            allowed_prefixes: vec![prefix.into()],
            tracked_document: None,
        }
    }

    pub fn with_prefixes(prefixes: &[String]) -> Self {
        Self {
            allowed_prefixes: prefixes.to_vec(),
            tracked_document: None,
        }
    }

    pub fn with_tracked_document(
        mut self,
        path: impl Into<String>,
        baseline: Option<String>,
    ) -> Self {
        self.tracked_document = Some(TrackedDocument {
            path: path.into(),
            baseline,
        });
        self
    }

    pub fn is_tracked_document(&self, path: &str) -> bool {
        self.tracked_document
            .as_ref()
            .map(|doc| doc.path == path)
            .unwrap_or(false)
    }

    /// True when `path` is a plain relative path under an allowed prefix or
    /// equal to the tracked document.
    pub fn contains(&self, path: &str) -> bool {
        if !is_plain_relative(path) {
            return false;
        }
        self.is_tracked_document(path)
            || self
                .allowed_prefixes
                .iter()
                .any(|prefix| path_has_prefix(path, prefix))
    }
}

/// `prefix` matches whole path components: `src` admits `src/a.py`, not `srcx/a.py`.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_start_matches("./");
    if prefix.is_empty() {
        return false;
    }
    if prefix.ends_with('/') {
        path.starts_with(prefix)
    } else {
        path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

fn is_plain_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && !p.is_absolute()
        && p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardLimits {
    pub max_files: usize,
    pub max_lines: usize,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            max_files: 6,
            max_lines: 300,
        }
    }
}

impl GuardLimits {
    /// True when either ceiling is strictly exceeded.
    pub fn exceeded(&self, files: usize, lines: usize) -> bool {
        files > self.max_files || lines > self.max_lines
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Accept,
    Reject(Rejection),
}

impl GuardDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, GuardDecision::Accept)
    }
}

#[derive(Debug, Clone)]
pub struct PatchGuard {
    limits: GuardLimits,
    ledger: LedgerRules,
}

impl PatchGuard {
    pub fn new(limits: GuardLimits, ledger: LedgerRules) -> Self {
        Self { limits, ledger }
    }

    pub fn limits(&self) -> GuardLimits {
        self.limits
    }

    pub fn evaluate(&self, diff: &str, scope: &Scope) -> GuardDecision {
        let patch = parse_patch(diff).unwrap_or_default();
        match self.evaluate_parsed(&patch, scope) {
            Ok(()) => GuardDecision::Accept,
            Err(rejection) => GuardDecision::Reject(rejection),
        }
    }

    fn evaluate_parsed(&self, patch: &PatchSet, scope: &Scope) -> Result<(), Rejection> {
        let outside: Vec<String> = patch
            .touched_paths()
            .into_iter()
            .filter(|p| !scope.contains(p))
            .collect();
        if !outside.is_empty() {
            return Err(Rejection::OutOfScope { paths: outside });
        }

        let files = patch.file_count();
        let lines = patch.changed_line_count();
        if self.limits.exceeded(files, lines) {
            return Err(Rejection::PatchTooLarge {
                files,
                lines,
                max_files: self.limits.max_files,
                max_lines: self.limits.max_lines,
            });
        }

        if let Some(doc) = scope.tracked_document.as_ref() {
            let doc_path = doc.path.as_str();
            for file in patch.files.iter().filter(|f| f.paths().contains(&doc_path)) {
                self.ledger
                    .check(file, doc.baseline.as_deref())
                    .map_err(|violation| Rejection::ProtectedFieldOrSection {
                        path: doc.path.clone(),
                        detail: violation.to_string(),
                    })?;
            }
        }

        if patch.is_empty() {
            return Err(Rejection::EmptyDiff);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(max_files: usize, max_lines: usize) -> PatchGuard {
        PatchGuard::new(
            GuardLimits {
                max_files,
                max_lines,
            },
            LedgerRules::new(r"^\s*status\s*:", &["Notes".to_string()]).unwrap(),
        )
    }

    /// A diff creating `files` new files spread over `lines` added lines.
    fn synthetic_diff(prefix: &str, files: usize, lines: usize) -> String {
        let mut out = String::new();
        for f in 0..files {
            let count = lines / files + usize::from(f < lines % files);
            out.push_str(&format!(
                "--- /dev/null\n+++ b/{prefix}file_{f}.py\n@@ -0,0 +1,{count} @@\n"
            ));
            for l in 0..count {
                out.push_str(&format!("+x_{l} = {l}\n"));
            }
        }
        out
    }

    const DEMO: &str = "tests/feature_specs/demo/";

    #[test]
    fn test_mixed_scope_patch_is_out_of_scope() {
        let diff = "--- a/tests/feature_specs/demo/test_x.py
+++ b/tests/feature_specs/demo/test_x.py
@@ -1 +1,2 @@
 import pytest
+import os
--- a/src/app.py
+++ b/src/app.py
@@ -1 +1 @@
-a = 1
+a = 2
";
        let decision = guard(6, 300).evaluate(diff, &Scope::new(DEMO));
        assert_eq!(
            decision,
            GuardDecision::Reject(Rejection::OutOfScope {
                paths: vec!["src/app.py".to_string()]
            })
        );
    }

    #[test]
    fn test_only_outside_paths_always_out_of_scope() {
        for files in 1..=8 {
            let diff = synthetic_diff("src/", files, files * 3);
            let decision = guard(6, 300).evaluate(&diff, &Scope::new(DEMO));
            assert!(
                matches!(decision, GuardDecision::Reject(Rejection::OutOfScope { .. })),
                "files={files}: {decision:?}"
            );
        }
    }

    #[test]
    fn test_size_bounds_are_inclusive() {
        let g = guard(6, 300);
        let scope = Scope::new(DEMO);
        for (files, lines, accepted) in [
            (6, 300, true),
            (1, 300, true),
            (6, 6, true),
            (7, 7, false),
            (1, 301, false),
            (6, 301, false),
        ] {
            let decision = g.evaluate(&synthetic_diff(DEMO, files, lines), &scope);
            assert_eq!(decision.is_accept(), accepted, "files={files} lines={lines}");
            if !accepted {
                assert!(matches!(
                    decision,
                    GuardDecision::Reject(Rejection::PatchTooLarge { .. })
                ));
            }
        }
    }

    #[test]
    fn test_whitespace_and_garbage_are_empty_diff() {
        let g = guard(6, 300);
        let scope = Scope::new(DEMO);
        for text in ["", "   \n\t\n", "sorry, I can't help", "@@ -1 +1 @@\n+x\n"] {
            assert_eq!(
                g.evaluate(text, &scope),
                GuardDecision::Reject(Rejection::EmptyDiff),
                "{text:?}"
            );
        }
    }

    #[test]
    fn test_tracked_document_status_insert_rejected() {
        let baseline = "# Ledger\nstatus: draft\n\n## Notes\n- one\n".to_string();
        let scope = Scope::new(DEMO).with_tracked_document("docs/LEDGER.md", Some(baseline));
        let diff = "--- a/docs/LEDGER.md
+++ b/docs/LEDGER.md
@@ -4,2 +4,3 @@
 ## Notes
 - one
+status: accepted
";
        let decision = guard(6, 300).evaluate(diff, &scope);
        match decision {
            GuardDecision::Reject(Rejection::ProtectedFieldOrSection { path, .. }) => {
                assert_eq!(path, "docs/LEDGER.md");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_tracked_document_append_accepted_with_scoped_change() {
        let baseline = "# Ledger\n\n## Notes\n- one\n".to_string();
        let scope = Scope::new(DEMO).with_tracked_document("docs/LEDGER.md", Some(baseline));
        let diff = format!(
            "{}--- a/docs/LEDGER.md\n+++ b/docs/LEDGER.md\n@@ -4 +4,2 @@\n - one\n+- two\n",
            synthetic_diff(DEMO, 1, 2)
        );
        assert_eq!(guard(6, 300).evaluate(&diff, &scope), GuardDecision::Accept);
    }

    #[test]
    fn test_traversal_paths_are_never_in_scope() {
        let scope = Scope::new(DEMO);
        assert!(!scope.contains("tests/feature_specs/demo/../../../src/app.py"));
        assert!(!scope.contains("/tests/feature_specs/demo/x.py"));
        assert!(scope.contains("tests/feature_specs/demo/sub/x.py"));
    }

    #[test]
    fn test_prefix_matches_whole_components() {
        assert!(path_has_prefix("src/app.py", "src"));
        assert!(path_has_prefix("src/app.py", "src/"));
        assert!(!path_has_prefix("srcx/app.py", "src"));
        assert!(!path_has_prefix("anything", ""));
    }
}
