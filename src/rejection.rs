//! Typed reasons a candidate patch is refused.
//!
//! Callers branch on the variant; [`Rejection::code`] is the stable
//! identifier written to the result sink and the `Display` impl is the
//! human-readable message.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum Rejection {
    #[error("patch touches paths outside the declared scope: {}", paths.join(", "))]
    OutOfScope { paths: Vec<String> },

    #[error("patch too large: {files} files / {lines} lines (limits {max_files} / {max_lines})")]
    PatchTooLarge {
        files: usize,
        lines: usize,
        max_files: usize,
        max_lines: usize,
    },

    #[error("patch edits a protected field or section of {path}: {detail}")]
    ProtectedFieldOrSection { path: String, detail: String },

    #[error("no usable diff was produced")]
    EmptyDiff,

    #[error("added code uses disallowed constructs: {}", findings.join("; "))]
    HermeticViolation { findings: Vec<String> },

    #[error("patch generation is disabled")]
    LlmDisabled,

    #[error("generator tool unavailable: {tool}")]
    ToolingUnavailable { tool: String },

    #[error("protected paths were modified: {}", paths.join(", "))]
    ProtectedPathsModified { paths: Vec<String> },

    #[error("patch changed paths outside the runtime allowlist: {}", paths.join(", "))]
    NonRuntimeChanges { paths: Vec<String> },

    #[error("collected test count dropped from {before} to {after}")]
    TestCountDecreased { before: usize, after: usize },

    #[error("applied patch spans {files} files / {lines} lines (limits {max_files} / {max_lines})")]
    PatchSizeExceeded {
        files: usize,
        lines: usize,
        max_files: usize,
        max_lines: usize,
    },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::OutOfScope { .. } => "out_of_scope",
            Rejection::PatchTooLarge { .. } => "patch_too_large",
            Rejection::ProtectedFieldOrSection { .. } => "protected_field_or_section",
            Rejection::EmptyDiff => "empty_diff",
            Rejection::HermeticViolation { .. } => "hermetic_violation",
            Rejection::LlmDisabled => "llm_disabled",
            Rejection::ToolingUnavailable { .. } => "tooling_unavailable",
            Rejection::ProtectedPathsModified { .. } => "protected_paths_modified",
            Rejection::NonRuntimeChanges { .. } => "non_runtime_changes",
            Rejection::TestCountDecreased { .. } => "test_count_decreased",
            Rejection::PatchSizeExceeded { .. } => "patch_size_exceeded",
        }
    }
}
